//! Persona configuration and system instruction assembly

use serde::{Deserialize, Serialize};

use crate::transcript::TranscriptEntry;

/// Appended to every persona prompt
const TURN_TAKING_POLICY: &str = "Keep spoken replies short and conversational. \
Stop talking as soon as the user starts speaking, and answer what they said rather than \
finishing your previous sentence.";

/// Who the assistant plays during a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub id: String,
    pub name: String,
    /// Persona-specific instructions
    pub prompt: String,
    /// Prebuilt voice; the configured default is used when unset
    #[serde(default)]
    pub voice: Option<String>,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            id: "assistant".to_string(),
            name: "Assistant".to_string(),
            prompt: "You are a friendly, concise voice assistant.".to_string(),
            voice: None,
        }
    }
}

impl PersonaConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prompt: prompt.into(),
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

/// Persona prompt + turn-taking policy + recent conversation.
///
/// Context lets a reconnected or recycled connection pick up where the
/// previous one left off.
pub fn build_system_instruction(persona: &PersonaConfig, context: &[&TranscriptEntry]) -> String {
    let mut instruction = persona.prompt.trim().to_string();

    if !instruction.is_empty() {
        instruction.push_str("\n\n");
    }
    instruction.push_str(TURN_TAKING_POLICY);

    let turns: Vec<String> = context
        .iter()
        .filter(|e| !e.text.trim().is_empty())
        .map(|e| format!("{}: {}", e.speaker.label(), e.text.trim()))
        .collect();

    if !turns.is_empty() {
        instruction.push_str("\n\nConversation so far (most recent last):\n");
        instruction.push_str(&turns.join("\n"));
        instruction.push_str("\n\nContinue the conversation naturally from here.");
    }

    instruction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{Speaker, Transcript};

    #[test]
    fn test_instruction_without_context() {
        let persona = PersonaConfig::new("tutor", "Tutor", "You are a Spanish tutor.");
        let instruction = build_system_instruction(&persona, &[]);

        assert!(instruction.starts_with("You are a Spanish tutor."));
        assert!(instruction.contains("Stop talking as soon as the user starts speaking"));
        assert!(!instruction.contains("Conversation so far"));
    }

    #[test]
    fn test_instruction_includes_recent_turns() {
        let mut transcript = Transcript::new();
        transcript.push_final(Speaker::User, "¿Cómo estás?");
        transcript.push_final(Speaker::Assistant, "Muy bien, gracias.");

        let persona = PersonaConfig::default();
        let context = transcript.recent_final(10);
        let instruction = build_system_instruction(&persona, &context);

        assert!(instruction.contains("User: ¿Cómo estás?\nAssistant: Muy bien, gracias."));
    }

    #[test]
    fn test_persona_deserializes_without_voice() {
        let persona: PersonaConfig =
            serde_json::from_str(r#"{"id": "p", "name": "P", "prompt": "x"}"#).unwrap();
        assert_eq!(persona.voice, None);
    }

    #[test]
    fn test_with_voice_overrides_file_voice() {
        let persona: PersonaConfig =
            serde_json::from_str(r#"{"id": "p", "name": "P", "prompt": "x", "voice": "Puck"}"#)
                .unwrap();
        assert_eq!(persona.with_voice("Charon").voice.as_deref(), Some("Charon"));
    }
}
