//! Live API protocol types
//!
//! JSON messages exchanged with the Gemini Live `BidiGenerateContent`
//! endpoint over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to the `BidiGenerateContent` endpoint with `?key=<API_KEY>`
//! 2. Send `setup` (model, voice, system instruction, transcription flags)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent` (audio, transcriptions, interrupted, turnComplete)
//! 6. Optionally receive `goAway` shortly before the server ends the session

use serde::{Deserialize, Serialize};

use crate::audio::pcm::{decode_pcm16, encode_pcm16, INPUT_SAMPLE_RATE};

/// Live API WebSocket endpoint (without the `key` query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default live model
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Puck";

/// Content part: either text or inline binary data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Inline binary payload, base64 encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// A conversation turn or system instruction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

/// Empty object used to switch on transcription (`{}` on the wire)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enabled {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

impl SpeechConfig {
    pub fn prebuilt(voice: impl Into<String>) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.into(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// Session configuration sent as the first client frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    pub model: String,
    pub generation_config: GenerationConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,

    /// Transcribe the user's speech
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Enabled>,

    /// Transcribe the model's speech
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Enabled>,
}

impl SetupConfig {
    /// Audio-out session with both transcription directions enabled
    pub fn new(model: &str, voice: &str, system_instruction: &str) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig::prebuilt(voice)),
            },
            system_instruction: (!system_instruction.is_empty())
                .then(|| Content::text(None, system_instruction)),
            input_audio_transcription: Some(Enabled {}),
            output_audio_transcription: Some(Enabled {}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Session configuration, must be the first message
    Setup(SetupConfig),

    /// Streaming microphone audio
    RealtimeInput(RealtimeInput),

    /// A complete text turn
    ClientContent(ClientContent),
}

impl ClientMessage {
    pub fn setup(config: SetupConfig) -> Self {
        Self::Setup(config)
    }

    /// Wrap 16 kHz mono PCM16 samples in a realtime input frame
    pub fn audio(samples: &[i16]) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: format!("audio/pcm;rate={}", INPUT_SAMPLE_RATE),
                data: encode_pcm16(samples),
            }],
        })
    }

    /// A user text turn that asks the model to respond
    pub fn text(text: impl Into<String>) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content::text(Some("user"), text)],
            turn_complete: true,
        })
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,

    #[serde(default)]
    pub input_transcription: Option<Transcription>,

    #[serde(default)]
    pub output_transcription: Option<Transcription>,

    #[serde(default)]
    pub interrupted: bool,

    #[serde(default)]
    pub turn_complete: bool,

    #[serde(default)]
    pub generation_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Error object some proxies forward as a JSON frame
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<i64>,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub status: Option<String>,
}

/// A frame received from the Live API.
///
/// Every field is optional; frames of a type we don't handle deserialize
/// to an empty message instead of failing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub go_away: Option<GoAway>,

    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

/// One decoded server event, in routing order
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// Partial transcription of the user's speech
    InputTranscription(String),
    /// Model audio, already decoded to 24 kHz PCM16
    Audio(Vec<i16>),
    /// Partial transcription of the model's speech
    OutputTranscription(String),
    /// The user started speaking over the model
    Interrupted,
    TurnComplete,
    /// The server will close the connection soon
    GoAway { time_left: Option<String> },
    Error(String),
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten this frame into events.
    ///
    /// Order: input transcription, model audio, output transcription,
    /// interrupted, turn complete. Audio in a frame that also carries
    /// `interrupted` belongs to the cancelled turn and is dropped.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(error) = self.error {
            let message = match error.status {
                Some(status) if !status.is_empty() => format!("{}: {}", status, error.message),
                _ => error.message,
            };
            events.push(ServerEvent::Error(message));
        }

        if let Some(content) = self.server_content {
            if let Some(text) = content.input_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ServerEvent::InputTranscription(text));
                }
            }

            if !content.interrupted {
                let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
                for blob in parts.into_iter().filter_map(|p| p.inline_data) {
                    if !blob.mime_type.starts_with("audio/") {
                        log::debug!("Ignoring inline data of type {}", blob.mime_type);
                        continue;
                    }
                    match decode_pcm16(&blob.data) {
                        Ok(samples) if !samples.is_empty() => {
                            events.push(ServerEvent::Audio(samples))
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("Failed to decode model audio chunk: {}", e),
                    }
                }
            }

            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ServerEvent::OutputTranscription(text));
                }
            }

            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }

            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_serialization() {
        let msg = ClientMessage::setup(SetupConfig::new(
            "gemini-2.0-flash-live-001",
            "Kore",
            "Be brief.",
        ));
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        let setup = &json["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(setup["inputAudioTranscription"], serde_json::json!({}));
        assert_eq!(setup["outputAudioTranscription"], serde_json::json!({}));
    }

    #[test]
    fn test_setup_keeps_model_prefix() {
        let config = SetupConfig::new("models/custom", DEFAULT_VOICE, "");
        assert_eq!(config.model, "models/custom");
        assert!(config.system_instruction.is_none());
    }

    #[test]
    fn test_audio_serialization() {
        let msg = ClientMessage::audio(&[0x1234, 0x5678]);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], encode_pcm16(&[0x1234, 0x5678]));
    }

    #[test]
    fn test_text_serialization() {
        let json: serde_json::Value = serde_json::to_value(ClientMessage::text("hi")).unwrap();

        assert_eq!(json["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(json["clientContent"]["turns"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["clientContent"]["turnComplete"], true);
    }

    #[test]
    fn test_setup_complete_deserialization() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert_eq!(msg.into_events(), vec![ServerEvent::SetupComplete]);
    }

    #[test]
    fn test_server_content_event_order() {
        let audio = encode_pcm16(&[1, 2, 3]);
        let json = format!(
            r#"{{
                "serverContent": {{
                    "turnComplete": true,
                    "outputTranscription": {{"text": "Hi"}},
                    "modelTurn": {{"parts": [{{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{}"}}}}]}},
                    "inputTranscription": {{"text": "Hello"}}
                }}
            }}"#,
            audio
        );

        let msg: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(
            msg.into_events(),
            vec![
                ServerEvent::InputTranscription("Hello".to_string()),
                ServerEvent::Audio(vec![1, 2, 3]),
                ServerEvent::OutputTranscription("Hi".to_string()),
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_interrupted_frame_drops_its_audio() {
        let audio = encode_pcm16(&[9, 9]);
        let json = format!(
            r#"{{"serverContent": {{"interrupted": true, "modelTurn": {{"parts": [{{"inlineData": {{"mimeType": "audio/pcm", "data": "{}"}}}}]}}}}}}"#,
            audio
        );

        let msg: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg.into_events(), vec![ServerEvent::Interrupted]);
    }

    #[test]
    fn test_empty_transcriptions_are_skipped() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"serverContent": {"inputTranscription": {"text": ""}, "outputTranscription": {}}}"#,
        )
        .unwrap();
        assert!(msg.into_events().is_empty());
    }

    #[test]
    fn test_go_away_deserialization() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"goAway": {"timeLeft": "50s"}}"#).unwrap();
        assert_eq!(
            msg.into_events(),
            vec![ServerEvent::GoAway {
                time_left: Some("50s".to_string())
            }]
        );
    }

    #[test]
    fn test_error_frame() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg.into_events(),
            vec![ServerEvent::Error(
                "RESOURCE_EXHAUSTED: Quota exceeded".to_string()
            )]
        );
    }

    #[test]
    fn test_unknown_message_type() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"toolCall": {"functionCalls": []}}"#).unwrap();
        assert!(msg.into_events().is_empty());
    }
}
