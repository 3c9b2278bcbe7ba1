//! Coaching backend request and response bodies

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStartRequest {
    pub user_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionStartResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub persona: Option<serde_json::Value>,
    #[serde(default)]
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtteranceRequest {
    pub user_id: String,
    pub session_id: String,
    pub utterance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Coaching reply attached to a transcript entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoachingFeedback {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub detailed_text: String,
    #[serde(default)]
    pub next_actions: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CoachingFeedback {
    /// Text shown to the user: the summary, or the detail if there is none
    pub fn display_text(&self) -> &str {
        if self.summary.trim().is_empty() {
            &self.detailed_text
        } else {
            &self.summary
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UtteranceResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub response: Option<CoachingFeedback>,
    #[serde(default)]
    pub context_used: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRequest {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Learner progress; the backend's extra fields are kept in `extra`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressReport {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub conversation_count: Option<u64>,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub components: serde_json::Value,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy") || self.status.eq_ignore_ascii_case("ok")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PersonaSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonaList {
    #[serde(default)]
    pub personas: Vec<PersonaSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utterance_response_deserialization() {
        let json = r#"{
            "success": true,
            "session_id": "s-1",
            "response": {
                "summary": "Nice use of the subjunctive.",
                "detailed_text": "You said ...",
                "next_actions": ["Try another example"],
                "metadata": {"persona": "tutor"}
            },
            "context_used": true,
            "timestamp": "2026-01-01T00:00:00Z"
        }"#;

        let resp: UtteranceResponse = serde_json::from_str(json).unwrap();
        assert!(resp.success);
        let feedback = resp.response.unwrap();
        assert_eq!(feedback.display_text(), "Nice use of the subjunctive.");
        assert_eq!(feedback.next_actions, vec!["Try another example"]);
        assert_eq!(feedback.metadata["persona"], "tutor");
    }

    #[test]
    fn test_display_text_falls_back_to_detail() {
        let feedback = CoachingFeedback {
            detailed_text: "Only detail".to_string(),
            ..Default::default()
        };
        assert_eq!(feedback.display_text(), "Only detail");
    }

    #[test]
    fn test_progress_keeps_extra_fields() {
        let report: ProgressReport = serde_json::from_str(
            r#"{"user_id": "u", "conversation_count": 3, "streak_days": 4}"#,
        )
        .unwrap();
        assert_eq!(report.conversation_count, Some(3));
        assert_eq!(report.extra["streak_days"], 4);
    }

    #[test]
    fn test_session_start_request_omits_empty_fields() {
        let req = SessionStartRequest {
            user_id: "u".to_string(),
            session_id: "s".to_string(),
            persona_id: None,
            context: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("persona_id").is_none());
        assert!(json.get("context").is_none());
    }
}
