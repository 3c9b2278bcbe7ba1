//! Language-coaching backend
//!
//! Finalized user turns can be posted to a coaching service that replies
//! with a short summary, a detailed explanation and suggested next
//! actions. The session attaches each reply to the transcript entry it
//! answers.

mod client;
mod types;

pub use client::{CoachingClient, DEFAULT_COACHING_URL};
pub use types::{
    CoachingFeedback, HealthResponse, PersonaSummary, ProgressReport, SessionStartResponse,
};

/// Errors talking to the coaching backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoachingError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Coaching API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("{0}")]
    Parse(String),
    #[error("Coaching request rejected: {0}")]
    Rejected(String),
}
