//! Failure classification and reconnect policy
//!
//! Permanent failures (bad credentials, missing permission, exhausted
//! quota, rate limiting, no microphone) end the session in `Error`.
//! Everything else is transient and goes through the retry policy.

use std::time::Duration;

use super::transport::{CloseInfo, TransportError};
use super::LiveError;
use crate::audio::AudioError;

/// Maximum reconnect attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base reconnect delay (doubles each attempt)
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Permanent,
    Transient,
}

/// Why a permanent failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentCause {
    Credentials,
    Permission,
    Quota,
    RateLimit,
    Microphone,
    Speaker,
}

impl PermanentCause {
    pub fn user_message(self) -> &'static str {
        match self {
            PermanentCause::Credentials => {
                "The service rejected the API key. Check your credential configuration."
            }
            PermanentCause::Permission => {
                "This API key is not allowed to use the live model. Check your credential configuration."
            }
            PermanentCause::Quota => {
                "The service quota or billing limit has been reached. Check your account."
            }
            PermanentCause::RateLimit => {
                "The service is rate limiting this key. Wait a moment, then start again."
            }
            PermanentCause::Microphone => {
                "Microphone unavailable. Allow microphone access or connect a device, then start again."
            }
            PermanentCause::Speaker => {
                "No audio output device. Connect speakers or headphones, then start again."
            }
        }
    }
}

/// A classified failure with a one-line message for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
    pub user_message: String,
}

impl Failure {
    pub fn permanent(cause: PermanentCause, detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            detail: detail.into(),
            user_message: cause.user_message().to_string(),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            detail: detail.into(),
            user_message: "Connection to the service failed. Check your network, then start again."
                .to_string(),
        }
    }

    /// Terminal failure after the retry budget is spent
    pub fn retries_exhausted(attempts: u32, last: &Failure) -> Self {
        Self {
            kind: FailureKind::Transient,
            detail: format!("gave up after {} attempts: {}", attempts, last.detail),
            user_message: format!(
                "Could not reconnect after {} attempts. Check your network, then start again.",
                attempts
            ),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == FailureKind::Permanent
    }

    /// Classify free text (close reason, server error)
    pub fn from_text(text: &str) -> Self {
        match classify_text(text) {
            Some(cause) => Self::permanent(cause, text),
            None => Self::transient(text),
        }
    }

    pub fn from_close(close: &CloseInfo) -> Self {
        let detail = if close.reason.is_empty() {
            format!("connection closed (code {})", close.code)
        } else {
            format!("connection closed (code {}): {}", close.code, close.reason)
        };

        match classify_text(&close.reason) {
            Some(cause) => Self::permanent(cause, detail),
            None => Self::transient(detail),
        }
    }

    pub fn from_live_error(err: &LiveError) -> Self {
        match err {
            LiveError::MissingApiKey => Self::permanent(PermanentCause::Credentials, err.to_string()),
            LiveError::Transport(TransportError::Rejected { status, body }) => {
                match classify_status(*status).or_else(|| classify_text(body)) {
                    Some(cause) => Self::permanent(cause, err.to_string()),
                    None => Self::transient(err.to_string()),
                }
            }
            LiveError::Closed {
                code,
                reason,
                clean,
            } => Self::from_close(&CloseInfo {
                code: *code,
                reason: reason.clone(),
                clean: *clean,
            }),
            LiveError::Server(message) => Self::from_text(message),
            LiveError::Transport(_) | LiveError::SetupTimeout | LiveError::Protocol(_) => {
                Self::transient(err.to_string())
            }
        }
    }

    pub fn from_audio_error(err: &AudioError) -> Self {
        if *err == AudioError::NoOutputDevice {
            Self::permanent(PermanentCause::Speaker, err.to_string())
        } else if err.is_permanent() {
            Self::permanent(PermanentCause::Microphone, err.to_string())
        } else {
            Self::transient(err.to_string())
        }
    }
}

fn classify_status(status: u16) -> Option<PermanentCause> {
    match status {
        401 => Some(PermanentCause::Credentials),
        403 => Some(PermanentCause::Permission),
        429 => Some(PermanentCause::RateLimit),
        _ => None,
    }
}

/// Markers of failures that retrying cannot fix
pub fn classify_text(text: &str) -> Option<PermanentCause> {
    const CREDENTIALS: &[&str] = &[
        "api key",
        "api_key",
        "apikey",
        "unauthenticated",
        "unauthorized",
        "credential",
    ];
    const PERMISSION: &[&str] = &["permission", "forbidden", "not authorized"];
    const QUOTA: &[&str] = &["quota", "billing", "resource_exhausted", "resource exhausted"];
    const RATE_LIMIT: &[&str] = &["rate limit", "rate-limit", "ratelimit", "too many requests"];

    let lower = text.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(CREDENTIALS) {
        Some(PermanentCause::Credentials)
    } else if has(PERMISSION) {
        Some(PermanentCause::Permission)
    } else if has(QUOTA) {
        Some(PermanentCause::Quota)
    } else if has(RATE_LIMIT) {
        Some(PermanentCause::RateLimit)
    } else {
        None
    }
}

/// Exponential back-off for unclean disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            base_delay: RECONNECT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// The attempt to make after `attempts` failed ones, if any remain
    pub fn next_attempt(&self, attempts: u32) -> Option<u32> {
        (attempts < self.max_attempts).then_some(attempts + 1)
    }

    /// Delay before `attempt` (1-based): base × 2^attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.min(16))
    }
}
