//! Coaching backend REST client.
//!
//! # Retry Strategy
//!
//! Network errors, HTTP 429 and 5xx responses are retried up to 3 times
//! with exponential backoff (500ms, 1s, 2s). Other 4xx responses are
//! returned immediately.

use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::types::{
    CoachingFeedback, HealthResponse, PersonaList, PersonaSummary, ProgressReport,
    ProgressRequest, SessionStartRequest, SessionStartResponse, UtteranceRequest,
    UtteranceResponse,
};
use super::CoachingError;

/// Default coaching backend address
pub const DEFAULT_COACHING_URL: &str = "http://127.0.0.1:8000";

/// Maximum retries after the first attempt
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the coaching backend
#[derive(Debug, Clone)]
pub struct CoachingClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    max_retries: u32,
    base_delay: Duration,
}

impl CoachingClient {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            max_retries: MAX_RETRIES,
            base_delay: RETRY_BASE_DELAY,
        }
    }

    /// Override the retry budget and base delay
    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Register a coaching session
    pub async fn start_session(
        &self,
        session_id: &str,
        persona_id: Option<&str>,
    ) -> Result<SessionStartResponse, CoachingError> {
        let body = SessionStartRequest {
            user_id: self.user_id.clone(),
            session_id: session_id.to_string(),
            persona_id: persona_id.map(str::to_string),
            context: None,
        };

        let resp: SessionStartResponse = self
            .send_with_retry("session/start", || {
                self.http.post(self.url("session/start")).json(&body)
            })
            .await?;

        if !resp.success {
            return Err(CoachingError::Rejected(
                resp.message.unwrap_or_else(|| "session start rejected".to_string()),
            ));
        }

        log::info!("Coaching session registered: {}", session_id);
        Ok(resp)
    }

    /// Post one user utterance and return the coaching reply
    pub async fn utterance(
        &self,
        session_id: &str,
        utterance: &str,
    ) -> Result<CoachingFeedback, CoachingError> {
        let body = UtteranceRequest {
            user_id: self.user_id.clone(),
            session_id: session_id.to_string(),
            utterance: utterance.to_string(),
            context: None,
        };

        let resp: UtteranceResponse = self
            .send_with_retry("utterance", || {
                self.http.post(self.url("utterance")).json(&body)
            })
            .await?;

        if !resp.success {
            return Err(CoachingError::Rejected(
                resp.error.unwrap_or_else(|| "utterance rejected".to_string()),
            ));
        }

        resp.response
            .ok_or_else(|| CoachingError::Parse("utterance response has no reply".to_string()))
    }

    pub async fn progress(&self, session_id: Option<&str>) -> Result<ProgressReport, CoachingError> {
        let body = ProgressRequest {
            user_id: self.user_id.clone(),
            session_id: session_id.map(str::to_string),
        };

        self.send_with_retry("progress", || {
            self.http.post(self.url("progress")).json(&body)
        })
        .await
    }

    pub async fn health(&self) -> Result<HealthResponse, CoachingError> {
        self.send_with_retry("health", || self.http.get(self.url("health")))
            .await
    }

    pub async fn personas(&self) -> Result<Vec<PersonaSummary>, CoachingError> {
        let list: PersonaList = self
            .send_with_retry("personas", || self.http.get(self.url("personas")))
            .await?;
        Ok(list.personas)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send_with_retry<T, F>(&self, what: &str, build: F) -> Result<T, CoachingError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;

        loop {
            let result = build().send().await;

            let retryable = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(|e| {
                            CoachingError::Parse(format!("Failed to parse {} response: {}", what, e))
                        });
                    }

                    let body = response.text().await.unwrap_or_default();
                    let err = CoachingError::Api {
                        status: status.as_u16(),
                        message: error_detail(&body),
                    };
                    if !is_retryable(status) {
                        return Err(err);
                    }
                    err
                }
                Err(e) => CoachingError::Network(e.to_string()),
            };

            if attempt >= self.max_retries {
                log::warn!("Coaching {} failed after {} attempts: {}", what, attempt + 1, retryable);
                return Err(retryable);
            }

            let delay = self.base_delay * 2u32.pow(attempt);
            log::info!(
                "Retrying coaching {} in {:?} (attempt {}/{}): {}",
                what,
                delay,
                attempt + 2,
                self.max_retries + 1,
                retryable
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Pull `detail` or `error` out of a JSON error body
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("detail")
                .or_else(|| v.get("error"))
                .and_then(|d| d.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail() {
        assert_eq!(error_detail(r#"{"detail": "Session not found"}"#), "Session not found");
        assert_eq!(error_detail(r#"{"error": "boom"}"#), "boom");
        assert_eq!(error_detail("plain text"), "plain text");
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = CoachingClient::new("http://localhost:8000/", "u");
        assert_eq!(client.url("health"), "http://localhost:8000/health");
    }
}
