//! Voice preview
//!
//! Stateless text-to-speech request used to audition a prebuilt voice
//! before starting a session. Sends `generateContent` with an audio
//! response modality and returns the decoded 24 kHz PCM.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::pcm::{decode_pcm16, OUTPUT_SAMPLE_RATE};
use crate::live::protocol::{Content, GenerationConfig, SpeechConfig};

/// REST endpoint root for the generative language API
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

pub const DEFAULT_PREVIEW_MODEL: &str = "models/gemini-2.5-flash-preview-tts";

/// Prebuilt voices offered by the service
pub const PREBUILT_VOICES: &[&str] = &[
    "Puck", "Charon", "Kore", "Fenrir", "Aoede", "Leda", "Orus", "Zephyr",
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PreviewError {
    #[error("API key not configured. Set GEMINI_API_KEY or store a credential override.")]
    MissingApiKey,
    #[error("Network error: {0}")]
    Network(String),
    #[error("Preview API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Failed to parse preview response: {0}")]
    Parse(String),
    #[error("Preview response contained no audio")]
    NoAudio,
    #[error("Failed to write WAV: {0}")]
    Wav(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreviewRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
struct PreviewResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

/// Decoded preview audio
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PreviewAudio {
    pub fn duration(&self) -> Duration {
        crate::audio::pcm::duration_of(self.samples.len(), self.sample_rate)
    }
}

#[derive(Debug, Clone)]
pub struct VoicePreviewClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl VoicePreviewClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self) -> String {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        format!("{}/v1beta/{}:generateContent", self.api_base, model)
    }

    /// Speak `text` with `voice`
    pub async fn synthesize(&self, voice: &str, text: &str) -> Result<PreviewAudio, PreviewError> {
        if self.api_key.is_empty() {
            return Err(PreviewError::MissingApiKey);
        }

        let request = PreviewRequest {
            contents: vec![Content::text(Some("user"), text)],
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig::prebuilt(voice)),
            },
        };

        log::info!("Requesting voice preview ({}, {} chars)", voice, text.len());

        let response = self
            .http
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PreviewError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            return Err(PreviewError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: PreviewResponse = response
            .json()
            .await
            .map_err(|e| PreviewError::Parse(e.to_string()))?;

        let blob = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.inline_data)
            .ok_or(PreviewError::NoAudio)?;

        let samples = decode_pcm16(&blob.data).map_err(|e| PreviewError::Parse(e.to_string()))?;
        if samples.is_empty() {
            return Err(PreviewError::NoAudio);
        }

        log::debug!("Voice preview: {} samples ({})", samples.len(), blob.mime_type);
        Ok(PreviewAudio {
            samples,
            sample_rate: OUTPUT_SAMPLE_RATE,
        })
    }
}

/// Write mono PCM16 as a WAV file
pub fn write_wav(path: &Path, audio: &PreviewAudio) -> Result<(), PreviewError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| PreviewError::Wav(e.to_string()))?;
    for &sample in &audio.samples {
        writer
            .write_sample(sample)
            .map_err(|e| PreviewError::Wav(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| PreviewError::Wav(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::encode_pcm16;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn audio_body(samples: &[i16]) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{
                        "inlineData": {
                            "mimeType": "audio/L16;codec=pcm;rate=24000",
                            "data": encode_pcm16(samples)
                        }
                    }]
                }
            }]
        })
    }

    #[tokio::test]
    async fn test_synthesize_decodes_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash-preview-tts:generateContent"))
            .and(header("x-goog-api-key", "k"))
            .and(body_partial_json(serde_json::json!({
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {"voiceConfig": {"prebuiltVoiceConfig": {"voiceName": "Kore"}}}
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(audio_body(&[1, -2, 3])))
            .expect(1)
            .mount(&server)
            .await;

        let client = VoicePreviewClient::new("k", DEFAULT_PREVIEW_MODEL).with_api_base(server.uri());
        let audio = client.synthesize("Kore", "Hola").await.unwrap();

        assert_eq!(audio.samples, vec![1, -2, 3]);
        assert_eq!(audio.sample_rate, 24_000);
    }

    #[tokio::test]
    async fn test_api_error_message_is_extracted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"code": 400, "message": "API key not valid."}
            })))
            .mount(&server)
            .await;

        let client = VoicePreviewClient::new("bad", "gemini-2.5-flash-preview-tts")
            .with_api_base(server.uri());
        let err = client.synthesize("Puck", "Hi").await.unwrap_err();

        assert_eq!(
            err,
            PreviewError::Api {
                status: 400,
                message: "API key not valid.".into()
            }
        );
    }

    #[tokio::test]
    async fn test_response_without_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"candidates": []})),
            )
            .mount(&server)
            .await;

        let client = VoicePreviewClient::new("k", "m").with_api_base(server.uri());
        assert_eq!(client.synthesize("Puck", "Hi").await.unwrap_err(), PreviewError::NoAudio);
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_request() {
        let client = VoicePreviewClient::new("", "m").with_api_base("http://127.0.0.1:9");
        assert_eq!(
            client.synthesize("Puck", "Hi").await.unwrap_err(),
            PreviewError::MissingApiKey
        );
    }

    #[test]
    fn test_write_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.wav");
        let audio = PreviewAudio {
            samples: vec![0, 1000, -1000, 0],
            sample_rate: 24_000,
        };

        write_wav(&path, &audio).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, audio.samples);
    }
}
