//! Live API connection
//!
//! # Connection Flow
//!
//! 1. `LiveConnection::open()` - connect through the `Transport`, send
//!    `setup`, wait for `setupComplete`
//! 2. `sender()` - cloneable non-blocking handle for audio, text and
//!    keepalive frames
//! 3. `take_inbound()` - raw inbound frames for the session's forwarder
//! 4. `close()` - send a close frame; further sends are no-ops
//!
//! The connection never reconnects by itself. Retry decisions belong to the
//! session state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;

use super::protocol::{ClientMessage, ServerMessage, SetupConfig, LIVE_API_URL};
use super::transport::{InboundFrame, OutboundFrame, Transport};
use super::LiveError;

/// Timeout for waiting for setupComplete
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub setup_timeout: Duration,
}

impl LiveConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            setup_timeout: SETUP_TIMEOUT,
        }
    }

    /// Endpoint URL including the key parameter
    pub fn url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, self.api_key)
    }
}

/// Non-blocking send handle.
///
/// Sends are no-ops (returning `false`) once the connection is closed or
/// while the outbound queue is full.
#[derive(Debug, Clone)]
pub struct LiveSender {
    tx: mpsc::Sender<OutboundFrame>,
    open: Arc<AtomicBool>,
}

impl LiveSender {
    fn new(tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A sender wired to a bare channel, for exercising send paths without a
    /// connection
    pub fn detached(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Queue a message for the socket writer
    pub fn send(&self, msg: &ClientMessage) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }

        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Failed to serialize client message: {}", e);
                return false;
            }
        };

        match self.tx.try_send(OutboundFrame::Text(json)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.mark_closed();
                false
            }
        }
    }
}

/// An open, configured Live API connection
pub struct LiveConnection {
    sender: LiveSender,
    inbound: Option<mpsc::Receiver<InboundFrame>>,
}

impl LiveConnection {
    /// Connect and complete the setup handshake.
    ///
    /// Succeeds only after `setupComplete` arrives.
    pub async fn open(
        transport: &dyn Transport,
        config: &LiveConfig,
        setup: SetupConfig,
    ) -> Result<Self, LiveError> {
        if config.api_key.trim().is_empty() {
            return Err(LiveError::MissingApiKey);
        }

        let channels = transport.connect(&config.url()).await?;
        let outbound = channels.outbound;
        let mut inbound = channels.inbound;

        let setup_json = serde_json::to_string(&ClientMessage::setup(setup))
            .map_err(|e| LiveError::Protocol(e.to_string()))?;
        outbound
            .send(OutboundFrame::Text(setup_json))
            .await
            .map_err(|_| LiveError::Closed {
                code: super::transport::ABNORMAL_CLOSE,
                reason: "connection closed before setup was sent".to_string(),
                clean: false,
            })?;

        log::info!("Setup sent, waiting for setupComplete...");

        timeout(config.setup_timeout, async {
            while let Some(frame) = inbound.recv().await {
                match frame {
                    InboundFrame::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) if msg.is_setup_complete() => return Ok(()),
                        Ok(msg) => {
                            if let Some(error) = msg.error {
                                return Err(LiveError::Server(error.message));
                            }
                            log::debug!("Ignoring message while waiting for setupComplete");
                        }
                        Err(e) => log::warn!("Failed to parse message: {}", e),
                    },
                    InboundFrame::Closed(info) => {
                        return Err(LiveError::Closed {
                            code: info.code,
                            reason: info.reason,
                            clean: info.clean,
                        });
                    }
                }
            }
            Err(LiveError::Closed {
                code: super::transport::ABNORMAL_CLOSE,
                reason: "stream ended".to_string(),
                clean: false,
            })
        })
        .await
        .map_err(|_| LiveError::SetupTimeout)??;

        log::info!("Live session configured");

        Ok(Self {
            sender: LiveSender::new(outbound),
            inbound: Some(inbound),
        })
    }

    pub fn sender(&self) -> LiveSender {
        self.sender.clone()
    }

    /// Take ownership of the inbound frame receiver.
    ///
    /// Returns `None` if already taken.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundFrame>> {
        self.inbound.take()
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// Send a close frame. Idempotent.
    pub fn close(&mut self) {
        if self.sender.open.swap(false, Ordering::SeqCst) {
            let _ = self.sender.tx.try_send(OutboundFrame::Close);
            log::info!("Live connection closed");
        }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::transport::{CloseInfo, TransportChannels, TransportError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Transport that answers the handshake with a scripted frame
    struct ScriptedTransport {
        reply: Option<InboundFrame>,
        outbound: Mutex<Option<mpsc::Receiver<OutboundFrame>>>,
    }

    impl ScriptedTransport {
        fn new(reply: Option<InboundFrame>) -> Self {
            Self {
                reply,
                outbound: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self, url: &str) -> Result<TransportChannels, TransportError> {
            assert!(url.contains("key=test-key"));
            let (out_tx, out_rx) = mpsc::channel(16);
            let (in_tx, in_rx) = mpsc::channel(16);
            if let Some(reply) = self.reply.clone() {
                in_tx.send(reply).await.unwrap();
            }
            // Keep the inbound side open without replying
            std::mem::forget(in_tx);
            *self.outbound.lock().unwrap() = Some(out_rx);
            Ok(TransportChannels {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    fn config() -> LiveConfig {
        LiveConfig::new("test-key", "gemini-2.0-flash-live-001")
    }

    fn setup() -> SetupConfig {
        SetupConfig::new("gemini-2.0-flash-live-001", "Puck", "")
    }

    #[test]
    fn test_url_appends_key() {
        assert!(config().url().ends_with("BidiGenerateContent?key=test-key"));

        let mut custom = config();
        custom.endpoint = "wss://proxy/ws?alt=json".to_string();
        assert_eq!(custom.url(), "wss://proxy/ws?alt=json&key=test-key");
    }

    #[tokio::test]
    async fn test_open_waits_for_setup_complete() {
        let transport = ScriptedTransport::new(Some(InboundFrame::Text(
            r#"{"setupComplete": {}}"#.to_string(),
        )));

        let mut conn = LiveConnection::open(&transport, &config(), setup())
            .await
            .unwrap();
        assert!(conn.is_open());

        let mut outbound = transport.outbound.lock().unwrap().take().unwrap();
        let Some(OutboundFrame::Text(first)) = outbound.recv().await else {
            panic!("expected setup frame");
        };
        assert!(first.contains("\"setup\""));

        conn.close();
        assert!(!conn.is_open());
        assert_eq!(outbound.recv().await, Some(OutboundFrame::Close));

        // Second close is a no-op
        conn.close();
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_fails_on_close_during_setup() {
        let transport = ScriptedTransport::new(Some(InboundFrame::Closed(CloseInfo {
            code: 1008,
            reason: "API key not valid".to_string(),
            clean: true,
        })));

        let result = LiveConnection::open(&transport, &config(), setup()).await;
        assert!(matches!(
            result,
            Err(LiveError::Closed { code: 1008, clean: true, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_times_out_without_setup_complete() {
        let transport = ScriptedTransport::new(None);
        let result = LiveConnection::open(&transport, &config(), setup()).await;
        assert!(matches!(result, Err(LiveError::SetupTimeout)));
    }

    #[tokio::test]
    async fn test_open_requires_api_key() {
        let transport = ScriptedTransport::new(None);
        let mut config = config();
        config.api_key = String::new();

        let result = LiveConnection::open(&transport, &config, setup()).await;
        assert!(matches!(result, Err(LiveError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_sender_is_noop_after_close() {
        let (sender, mut rx) = LiveSender::detached(1);

        assert!(sender.send(&ClientMessage::text("one")));
        // Queue full
        assert!(!sender.send(&ClientMessage::text("two")));

        sender.mark_closed();
        rx.recv().await.unwrap();
        assert!(!sender.send(&ClientMessage::text("three")));
        assert!(rx.try_recv().is_err());
    }
}
