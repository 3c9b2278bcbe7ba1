//! Duplex frame transport
//!
//! `Transport` hides the socket behind two channels so the session core can
//! be driven by an in-memory transport in tests. `WsTransport` is the
//! production implementation over tokio-tungstenite.
//!
//! Proxy routing is fixed when the transport is built: a `ProxyConfig`
//! rewrites every endpoint URL onto the proxy's base, keeping the path and
//! query.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frames buffered ahead of the socket writer
const OUTBOUND_QUEUE: usize = 64;

/// Inbound frames buffered ahead of the session
const INBOUND_QUEUE: usize = 256;

/// Close code reported when the socket drops without a close frame
pub const ABNORMAL_CLOSE: u16 = 1006;

/// A frame for the socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Send a normal close frame and stop writing
    Close,
}

/// How the connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// A close handshake completed (as opposed to the socket dropping)
    pub clean: bool,
}

impl CloseInfo {
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: ABNORMAL_CLOSE,
            reason: reason.into(),
            clean: false,
        }
    }
}

/// A frame delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// Always the last frame
    Closed(CloseInfo),
}

/// Channel pair of an open connection.
///
/// Dropping `outbound` closes the socket.
pub struct TransportChannels {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<InboundFrame>,
}

/// Errors establishing a connection
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
    #[error("Handshake rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a duplex connection to `url`
    async fn connect(&self, url: &str) -> Result<TransportChannels, TransportError>;
}

/// Routes live traffic through a proxy base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub base_url: String,
}

impl ProxyConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Replace scheme and host of `url` with the proxy's, keeping path and query
    pub fn rewrite(&self, url: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };

        let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
        let path_and_query = after_scheme
            .find('/')
            .map_or("", |idx| &after_scheme[idx..]);

        format!("{}{}", base, path_and_query)
    }
}

/// WebSocket transport over tokio-tungstenite (rustls)
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    proxy: Option<ProxyConfig>,
}

impl WsTransport {
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<TransportChannels, TransportError> {
        let target = match &self.proxy {
            Some(proxy) => proxy.rewrite(url),
            None => url.to_string(),
        };

        let request = target
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        log::info!("Connecting to {}", redact_key(&target));

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, true, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(map_connect_error)?;

        log::info!("WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundFrame>(INBOUND_QUEUE);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            log::warn!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    OutboundFrame::Close => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        let _ = write.send(Message::Close(Some(close))).await;
                        break;
                    }
                }
            }
            if let Err(e) = write.close().await {
                log::debug!("Error closing WebSocket: {}", e);
            }
            log::debug!("Writer task exiting");
        });

        tokio::spawn(async move {
            let close = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(InboundFrame::Text(text)).await.is_err() {
                            log::debug!("Inbound channel closed");
                            return;
                        }
                    }
                    // The service sends JSON in binary frames as well
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if inbound_tx.send(InboundFrame::Text(text)).await.is_err() {
                                log::debug!("Inbound channel closed");
                                return;
                            }
                        }
                        Err(_) => log::warn!("Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let info = match frame {
                            Some(frame) => CloseInfo {
                                code: u16::from(frame.code),
                                reason: frame.reason.to_string(),
                                clean: true,
                            },
                            None => CloseInfo {
                                code: 1005,
                                reason: String::new(),
                                clean: true,
                            },
                        };
                        log::info!("WebSocket closed by server ({})", info.code);
                        break info;
                    }
                    Some(Ok(_)) => {} // Ignore ping/pong
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {}", e);
                        break CloseInfo::abnormal(e.to_string());
                    }
                    None => break CloseInfo::abnormal("stream ended"),
                }
            };
            let _ = inbound_tx.send(InboundFrame::Closed(close)).await;
            log::debug!("Reader task exiting");
        });

        Ok(TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn map_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            TransportError::Rejected {
                status: response.status().as_u16(),
                body,
            }
        }
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

/// Hide the `key` query parameter when logging a URL
pub fn redact_key(url: &str) -> String {
    match url.split_once("key=") {
        Some((head, tail)) => {
            let rest = tail.find('&').map_or("", |idx| &tail[idx..]);
            format!("{}key=***{}", head, rest)
        }
        None => url.to_string(),
    }
}
