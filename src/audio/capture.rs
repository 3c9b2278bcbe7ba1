//! Microphone capture pipeline
//!
//! ```text
//! Device thread (sync)              Tokio runtime (async)
//! ┌──────────────────┐              ┌────────────────────────┐
//! │ input callback   │──channel──▶  │ pump                   │
//! │ try_send(frame)  │              │   ├─ resample → 16kHz  │
//! └──────────────────┘              │   ├─ base64 PCM16      │
//!                                   │   └─ LiveSender::send  │
//!                                   └────────────────────────┘
//! ```
//!
//! The pump never blocks on the connection: a frame that cannot be sent
//! right now (connection not open, outbound queue full) is dropped.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::pcm::{resample, INPUT_SAMPLE_RATE};
use super::AudioError;
use crate::live::{ClientMessage, LiveSender};

/// Processing requested from the input device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channel_count: u16,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channel_count: 1,
        }
    }
}

/// Stops an open input stream and releases the device
pub trait CaptureHandle: Send {
    fn stop(&mut self) -> Result<(), AudioError>;
}

/// An open microphone
pub struct CaptureStream {
    /// Mono PCM16 frames at `sample_rate`, one per device callback
    pub frames: mpsc::Receiver<Vec<i16>>,
    pub sample_rate: u32,
    /// Resolves with a reason if the input track ends without `stop()`
    pub ended: oneshot::Receiver<String>,
    pub handle: Box<dyn CaptureHandle>,
}

/// Source of microphone streams (a device backend or a test fake)
pub trait MicrophoneSource: Send + Sync {
    fn open(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, AudioError>;
}

/// Forward captured frames to the live connection until the frame
/// channel closes.
pub fn spawn_pump(
    mut frames: mpsc::Receiver<Vec<i16>>,
    source_rate: u32,
    sender: LiveSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!(
            "Capture pump: started ({}Hz → {}Hz)",
            source_rate,
            INPUT_SAMPLE_RATE
        );

        let mut sent: u64 = 0;
        let mut dropped: u64 = 0;

        while let Some(frame) = frames.recv().await {
            let samples = resample(&frame, source_rate, INPUT_SAMPLE_RATE);
            if samples.is_empty() {
                continue;
            }

            if sender.send(&ClientMessage::audio(&samples)) {
                sent += 1;
                // Periodic logging (every 100 frames)
                if sent % 100 == 0 {
                    log::debug!("Capture pump: sent {} frames", sent);
                }
            } else {
                dropped += 1;
            }
        }

        log::info!(
            "Capture pump: input closed ({} frames sent, {} dropped)",
            sent,
            dropped
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::transport::OutboundFrame;

    #[tokio::test]
    async fn test_pump_resamples_and_encodes() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (sender, mut outbound) = LiveSender::detached(8);

        let pump = spawn_pump(frame_rx, 48_000, sender);
        frame_tx.send(vec![300i16; 4800]).await.unwrap();
        drop(frame_tx);
        pump.await.unwrap();

        let Some(OutboundFrame::Text(json)) = outbound.recv().await else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");

        let data = chunk["data"].as_str().unwrap();
        let samples = crate::audio::pcm::decode_pcm16(data).unwrap();
        assert_eq!(samples.len(), 1600);
        assert!(samples.iter().all(|&s| s == 300));
    }

    #[tokio::test]
    async fn test_pump_drops_frames_when_connection_closed() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (sender, mut outbound) = LiveSender::detached(8);
        sender.mark_closed();

        let pump = spawn_pump(frame_rx, 16_000, sender);
        frame_tx.send(vec![1i16; 160]).await.unwrap();
        drop(frame_tx);
        pump.await.unwrap();

        assert!(outbound.try_recv().is_err());
    }
}
