//! Effect runner for live voice sessions
//!
//! This module executes effects produced by the state machine. Work that
//! completes later (opening a connection, timers, coaching requests) runs
//! on its own task and reports back with an event carrying the connection
//! id it was started for.
//!
//! Resources are registered in `SessionResources` under the id of the
//! attempt that acquired them. `Teardown` runs synchronously inside
//! `spawn()`, before any later effect of the same batch, so an
//! `OpenSession` that follows a teardown always starts from a clean slate.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::pcm::{near_silence, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::audio::{
    spawn_pump, AudioOutput, CaptureConstraints, CaptureStream, MicrophoneSource, PlaybackQueue,
};
use crate::coaching::CoachingClient;
use crate::guard::{GuardError, SessionResources, WakeLock};
use crate::live::{
    ClientMessage, CloseInfo, Failure, InboundFrame, LiveConfig, LiveConnection, ServerMessage,
    SetupConfig, Transport,
};
use crate::live::protocol::DEFAULT_VOICE;
use crate::persona::PersonaConfig;
use crate::state_machine::{Effect, Event};

/// Default keepalive period while a connection is open
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Period of `SessionTick` events
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Length of the near-silent keepalive frame
const KEEPALIVE_FRAME_MS: u32 = 100;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);

    /// Release anything still held. Called once when the controller exits.
    fn dispose(&self) -> BoxFuture<'static, ()>;
}

/// External systems the runner drives
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub output: Arc<dyn AudioOutput>,
    pub wake_lock: Arc<dyn WakeLock>,
    /// Coaching backend; coaching effects fail fast when unset
    pub coaching: Option<CoachingClient>,
}

/// Connection and timer settings for the runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub live: LiveConfig,
    /// Voice used when the persona does not name one
    pub default_voice: String,
    pub keepalive_interval: Duration,
    pub constraints: CaptureConstraints,
}

impl RunnerConfig {
    pub fn new(live: LiveConfig) -> Self {
        Self {
            live,
            default_voice: DEFAULT_VOICE.to_string(),
            keepalive_interval: KEEPALIVE_INTERVAL,
            constraints: CaptureConstraints::default(),
        }
    }
}

/// Real effect runner: live connection, microphone, speaker, wake lock and
/// coaching backend.
pub struct LiveEffectRunner {
    collaborators: Collaborators,
    config: RunnerConfig,
    resources: Arc<Mutex<SessionResources>>,
    /// Coaching session id shared by all utterances of one live session
    coaching_session: Arc<Mutex<Option<String>>>,
}

impl LiveEffectRunner {
    pub fn new(collaborators: Collaborators, config: RunnerConfig) -> Arc<Self> {
        Arc::new(Self {
            collaborators,
            config,
            resources: Arc::new(Mutex::new(SessionResources::new())),
            coaching_session: Arc::new(Mutex::new(None)),
        })
    }

    /// Whether no session resource is currently held
    pub fn is_released(&self) -> bool {
        lock(&self.resources).is_empty()
    }
}

/// Lock that survives a panicked holder; the resources stay consistent
/// because every step takes its item out before releasing it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Why an open attempt ended early
enum OpenAbort {
    /// Torn down or replaced while opening. Nothing to report.
    Superseded,
    Failed(Failure),
}

/// Everything an open attempt needs, detached from the runner
struct OpenTask {
    id: Uuid,
    persona: PersonaConfig,
    system_instruction: String,
    collaborators: Collaborators,
    config: RunnerConfig,
    resources: Arc<Mutex<SessionResources>>,
    tx: mpsc::Sender<Event>,
}

impl OpenTask {
    fn is_current(&self) -> bool {
        lock(&self.resources).is_current(self.id)
    }

    async fn run(self) {
        let id = self.id;
        let tx = self.tx.clone();
        match self.open().await {
            Ok(()) => {}
            Err(OpenAbort::Superseded) => {
                log::debug!("Open attempt {} superseded, resources released", id);
            }
            Err(OpenAbort::Failed(failure)) => {
                let _ = tx.send(Event::OpenFailed { id, failure }).await;
            }
        }
    }

    async fn open(self) -> Result<(), OpenAbort> {
        let id = self.id;

        // 1. Wake lock (best effort)
        match self.collaborators.wake_lock.acquire() {
            Ok(guard) => {
                let refused = lock(&self.resources).install_wake_lock(id, guard).err();
                if let Some(mut guard) = refused {
                    if let Err(e) = guard.release() {
                        log::warn!("{}", e);
                    }
                    return Err(OpenAbort::Superseded);
                }
            }
            Err(GuardError::Unsupported) => log::debug!("No wake lock on this host"),
            Err(e) => log::warn!("Continuing without wake lock: {}", e),
        }

        // 2. Microphone
        let CaptureStream {
            frames,
            sample_rate,
            ended,
            handle,
        } = self
            .collaborators
            .microphone
            .open(&self.config.constraints)
            .map_err(|e| OpenAbort::Failed(Failure::from_audio_error(&e)))?;

        let refused = lock(&self.resources).install_capture(id, handle).err();
        if let Some(mut handle) = refused {
            if let Err(e) = handle.stop() {
                log::warn!("Failed to stop stale capture: {}", e);
            }
            return Err(OpenAbort::Superseded);
        }

        // 3. Speaker
        let output = self
            .collaborators
            .output
            .open(OUTPUT_SAMPLE_RATE)
            .map_err(|e| OpenAbort::Failed(Failure::from_audio_error(&e)))?;
        let playback = PlaybackQueue::new(output, OUTPUT_SAMPLE_RATE);

        let refused = lock(&self.resources).install_playback(id, playback).err();
        if let Some(playback) = refused {
            if let Err(e) = playback.close() {
                log::warn!("Failed to close stale playback: {}", e);
            }
            return Err(OpenAbort::Superseded);
        }

        // 4. Connect and configure
        let voice = self
            .persona
            .voice
            .clone()
            .unwrap_or_else(|| self.config.default_voice.clone());
        let setup = SetupConfig::new(&self.config.live.model, &voice, &self.system_instruction);

        let mut connection = LiveConnection::open(
            self.collaborators.transport.as_ref(),
            &self.config.live,
            setup,
        )
        .await
        .map_err(|e| OpenAbort::Failed(Failure::from_live_error(&e)))?;

        if !self.is_current() {
            connection.close();
            return Err(OpenAbort::Superseded);
        }

        let Some(inbound) = connection.take_inbound() else {
            return Err(OpenAbort::Failed(Failure::transient(
                "connection has no inbound stream",
            )));
        };
        let sender = connection.sender();

        let refused = lock(&self.resources).install_connection(id, connection).err();
        if let Some(mut connection) = refused {
            connection.close();
            return Err(OpenAbort::Superseded);
        }

        // 5. Report before any server event can be forwarded
        if self.tx.send(Event::SessionOpened { id }).await.is_err() {
            return Err(OpenAbort::Superseded);
        }

        // 6. Start moving frames
        let pump = spawn_pump(frames, sample_rate, sender);
        let forwarder = spawn_forwarder(id, inbound, self.tx.clone());
        let watcher = spawn_track_watcher(id, ended, self.tx.clone());

        let mut resources = lock(&self.resources);
        resources.install_tasks(id, forwarder, pump);
        resources.install_watcher(id, watcher);
        Ok(())
    }
}

/// Decode inbound frames into `Event::Server` until the connection closes
fn spawn_forwarder(
    id: Uuid,
    mut inbound: mpsc::Receiver<InboundFrame>,
    tx: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let close = loop {
            match inbound.recv().await {
                Some(InboundFrame::Text(text)) => {
                    let message = match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            log::warn!("Ignoring malformed server message: {}", e);
                            continue;
                        }
                    };
                    for event in message.into_events() {
                        if tx.send(Event::Server { id, event }).await.is_err() {
                            return;
                        }
                    }
                }
                Some(InboundFrame::Closed(close)) => break close,
                None => break CloseInfo::abnormal("inbound stream ended"),
            }
        };

        log::info!(
            "Connection {} closed (code {}, clean: {})",
            id,
            close.code,
            close.clean
        );
        let _ = tx.send(Event::ConnectionClosed { id, close }).await;
    })
}

fn spawn_track_watcher(
    id: Uuid,
    ended: tokio::sync::oneshot::Receiver<String>,
    tx: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Err means the capture was stopped normally
        if let Ok(reason) = ended.await {
            log::warn!("Microphone track ended: {}", reason);
            let _ = tx.send(Event::TrackEnded { id, reason }).await;
        }
    })
}

impl EffectRunner for LiveEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::OpenSession {
                id,
                persona,
                system_instruction,
            } => {
                lock(&self.resources).begin(id);

                let task = OpenTask {
                    id,
                    persona,
                    system_instruction,
                    collaborators: self.collaborators.clone(),
                    config: self.config.clone(),
                    resources: self.resources.clone(),
                    tx,
                };
                tokio::spawn(task.run());
            }

            Effect::Teardown { restarting } => {
                let report = lock(&self.resources).teardown();
                if !report.failed.is_empty() {
                    log::warn!("{} teardown step(s) failed", report.failed.len());
                }
                if !restarting {
                    *lock(&self.coaching_session) = None;
                }
            }

            Effect::ScheduleRetry { attempt, delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::RetryDue { attempt }).await;
                });
            }

            Effect::StartSessionTimers { id } => {
                let token = CancellationToken::new();
                if !lock(&self.resources).install_timers(id, token.clone()) {
                    return;
                }

                let keepalive_every = self.config.keepalive_interval;
                tokio::spawn(async move {
                    let start = Instant::now();
                    let mut keepalive =
                        tokio::time::interval_at(start + keepalive_every, keepalive_every);
                    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    let mut ticker = tokio::time::interval_at(start + TICK_INTERVAL, TICK_INTERVAL);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                    loop {
                        let event = tokio::select! {
                            _ = token.cancelled() => break,
                            _ = keepalive.tick() => Event::KeepaliveDue { id },
                            _ = ticker.tick() => Event::SessionTick { id },
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    log::debug!("Session timers stopped for {}", id);
                });
            }

            Effect::SendKeepalive { id } => {
                let sender = lock(&self.resources).sender(id);
                if let Some(sender) = sender {
                    let silence = near_silence(KEEPALIVE_FRAME_MS, INPUT_SAMPLE_RATE);
                    if !sender.send(&ClientMessage::audio(&silence)) {
                        log::debug!("Keepalive not sent, connection busy or closed");
                    }
                }
            }

            Effect::ForwardText { id, text } => {
                let sender = lock(&self.resources).sender(id);
                match sender {
                    Some(sender) if sender.send(&ClientMessage::text(text)) => {}
                    _ => log::warn!("Text not delivered, connection unavailable"),
                }
            }

            Effect::PlayAudio { id, samples } => {
                let mut resources = lock(&self.resources);
                if let Some(playback) = resources.playback_mut(id) {
                    if let Err(e) = playback.schedule(&samples, Instant::now()) {
                        log::warn!("Failed to play model audio: {}", e);
                    }
                }
            }

            Effect::StopPlayback { id } => {
                let mut resources = lock(&self.resources);
                if let Some(playback) = resources.playback_mut(id) {
                    let stopped = playback.stop_all(Instant::now());
                    log::debug!("Stopped {} queued audio chunk(s)", stopped);
                }
            }

            Effect::CoachSessionStart { persona_id } => {
                let Some(client) = self.collaborators.coaching.clone() else {
                    return;
                };
                let session_id = Uuid::new_v4().to_string();
                *lock(&self.coaching_session) = Some(session_id.clone());

                tokio::spawn(async move {
                    if let Err(e) = client.start_session(&session_id, Some(&persona_id)).await {
                        log::warn!("Coaching session start failed: {}", e);
                    }
                });
            }

            Effect::CoachUtterance {
                entry_id,
                text,
                text_mode,
            } => {
                let Some(client) = self.collaborators.coaching.clone() else {
                    tokio::spawn(async move {
                        let _ = tx
                            .send(Event::CoachingFailed {
                                entry_id,
                                err: "coaching backend not configured".to_string(),
                                text_mode,
                            })
                            .await;
                    });
                    return;
                };

                let session_id = lock(&self.coaching_session)
                    .get_or_insert_with(|| Uuid::new_v4().to_string())
                    .clone();

                tokio::spawn(async move {
                    let event = match client.utterance(&session_id, &text).await {
                        Ok(feedback) => Event::CoachingReply {
                            entry_id,
                            feedback,
                            text_mode,
                        },
                        Err(e) => Event::CoachingFailed {
                            entry_id,
                            err: e.to_string(),
                            text_mode,
                        },
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::EmitUi => {
                log::warn!("EmitUi reached the effect runner; it is handled by the state loop");
            }
        }
    }

    fn dispose(&self) -> BoxFuture<'static, ()> {
        let resources = self.resources.clone();
        Box::pin(async move {
            lock(&resources).teardown();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, OutputStream};
    use crate::live::{TransportChannels, TransportError};
    use async_trait::async_trait;

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn connect(&self, _url: &str) -> Result<TransportChannels, TransportError> {
            Err(TransportError::ConnectionFailed("offline".into()))
        }
    }

    struct NoMicrophone;

    impl MicrophoneSource for NoMicrophone {
        fn open(&self, _: &CaptureConstraints) -> Result<CaptureStream, AudioError> {
            Err(AudioError::NoInputDevice)
        }
    }

    struct NullOutput;

    impl OutputStream for NullOutput {
        fn write(&mut self, _: &[i16]) -> Result<(), AudioError> {
            Ok(())
        }
        fn clear(&mut self) {}
        fn close(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    impl AudioOutput for NullOutput {
        fn open(&self, _: u32) -> Result<Box<dyn OutputStream>, AudioError> {
            Ok(Box::new(NullOutput))
        }
    }

    fn runner() -> Arc<LiveEffectRunner> {
        LiveEffectRunner::new(
            Collaborators {
                transport: Arc::new(NoTransport),
                microphone: Arc::new(NoMicrophone),
                output: Arc::new(NullOutput),
                wake_lock: Arc::new(crate::guard::NoWakeLock),
                coaching: None,
            },
            RunnerConfig::new(LiveConfig::new("test-key", "models/test")),
        )
    }

    #[tokio::test]
    async fn test_open_without_microphone_reports_permanent_failure() {
        let runner = runner();
        let (tx, mut rx) = mpsc::channel(8);
        let id = Uuid::new_v4();

        runner.spawn(
            Effect::OpenSession {
                id,
                persona: PersonaConfig::default(),
                system_instruction: "Be brief.".into(),
            },
            tx,
        );

        match rx.recv().await {
            Some(Event::OpenFailed { id: eid, failure }) => {
                assert_eq!(eid, id);
                assert!(failure.is_permanent());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_retry_fires_after_delay() {
        let runner = runner();
        let (tx, mut rx) = mpsc::channel(8);

        runner.spawn(
            Effect::ScheduleRetry {
                attempt: 2,
                delay: Duration::from_secs(4),
            },
            tx,
        );

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(rx.recv().await, Some(Event::RetryDue { attempt: 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_need_current_generation() {
        let runner = runner();
        let (tx, mut rx) = mpsc::channel(8);

        // Nothing began, so the timers are refused
        runner.spawn(Effect::StartSessionTimers { id: Uuid::new_v4() }, tx);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_tick_until_teardown() {
        let runner = runner();
        let (tx, mut rx) = mpsc::channel(64);
        let id = Uuid::new_v4();
        lock(&runner.resources).begin(id);

        runner.spawn(Effect::StartSessionTimers { id }, tx.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(matches!(rx.recv().await, Some(Event::SessionTick { .. })));

        runner.spawn(Effect::Teardown { restarting: false }, tx);
        tokio::task::yield_now().await;
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(rx.try_recv().is_err());
        assert!(runner.is_released());
    }

    #[tokio::test]
    async fn test_coaching_without_backend_fails_fast() {
        let runner = runner();
        let (tx, mut rx) = mpsc::channel(8);

        runner.spawn(
            Effect::CoachUtterance {
                entry_id: 3,
                text: "hola".into(),
                text_mode: true,
            },
            tx,
        );

        assert!(matches!(
            rx.recv().await,
            Some(Event::CoachingFailed {
                entry_id: 3,
                text_mode: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_keepalive_without_connection_is_noop() {
        let runner = runner();
        let (tx, _rx) = mpsc::channel(8);
        runner.spawn(Effect::SendKeepalive { id: Uuid::new_v4() }, tx);
        assert!(runner.is_released());
    }
}
