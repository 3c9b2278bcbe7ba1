//! Session controller
//!
//! Owns the state loop: one task that receives every event (public API
//! calls, effect completions, connection traffic, timers), runs it
//! through `reduce()`, hands the effects to the runner and publishes a
//! snapshot for readers. This is the only place session state is written.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::effects::EffectRunner;
use crate::persona::PersonaConfig;
use crate::state_machine::{reduce, Effect, Event, Session, SessionOptions, Status};
use crate::transcript::TranscriptEntry;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Read-only view of the session, published after every visible change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: Status,
    pub is_active: bool,
    pub reconnect_attempts: u32,
    /// Age of the current connection, if one is open
    pub elapsed_secs: Option<u64>,
    /// One-line message for the last terminal failure
    pub last_error: Option<String>,
    pub persona_id: String,
    pub transcript: Vec<TranscriptEntry>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        snapshot_of(&Session::default(), Instant::now())
    }
}

pub fn snapshot_of(session: &Session, now: Instant) -> SessionSnapshot {
    SessionSnapshot {
        status: session.status,
        is_active: session.is_active,
        reconnect_attempts: session.reconnect_attempts,
        elapsed_secs: session.elapsed(now).map(|d| d.as_secs()),
        last_error: session.last_error.clone(),
        persona_id: session.persona.id.clone(),
        transcript: session.transcript.entries().to_vec(),
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControllerError {
    #[error("A session is already {}", .0.as_str())]
    AlreadyActive(Status),
    #[error("Session controller has shut down")]
    LoopClosed,
    #[error("Nothing to send")]
    EmptyText,
}

/// Handle to a running state loop
pub struct SessionController {
    tx: mpsc::Sender<Event>,
    state: watch::Receiver<SessionSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Spawn the state loop on the current runtime
    pub fn spawn(runner: Arc<dyn EffectRunner>, options: SessionOptions) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
        let session = Session::new(options);
        let (state_tx, state_rx) = watch::channel(snapshot_of(&session, Instant::now()));

        let task = tokio::spawn(run_state_loop(session, rx, tx.clone(), runner, state_tx));

        Self {
            tx,
            state: state_rx,
            task: Some(task),
        }
    }

    /// Start a session with `persona`. Only accepted from `Idle` or `Error`.
    pub async fn start(&self, persona: PersonaConfig) -> Result<(), ControllerError> {
        let status = self.state.borrow().status;
        if !status.can_start() {
            return Err(ControllerError::AlreadyActive(status));
        }
        self.send(Event::Start { persona }).await
    }

    /// Stop the session and release every resource. Accepted in any status.
    pub async fn stop(&self) -> Result<(), ControllerError> {
        self.send(Event::Stop).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ControllerError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ControllerError::EmptyText);
        }
        self.send(Event::SendText { text }).await
    }

    /// Current-value store of the session
    pub fn state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Tear everything down and wait for the state loop to finish
    pub async fn shutdown(mut self) -> Result<(), ControllerError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        // Loop may already be gone; the join below still settles it
        let _ = self.tx.send(Event::Exit).await;
        task.await.map_err(|e| {
            log::error!("State loop task failed: {}", e);
            ControllerError::LoopClosed
        })
    }

    async fn send(&self, event: Event) -> Result<(), ControllerError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ControllerError::LoopClosed)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.task.is_some() {
            if let Err(e) = self.tx.try_send(Event::Exit) {
                log::warn!("Failed to send exit to state loop: {}", e);
            }
        }
    }
}

/// Run the main state loop
async fn run_state_loop(
    mut session: Session,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    state_tx: watch::Sender<SessionSnapshot>,
) {
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        // Server events carry audio; too noisy to dump
        if !matches!(event, Event::Server { .. }) {
            log::debug!("Received event: {:?}", event);
        }

        let exiting = matches!(event, Event::Exit);
        let ticked = matches!(event, Event::SessionTick { .. });

        let (next, effects) = reduce(&session, event);
        if next.status != session.status {
            log::info!(
                "State transition: {} -> {}",
                session.status.as_str(),
                next.status.as_str()
            );
        }
        session = next;

        let mut publish = ticked;
        for eff in effects {
            match eff {
                Effect::EmitUi => publish = true,
                other => effect_runner.spawn(other, tx.clone()),
            }
        }
        if publish {
            state_tx.send_replace(snapshot_of(&session, Instant::now()));
        }

        if exiting {
            log::info!("Exit requested, shutting down state loop");
            effect_runner.dispose().await;
            break;
        }
    }

    log::info!("State loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;

    /// Records effects instead of running them
    #[derive(Default)]
    struct RecordingRunner {
        effects: Mutex<Vec<Effect>>,
        disposed: Mutex<bool>,
    }

    impl EffectRunner for RecordingRunner {
        fn spawn(&self, effect: Effect, _tx: mpsc::Sender<Event>) {
            self.effects.lock().unwrap().push(effect);
        }

        fn dispose(&self) -> BoxFuture<'static, ()> {
            *self.disposed.lock().unwrap() = true;
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn test_start_publishes_connecting() {
        let runner = Arc::new(RecordingRunner::default());
        let controller = SessionController::spawn(runner.clone(), SessionOptions::default());
        let mut state = controller.state();

        controller.start(PersonaConfig::default()).await.unwrap();
        state
            .wait_for(|s| s.status == Status::Connecting)
            .await
            .unwrap();

        assert!(controller.snapshot().is_active);
        assert!(runner
            .effects
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Effect::OpenSession { .. })));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let runner = Arc::new(RecordingRunner::default());
        let controller = SessionController::spawn(runner, SessionOptions::default());
        let mut state = controller.state();

        controller.start(PersonaConfig::default()).await.unwrap();
        state
            .wait_for(|s| s.status == Status::Connecting)
            .await
            .unwrap();

        let err = controller.start(PersonaConfig::default()).await.unwrap_err();
        assert_eq!(err, ControllerError::AlreadyActive(Status::Connecting));
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() {
        let controller =
            SessionController::spawn(Arc::new(RecordingRunner::default()), SessionOptions::default());
        assert_eq!(
            controller.send_text("  ").await.unwrap_err(),
            ControllerError::EmptyText
        );
    }

    #[tokio::test]
    async fn test_shutdown_disposes_runner() {
        let runner = Arc::new(RecordingRunner::default());
        let controller = SessionController::spawn(runner.clone(), SessionOptions::default());

        controller.shutdown().await.unwrap();

        assert!(*runner.disposed.lock().unwrap());
        assert!(runner
            .effects
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Effect::Teardown { restarting: false })));
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(SessionSnapshot::default()).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["isActive"], false);
        assert_eq!(json["reconnectAttempts"], 0);
    }
}
