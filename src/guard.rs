//! Session resources and their teardown
//!
//! `SessionResources` owns everything a live connection holds. Teardown
//! releases it in a fixed order, one step at a time, so a failing step
//! never keeps the later ones from running:
//!
//! 1. timers
//! 2. connection (and its inbound forwarder)
//! 3. capture pump
//! 4. microphone
//! 5. playback output
//! 6. wake lock
//!
//! Every step takes its resource out of the struct first, so tearing down
//! twice releases nothing the second time.
//!
//! Open attempts register a generation (the connection attempt id) with
//! `begin()`. A resource acquired by an attempt that is no longer current
//! is refused by `install_*` and handed back to the caller to release.

use std::process::{Child, Command, Stdio};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{CaptureHandle, PlaybackQueue};
use crate::live::{LiveConnection, LiveSender};

/// Errors acquiring or releasing a wake lock
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardError {
    #[error("Wake lock not supported on this host")]
    Unsupported,
    #[error("Failed to acquire wake lock: {0}")]
    Acquire(String),
    #[error("Failed to release wake lock: {0}")]
    Release(String),
}

/// Keeps the host awake while held
pub trait WakeLockGuard: Send {
    fn release(&mut self) -> Result<(), GuardError>;
}

pub trait WakeLock: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn WakeLockGuard>, GuardError>;
}

/// For hosts without an inhibit mechanism
#[derive(Debug, Default)]
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self) -> Result<Box<dyn WakeLockGuard>, GuardError> {
        Err(GuardError::Unsupported)
    }
}

/// Holds a `systemd-inhibit` child for as long as the lock is held
#[derive(Debug, Clone)]
pub struct InhibitWakeLock {
    who: String,
    why: String,
}

impl Default for InhibitWakeLock {
    fn default() -> Self {
        Self {
            who: "live-voice".to_string(),
            why: "Voice session in progress".to_string(),
        }
    }
}

impl WakeLock for InhibitWakeLock {
    fn acquire(&self) -> Result<Box<dyn WakeLockGuard>, GuardError> {
        let child = Command::new("systemd-inhibit")
            .args([
                "--what=idle:sleep",
                "--mode=block",
                &format!("--who={}", self.who),
                &format!("--why={}", self.why),
                "sleep",
                "infinity",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| GuardError::Acquire(e.to_string()))?;

        log::info!("Wake lock acquired (pid {})", child.id());
        Ok(Box::new(InhibitGuard { child: Some(child) }))
    }
}

struct InhibitGuard {
    child: Option<Child>,
}

impl WakeLockGuard for InhibitGuard {
    fn release(&mut self) -> Result<(), GuardError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        // Already exited is fine
        if let Err(e) = child.kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(GuardError::Release(e.to_string()));
            }
        }
        child
            .wait()
            .map_err(|e| GuardError::Release(e.to_string()))?;
        Ok(())
    }
}

impl Drop for InhibitGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("{}", e);
        }
    }
}

/// What one teardown released
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub released: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

impl TeardownReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.failed.is_empty()
    }
}

/// Everything held by the current connection attempt
#[derive(Default)]
pub struct SessionResources {
    generation: Option<Uuid>,
    timers: Option<CancellationToken>,
    connection: Option<LiveConnection>,
    inbound_task: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    watchers: Vec<JoinHandle<()>>,
    capture: Option<Box<dyn CaptureHandle>>,
    playback: Option<PlaybackQueue>,
    wake_lock: Option<Box<dyn WakeLockGuard>>,
}

impl SessionResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `id` the current generation
    pub fn begin(&mut self, id: Uuid) {
        self.generation = Some(id);
    }

    pub fn generation(&self) -> Option<Uuid> {
        self.generation
    }

    pub fn is_current(&self, id: Uuid) -> bool {
        self.generation == Some(id)
    }

    pub fn install_wake_lock(
        &mut self,
        id: Uuid,
        lock: Box<dyn WakeLockGuard>,
    ) -> Result<(), Box<dyn WakeLockGuard>> {
        if !self.is_current(id) {
            return Err(lock);
        }
        // A lock left from an earlier attempt of the same session is replaced
        if let Some(mut old) = self.wake_lock.replace(lock) {
            if let Err(e) = old.release() {
                log::warn!("{}", e);
            }
        }
        Ok(())
    }

    pub fn install_capture(
        &mut self,
        id: Uuid,
        capture: Box<dyn CaptureHandle>,
    ) -> Result<(), Box<dyn CaptureHandle>> {
        if !self.is_current(id) {
            return Err(capture);
        }
        self.capture = Some(capture);
        Ok(())
    }

    pub fn install_playback(&mut self, id: Uuid, playback: PlaybackQueue) -> Result<(), PlaybackQueue> {
        if !self.is_current(id) {
            return Err(playback);
        }
        self.playback = Some(playback);
        Ok(())
    }

    pub fn install_connection(
        &mut self,
        id: Uuid,
        connection: LiveConnection,
    ) -> Result<(), LiveConnection> {
        if !self.is_current(id) {
            return Err(connection);
        }
        self.connection = Some(connection);
        Ok(())
    }

    /// Tasks are aborted rather than handed back when the attempt is stale
    pub fn install_tasks(&mut self, id: Uuid, inbound: JoinHandle<()>, pump: JoinHandle<()>) {
        if !self.is_current(id) {
            inbound.abort();
            pump.abort();
            return;
        }
        self.inbound_task = Some(inbound);
        self.pump = Some(pump);
    }

    pub fn install_watcher(&mut self, id: Uuid, watcher: JoinHandle<()>) {
        if !self.is_current(id) {
            watcher.abort();
            return;
        }
        self.watchers.push(watcher);
    }

    pub fn install_timers(&mut self, id: Uuid, token: CancellationToken) -> bool {
        if !self.is_current(id) {
            token.cancel();
            return false;
        }
        if let Some(old) = self.timers.replace(token) {
            old.cancel();
        }
        true
    }

    /// Send handle of the current connection, if `id` is current
    pub fn sender(&self, id: Uuid) -> Option<LiveSender> {
        if !self.is_current(id) {
            return None;
        }
        self.connection.as_ref().map(LiveConnection::sender)
    }

    pub fn playback_mut(&mut self, id: Uuid) -> Option<&mut PlaybackQueue> {
        if !self.is_current(id) {
            return None;
        }
        self.playback.as_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_none()
            && self.connection.is_none()
            && self.inbound_task.is_none()
            && self.pump.is_none()
            && self.watchers.is_empty()
            && self.capture.is_none()
            && self.playback.is_none()
            && self.wake_lock.is_none()
    }

    /// Release everything, in order. Idempotent.
    pub fn teardown(&mut self) -> TeardownReport {
        self.generation = None;
        let mut report = TeardownReport::default();

        let mut step = |name: &'static str, result: Result<bool, String>| match result {
            Ok(true) => report.released.push(name),
            Ok(false) => {}
            Err(e) => {
                log::warn!("Teardown step '{}' failed: {}", name, e);
                report.failed.push((name, e));
            }
        };

        step("timers", {
            let released = self.timers.take().map(|token| token.cancel()).is_some();
            Ok(released)
        });

        step("connection", {
            let mut released = false;
            if let Some(mut connection) = self.connection.take() {
                connection.close();
                released = true;
            }
            if let Some(task) = self.inbound_task.take() {
                task.abort();
                released = true;
            }
            for watcher in self.watchers.drain(..) {
                watcher.abort();
            }
            Ok(released)
        });

        step("capture pump", {
            let released = self.pump.take().map(|pump| pump.abort()).is_some();
            Ok(released)
        });

        step(
            "microphone",
            match self.capture.take() {
                Some(mut capture) => capture.stop().map(|_| true).map_err(|e| e.to_string()),
                None => Ok(false),
            },
        );

        step(
            "playback",
            match self.playback.take() {
                Some(playback) => playback.close().map(|_| true).map_err(|e| e.to_string()),
                None => Ok(false),
            },
        );

        step(
            "wake lock",
            match self.wake_lock.take() {
                Some(mut lock) => lock.release().map(|_| true).map_err(|e| e.to_string()),
                None => Ok(false),
            },
        );

        if !report.is_empty() {
            log::info!(
                "Teardown released [{}]{}",
                report.released.join(", "),
                if report.failed.is_empty() { "" } else { " with failures" }
            );
        }
        report
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, OutputStream};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct LoggedCapture(Log, bool);

    impl CaptureHandle for LoggedCapture {
        fn stop(&mut self) -> Result<(), AudioError> {
            self.0.lock().unwrap().push("microphone");
            if self.1 {
                Err(AudioError::DeviceError("stuck".into()))
            } else {
                Ok(())
            }
        }
    }

    struct LoggedOutput(Log);

    impl OutputStream for LoggedOutput {
        fn write(&mut self, _: &[i16]) -> Result<(), AudioError> {
            Ok(())
        }
        fn clear(&mut self) {}
        fn close(&mut self) -> Result<(), AudioError> {
            self.0.lock().unwrap().push("playback");
            Ok(())
        }
    }

    struct LoggedLock(Log);

    impl WakeLockGuard for LoggedLock {
        fn release(&mut self) -> Result<(), GuardError> {
            self.0.lock().unwrap().push("wake lock");
            Ok(())
        }
    }

    fn populated(log: &Log, failing_capture: bool) -> (SessionResources, Uuid) {
        let id = Uuid::new_v4();
        let mut resources = SessionResources::new();
        resources.begin(id);
        assert!(resources
            .install_wake_lock(id, Box::new(LoggedLock(log.clone())))
            .is_ok());
        assert!(resources
            .install_capture(id, Box::new(LoggedCapture(log.clone(), failing_capture)))
            .is_ok());
        assert!(resources
            .install_playback(id, PlaybackQueue::new(Box::new(LoggedOutput(log.clone())), 24_000))
            .is_ok());
        assert!(resources.install_timers(id, CancellationToken::new()));
        (resources, id)
    }

    #[test]
    fn test_teardown_order() {
        let log: Log = Arc::default();
        let (mut resources, _) = populated(&log, false);

        let report = resources.teardown();

        assert_eq!(report.released, vec!["timers", "microphone", "playback", "wake lock"]);
        assert_eq!(*log.lock().unwrap(), vec!["microphone", "playback", "wake lock"]);
        assert!(resources.is_empty());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let log: Log = Arc::default();
        let (mut resources, _) = populated(&log, false);

        resources.teardown();
        let second = resources.teardown();

        assert!(second.is_empty());
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_failed_step_does_not_block_later_steps() {
        let log: Log = Arc::default();
        let (mut resources, _) = populated(&log, true);

        let report = resources.teardown();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "microphone");
        assert_eq!(*log.lock().unwrap(), vec!["microphone", "playback", "wake lock"]);
    }

    #[test]
    fn test_stale_generation_refuses_resources() {
        let log: Log = Arc::default();
        let mut resources = SessionResources::new();
        let old = Uuid::new_v4();
        resources.begin(old);
        resources.teardown();

        let refused = resources.install_capture(old, Box::new(LoggedCapture(log.clone(), false)));
        assert!(refused.is_err());

        let token = CancellationToken::new();
        assert!(!resources.install_timers(old, token.clone()));
        assert!(token.is_cancelled());
        assert!(resources.is_empty());
    }

    #[test]
    fn test_sender_requires_current_generation() {
        let log: Log = Arc::default();
        let (resources, id) = populated(&log, false);
        assert!(resources.sender(id).is_none()); // no connection installed
        assert!(resources.sender(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_no_wake_lock_is_unsupported() {
        assert!(matches!(NoWakeLock.acquire(), Err(GuardError::Unsupported)));
    }
}
