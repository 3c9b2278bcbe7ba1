//! Session state machine
//!
//! This module implements the session lifecycle using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new session and a list of effects to execute.
//!
//! Every connection attempt gets a fresh id. Events from a connection that
//! has since been torn down carry an old id and are ignored, which is what
//! keeps a late message or close from a stopped connection from touching
//! the session.

use serde::Serialize;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::audio::PlaybackClock;
use crate::coaching::CoachingFeedback;
use crate::live::{CloseInfo, Failure, RetryPolicy, ServerEvent};
use crate::persona::{build_system_instruction, PersonaConfig};
use crate::router;
use crate::transcript::{Speaker, Transcript};

/// Connection age at which an idle connection is proactively replaced
pub const RECYCLE_AFTER: Duration = Duration::from_secs(270);

/// Finalized turns replayed into the system instruction on reconnect
pub const CONTEXT_TURNS: usize = 10;

/// Externally visible session status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    #[default]
    Idle,
    Connecting,
    Listening,
    Speaking,
    /// A text-mode coaching request is in flight
    Processing,
    Reconnecting,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Connecting => "connecting",
            Status::Listening => "listening",
            Status::Speaking => "speaking",
            Status::Processing => "processing",
            Status::Reconnecting => "reconnecting",
            Status::Error => "error",
        }
    }

    /// A connection can be replaced now without cutting anyone off
    pub fn is_interruptible(&self) -> bool {
        matches!(self, Status::Idle | Status::Listening)
    }

    /// Whether `start()` is accepted
    pub fn can_start(&self) -> bool {
        matches!(self, Status::Idle | Status::Error)
    }
}

/// Why the current connection attempt was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOrigin {
    UserStart,
    Retry,
    Recycle,
}

/// Tunables for one controller
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub retry: RetryPolicy,
    pub recycle_after: Duration,
    pub context_turns: usize,
    pub coaching_enabled: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            recycle_after: RECYCLE_AFTER,
            context_turns: CONTEXT_TURNS,
            coaching_enabled: false,
        }
    }
}

/// Authoritative session state. Only the reducer produces new values.
#[derive(Debug, Clone)]
pub struct Session {
    pub status: Status,
    /// The user wants a session (false after stop or a terminal failure)
    pub is_active: bool,
    pub reconnect_attempts: u32,
    /// When the current connection finished setup
    pub session_started_at: Option<Instant>,
    /// Id of the current connection attempt
    pub attempt_id: Option<Uuid>,
    pub origin: Option<OpenOrigin>,
    pub persona: PersonaConfig,
    pub transcript: Transcript,
    pub last_error: Option<String>,
    /// The server announced it will close soon
    pub recycle_requested: bool,
    /// Scheduled model audio, mirrored from the playback queue
    pub playback: PlaybackClock,
    /// Model audio or transcription has arrived and the turn has not completed yet
    pub model_turn_open: bool,
    /// Entry whose text-mode coaching request keeps the session `Processing`
    pub pending_text_entry: Option<u64>,
    pub options: SessionOptions,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            status: Status::Idle,
            is_active: false,
            reconnect_attempts: 0,
            session_started_at: None,
            attempt_id: None,
            origin: None,
            persona: PersonaConfig::default(),
            transcript: Transcript::new(),
            last_error: None,
            recycle_requested: false,
            playback: PlaybackClock::default(),
            model_turn_open: false,
            pending_text_entry: None,
            options,
        }
    }

    /// Age of the current connection
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.session_started_at.map(|t| now.saturating_duration_since(t))
    }
}

/// Events that can trigger state transitions.
/// These come from the public API, the effect runner, the connection and
/// the session timers.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to start a session
    Start {
        persona: PersonaConfig,
    },
    /// User asked to stop the session
    Stop,
    /// User typed text
    SendText {
        text: String,
    },
    /// Controller is shutting down
    Exit,

    // Connection events (include id to drop events from old connections)
    SessionOpened {
        id: Uuid,
    },
    OpenFailed {
        id: Uuid,
        failure: Failure,
    },
    Server {
        id: Uuid,
        event: ServerEvent,
    },
    ConnectionClosed {
        id: Uuid,
        close: CloseInfo,
    },
    /// The microphone track ended without being stopped
    TrackEnded {
        id: Uuid,
        reason: String,
    },

    // Timers
    RetryDue {
        attempt: u32,
    },
    /// Once per second while a connection is open
    SessionTick {
        id: Uuid,
    },
    KeepaliveDue {
        id: Uuid,
    },

    // Coaching
    CoachingReply {
        entry_id: u64,
        feedback: CoachingFeedback,
        text_mode: bool,
    },
    CoachingFailed {
        entry_id: u64,
        err: String,
        text_mode: bool,
    },
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Acquire wake lock, microphone and output, connect and configure
    OpenSession {
        id: Uuid,
        persona: PersonaConfig,
        system_instruction: String,
    },
    /// Release every session resource in order
    Teardown {
        /// A replacement connection follows
        restarting: bool,
    },
    ScheduleRetry {
        attempt: u32,
        delay: Duration,
    },
    /// Start the keepalive and session tick timers for a connection
    StartSessionTimers {
        id: Uuid,
    },
    SendKeepalive {
        id: Uuid,
    },
    /// Send typed text as a user turn
    ForwardText {
        id: Uuid,
        text: String,
    },
    PlayAudio {
        id: Uuid,
        samples: Vec<i16>,
    },
    StopPlayback {
        id: Uuid,
    },
    CoachSessionStart {
        persona_id: String,
    },
    CoachUtterance {
        entry_id: u64,
        text: String,
        text_mode: bool,
    },
    /// Signal to publish a new snapshot
    EmitUi,
}

/// Reducer function: (session, event) -> (next_session, effects)
///
/// Key rules:
/// - Never mutate the input session
/// - Ignore events with stale connection ids
/// - Emit EmitUi after visible changes
pub fn reduce(session: &Session, event: Event) -> (Session, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use Status::*;

    let now = Instant::now();
    let is_current = |eid: Uuid| session.attempt_id == Some(eid);
    let mut next = session.clone();

    match (session.status, event) {
        // -----------------
        // User commands
        // -----------------
        (Idle | Error, Start { persona }) => {
            let id = Uuid::new_v4();
            log::info!("Session {} starting (persona: {})", id, persona.id);

            next.status = Connecting;
            next.is_active = true;
            next.reconnect_attempts = 0;
            next.attempt_id = Some(id);
            next.origin = Some(OpenOrigin::UserStart);
            next.last_error = None;
            next.recycle_requested = false;
            next.session_started_at = None;
            next.persona = persona;
            next.playback.reset();
            next.model_turn_open = false;

            let mut effects = vec![open_session(&next, id)];
            if next.options.coaching_enabled {
                effects.push(CoachSessionStart {
                    persona_id: next.persona.id.clone(),
                });
            }
            effects.push(EmitUi);
            (next, effects)
        }
        (status, Start { .. }) => {
            log::debug!("Start ignored while {}", status.as_str());
            (next, vec![])
        }

        (_, Stop) => {
            log::info!("Session stopped by user");
            stop(next)
        }
        (_, Exit) => {
            log::info!("Session controller exiting");
            stop(next)
        }

        (_, SendText { text }) => send_text(next, text),

        // -----------------
        // Connecting
        // -----------------
        (Connecting, SessionOpened { id }) if is_current(id) => {
            log::info!("Session {} open ({:?}), listening", id, session.origin);

            next.status = Listening;
            next.reconnect_attempts = 0;
            next.session_started_at = Some(now);
            next.origin = None;
            next.last_error = None;
            next.recycle_requested = false;
            (next, vec![StartSessionTimers { id }, EmitUi])
        }
        (Connecting, OpenFailed { id, failure }) if is_current(id) => {
            log::warn!("Session {} failed to open: {}", id, failure.detail);
            if failure.is_permanent() || session.origin == Some(OpenOrigin::UserStart) {
                fail(next, failure)
            } else {
                retry_or_fail(next, failure)
            }
        }

        // -----------------
        // Listening / Speaking
        // -----------------
        (Listening | Speaking, Server { id, event }) if is_current(id) => match event {
            ServerEvent::Error(message) => {
                let failure = Failure::from_text(&message);
                if failure.is_permanent() {
                    fail(next, failure)
                } else {
                    retry_or_fail(next, failure)
                }
            }
            event => {
                let effects = router::route(&mut next, id, event, now);
                (next, effects)
            }
        },
        (Listening | Speaking, ConnectionClosed { id, close }) if is_current(id) => {
            let failure = Failure::from_close(&close);
            if failure.is_permanent() {
                fail(next, failure)
            } else if close.clean {
                log::info!(
                    "Server ended the session (code {}): {}",
                    close.code,
                    close.reason
                );
                next.status = Idle;
                next.is_active = false;
                clear_connection(&mut next);
                next.transcript.finalize_all();
                (next, vec![Teardown { restarting: false }, EmitUi])
            } else {
                retry_or_fail(next, failure)
            }
        }
        (Listening | Speaking, TrackEnded { id, reason }) if is_current(id) => {
            retry_or_fail(next, Failure::transient(format!("microphone track ended: {}", reason)))
        }
        (Listening | Speaking, SessionTick { id }) if is_current(id) => tick(next, now),
        (Listening | Speaking, KeepaliveDue { id }) if is_current(id) => {
            (next, vec![SendKeepalive { id }])
        }

        // -----------------
        // Reconnecting
        // -----------------
        (Reconnecting, RetryDue { attempt })
            if session.is_active && attempt == session.reconnect_attempts =>
        {
            let id = Uuid::new_v4();
            log::info!(
                "Reconnecting (attempt {}/{})",
                attempt,
                session.options.retry.max_attempts
            );

            next.status = Connecting;
            next.attempt_id = Some(id);
            next.origin = Some(OpenOrigin::Retry);
            let open = open_session(&next, id);
            (next, vec![open, EmitUi])
        }
        (_, RetryDue { attempt }) => {
            log::debug!("Retry {} no longer wanted, ignoring", attempt);
            (next, vec![])
        }

        // -----------------
        // Coaching replies
        // -----------------
        (
            status,
            CoachingReply {
                entry_id,
                feedback,
                text_mode,
            },
        ) => {
            // Only the request that put us in Processing may answer as the assistant
            if text_mode && awaits_text_reply(session, status, entry_id) {
                next.transcript
                    .push_final(Speaker::Assistant, feedback.display_text());
                next.status = Idle;
                next.pending_text_entry = None;
            }
            next.transcript.attach_coaching(entry_id, feedback);
            (next, vec![EmitUi])
        }
        (
            status,
            CoachingFailed {
                entry_id,
                err,
                text_mode,
            },
        ) => {
            log::warn!("Coaching failed for entry {}: {}", entry_id, err);
            if text_mode && awaits_text_reply(session, status, entry_id) {
                next.status = Idle;
                next.pending_text_entry = None;
                next.last_error = Some(format!("Coaching request failed: {}", err));
                return (next, vec![EmitUi]);
            }
            (next, vec![])
        }

        // Stale ids, or events that don't apply in the current status
        _ => (next, vec![]),
    }
}

fn awaits_text_reply(session: &Session, status: Status, entry_id: u64) -> bool {
    status == Status::Processing && session.pending_text_entry == Some(entry_id)
}

fn open_session(session: &Session, id: Uuid) -> Effect {
    let context = session.transcript.recent_final(session.options.context_turns);
    Effect::OpenSession {
        id,
        persona: session.persona.clone(),
        system_instruction: build_system_instruction(&session.persona, &context),
    }
}

/// Forget everything tied to the current connection
fn clear_connection(session: &mut Session) {
    session.attempt_id = None;
    session.origin = None;
    session.session_started_at = None;
    session.recycle_requested = false;
    session.playback.reset();
    session.model_turn_open = false;
}

fn stop(mut next: Session) -> (Session, Vec<Effect>) {
    next.status = Status::Idle;
    next.is_active = false;
    next.pending_text_entry = None;
    clear_connection(&mut next);
    next.transcript.finalize_all();
    (next, vec![Effect::Teardown { restarting: false }, Effect::EmitUi])
}

fn fail(mut next: Session, failure: Failure) -> (Session, Vec<Effect>) {
    log::error!("Session failed: {}", failure.detail);

    next.status = Status::Error;
    next.is_active = false;
    next.last_error = Some(failure.user_message);
    clear_connection(&mut next);
    next.transcript.finalize_all();
    (next, vec![Effect::Teardown { restarting: false }, Effect::EmitUi])
}

fn retry_or_fail(mut next: Session, failure: Failure) -> (Session, Vec<Effect>) {
    let policy = next.options.retry;

    let Some(attempt) = policy.next_attempt(next.reconnect_attempts) else {
        let exhausted = Failure::retries_exhausted(next.reconnect_attempts, &failure);
        return fail(next, exhausted);
    };

    let delay = policy.delay(attempt);
    log::warn!(
        "Connection lost ({}), retrying in {:?} (attempt {}/{})",
        failure.detail,
        delay,
        attempt,
        policy.max_attempts
    );

    next.status = Status::Reconnecting;
    next.reconnect_attempts = attempt;
    clear_connection(&mut next);
    (
        next,
        vec![
            Effect::Teardown { restarting: true },
            Effect::ScheduleRetry { attempt, delay },
            Effect::EmitUi,
        ],
    )
}

fn tick(mut next: Session, now: Instant) -> (Session, Vec<Effect>) {
    let mut effects = Vec::new();

    // Model finished and its buffered audio has drained
    if next.status == Status::Speaking && !next.model_turn_open && !next.playback.is_playing(now) {
        next.status = Status::Listening;
        effects.push(Effect::EmitUi);
    }

    // Never cut into a model turn, even one that only carries transcription
    if !next.status.is_interruptible() || next.model_turn_open {
        return (next, effects);
    }

    let age = next.elapsed(now).unwrap_or_default();
    if !next.recycle_requested && age < next.options.recycle_after {
        return (next, effects);
    }

    let id = Uuid::new_v4();
    log::info!("Recycling connection after {:?}", age);

    next.status = Status::Connecting;
    clear_connection(&mut next);
    next.attempt_id = Some(id);
    next.origin = Some(OpenOrigin::Recycle);
    let open = open_session(&next, id);
    (
        next,
        vec![Effect::Teardown { restarting: true }, open, Effect::EmitUi],
    )
}

fn send_text(mut next: Session, text: String) -> (Session, Vec<Effect>) {
    let text = text.trim().to_string();
    if text.is_empty() {
        return (next, vec![]);
    }

    match (next.status, next.attempt_id) {
        (Status::Listening | Status::Speaking, Some(id)) => {
            next.transcript.finalize_speaker(Speaker::User);
            let entry_id = next.transcript.push_final(Speaker::User, text.clone());

            let mut effects = vec![Effect::ForwardText {
                id,
                text: text.clone(),
            }];
            if next.options.coaching_enabled {
                effects.push(Effect::CoachUtterance {
                    entry_id,
                    text,
                    text_mode: false,
                });
            }
            effects.push(Effect::EmitUi);
            (next, effects)
        }
        (Status::Idle, _) if next.options.coaching_enabled => {
            let entry_id = next.transcript.push_final(Speaker::User, text.clone());
            next.status = Status::Processing;
            next.pending_text_entry = Some(entry_id);
            (
                next,
                vec![
                    Effect::CoachUtterance {
                        entry_id,
                        text,
                        text_mode: true,
                    },
                    Effect::EmitUi,
                ],
            )
        }
        (Status::Processing, _) => {
            log::debug!("Text ignored while a coaching request is in flight");
            (next, vec![])
        }
        (status, _) => {
            log::info!("No open connection ({}), text kept in transcript", status.as_str());
            next.transcript.push_final(Speaker::User, text);
            (next, vec![Effect::EmitUi])
        }
    }
}
