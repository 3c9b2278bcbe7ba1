//! Real-time voice session core for the Gemini Live duplex API.
//!
//! A `SessionController` owns one session at a time: it streams the
//! microphone to the service, plays the model's audio, keeps a transcript
//! of both sides and survives dropped connections with exponential
//! back-off. All state changes go through the reducer in
//! `state_machine`; side effects run in an `EffectRunner`.
//!
//! ```text
//! start() ─▶ Connecting ─▶ Listening ⇄ Speaking ─▶ Idle
//!                 ▲              │
//!                 └─ Reconnecting ◀┘ (unclean close)      any ─▶ Error
//! ```

pub mod audio;
pub mod coaching;
pub mod controller;
pub mod credentials;
pub mod effects;
pub mod guard;
pub mod live;
pub mod persona;
pub mod preview;
pub mod router;
pub mod settings;
pub mod state_machine;
pub mod transcript;

pub use controller::{ControllerError, SessionController, SessionSnapshot};
pub use effects::{Collaborators, EffectRunner, LiveEffectRunner, RunnerConfig};
pub use persona::PersonaConfig;
pub use settings::AppSettings;
pub use state_machine::{SessionOptions, Status};
pub use transcript::{Speaker, TranscriptEntry};
