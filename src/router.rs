//! Inbound message routing
//!
//! Applies one decoded server event to a live session: transcript deltas,
//! model audio, interruptions and turn boundaries. Called by the reducer
//! only while the session is `Listening` or `Speaking` and the event
//! belongs to the current connection.

use tokio::time::Instant;
use uuid::Uuid;

use crate::audio::pcm::{duration_of, OUTPUT_SAMPLE_RATE};
use crate::live::ServerEvent;
use crate::state_machine::{Effect, Session, Status};
use crate::transcript::Speaker;

/// Route one server event. Mutates `session` in place and returns the
/// effects to run.
pub fn route(session: &mut Session, id: Uuid, event: ServerEvent, now: Instant) -> Vec<Effect> {
    match event {
        ServerEvent::InputTranscription(text) => {
            session.transcript.append_delta(Speaker::User, &text);
            vec![Effect::EmitUi]
        }

        ServerEvent::Audio(samples) => {
            if samples.is_empty() {
                return vec![];
            }
            session
                .playback
                .schedule(duration_of(samples.len(), OUTPUT_SAMPLE_RATE), now);
            session.model_turn_open = true;

            let mut effects = vec![Effect::PlayAudio { id, samples }];
            if session.status != Status::Speaking {
                session.status = Status::Speaking;
                effects.push(Effect::EmitUi);
            }
            effects
        }

        ServerEvent::OutputTranscription(text) => {
            session.transcript.append_delta(Speaker::Assistant, &text);
            session.model_turn_open = true;
            vec![Effect::EmitUi]
        }

        ServerEvent::Interrupted => {
            log::info!("Model interrupted by user speech");
            session.transcript.finalize_speaker(Speaker::Assistant);
            session.playback.reset();
            session.model_turn_open = false;
            session.status = Status::Listening;
            vec![Effect::StopPlayback { id }, Effect::EmitUi]
        }

        ServerEvent::TurnComplete => {
            let finalized = session.transcript.finalize_all();
            session.model_turn_open = false;

            // Buffered audio keeps the session Speaking until it drains
            if !session.playback.is_playing(now) {
                session.status = Status::Listening;
            }

            let mut effects = Vec::new();
            if session.options.coaching_enabled {
                for entry_id in finalized {
                    if let Some(entry) = session.transcript.get(entry_id) {
                        if entry.speaker == Speaker::User {
                            effects.push(Effect::CoachUtterance {
                                entry_id,
                                text: entry.text.clone(),
                                text_mode: false,
                            });
                        }
                    }
                }
            }
            effects.push(Effect::EmitUi);
            effects
        }

        ServerEvent::GoAway { time_left } => {
            log::info!(
                "Server requested reconnect (time left: {})",
                time_left.as_deref().unwrap_or("unknown")
            );
            session.recycle_requested = true;
            vec![]
        }

        // Handled by the reducer before routing
        ServerEvent::SetupComplete | ServerEvent::Error(_) => vec![],
    }
}
