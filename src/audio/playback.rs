//! Gapless playback of streamed model audio
//!
//! Each chunk is scheduled to start at `max(now, next_start)`, after which
//! `next_start` advances by the chunk's duration. Consecutive chunks play
//! back to back, and a chunk arriving after a gap starts immediately
//! instead of "catching up" in the past.

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

use super::pcm::duration_of;
use super::AudioError;

/// Open output stream on a playback device
pub trait OutputStream: Send {
    /// Queue PCM16 samples after everything already queued
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError>;

    /// Drop everything queued but not yet played
    fn clear(&mut self);

    /// Close the stream and release the device
    fn close(&mut self) -> Result<(), AudioError>;
}

/// Source of output streams (a device backend or a test fake)
pub trait AudioOutput: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputStream>, AudioError>;
}

/// The next-start cursor shared by playback scheduling and status tracking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackClock {
    next_start: Option<Instant>,
}

impl PlaybackClock {
    /// Reserve `duration` of playback time; returns `(start, end)`
    pub fn schedule(&mut self, duration: Duration, now: Instant) -> (Instant, Instant) {
        let start = match self.next_start {
            Some(next) if next > now => next,
            _ => now,
        };
        let end = start + duration;
        self.next_start = Some(end);
        (start, end)
    }

    /// Forget all scheduled playback
    pub fn reset(&mut self) {
        self.next_start = None;
    }

    /// Whether scheduled audio is still playing at `now`
    pub fn is_playing(&self, now: Instant) -> bool {
        self.next_start.is_some_and(|next| next > now)
    }

    pub fn next_start(&self) -> Option<Instant> {
        self.next_start
    }
}

/// A chunk handed to the output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub start: Instant,
    pub end: Instant,
    pub samples: usize,
}

/// Playback queue for one session's output stream
pub struct PlaybackQueue {
    output: Box<dyn OutputStream>,
    sample_rate: u32,
    clock: PlaybackClock,
    scheduled: VecDeque<ScheduledChunk>,
}

impl PlaybackQueue {
    pub fn new(output: Box<dyn OutputStream>, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            clock: PlaybackClock::default(),
            scheduled: VecDeque::new(),
        }
    }

    /// Schedule a chunk right after the previous one (or now, after a gap)
    pub fn schedule(&mut self, samples: &[i16], now: Instant) -> Result<ScheduledChunk, AudioError> {
        self.prune(now);

        self.output.write(samples)?;

        let (start, end) = self
            .clock
            .schedule(duration_of(samples.len(), self.sample_rate), now);
        let chunk = ScheduledChunk {
            start,
            end,
            samples: samples.len(),
        };
        self.scheduled.push_back(chunk);
        Ok(chunk)
    }

    /// Stop every scheduled chunk and reset the cursor.
    ///
    /// Returns how many chunks were still pending.
    pub fn stop_all(&mut self, now: Instant) -> usize {
        self.prune(now);
        let pending = self.scheduled.len();
        self.output.clear();
        self.scheduled.clear();
        self.clock.reset();
        pending
    }

    /// Chunks that have not finished playing at `now`
    pub fn pending(&self, now: Instant) -> usize {
        self.scheduled.iter().filter(|c| c.end > now).count()
    }

    pub fn is_playing(&self, now: Instant) -> bool {
        self.clock.is_playing(now)
    }

    pub fn next_start(&self) -> Option<Instant> {
        self.clock.next_start()
    }

    /// Discard queued audio and close the output stream
    pub fn close(mut self) -> Result<(), AudioError> {
        self.output.clear();
        self.output.close()
    }

    fn prune(&mut self, now: Instant) {
        while self.scheduled.front().is_some_and(|c| c.end <= now) {
            self.scheduled.pop_front();
        }
    }
}
