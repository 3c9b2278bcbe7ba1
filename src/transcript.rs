//! Conversation transcript
//!
//! Partial transcription deltas for each speaker accumulate into one open
//! (non-final) entry until the turn completes, the speaker is interrupted
//! or the session stops.
//!
//! # Invariants
//!
//! - At most one open entry per speaker
//! - Finalized entries never change text
//! - Entry ids are unique and increase in creation order

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::coaching::CoachingFeedback;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn label(self) -> &'static str {
        match self {
            Speaker::User => "User",
            Speaker::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: u64,
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
    /// Coaching reply for this entry, once it arrives
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coaching: Option<CoachingFeedback>,
}

/// Ordered list of transcript entries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    next_id: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// The speaker's open entry, if any
    pub fn open_entry(&self, speaker: Speaker) -> Option<&TranscriptEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.speaker == speaker && !e.is_final)
    }

    /// Append a partial delta to the speaker's open entry, opening one if
    /// needed. Empty deltas are ignored.
    ///
    /// Returns the id of the entry the delta landed in.
    pub fn append_delta(&mut self, speaker: Speaker, delta: &str) -> Option<u64> {
        if delta.is_empty() {
            return None;
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.speaker == speaker && !e.is_final)
        {
            entry.text.push_str(delta);
            return Some(entry.id);
        }

        Some(self.push(speaker, delta.to_string(), false))
    }

    /// Append an already-final entry (typed text, coaching replies)
    pub fn push_final(&mut self, speaker: Speaker, text: impl Into<String>) -> u64 {
        self.push(speaker, text.into(), true)
    }

    /// Finalize the speaker's open entry; an empty one is dropped
    pub fn finalize_speaker(&mut self, speaker: Speaker) -> Option<u64> {
        let idx = self
            .entries
            .iter()
            .rposition(|e| e.speaker == speaker && !e.is_final)?;

        if self.entries[idx].text.trim().is_empty() {
            self.entries.remove(idx);
            return None;
        }

        self.entries[idx].is_final = true;
        Some(self.entries[idx].id)
    }

    /// Finalize every open entry with text and drop the empty ones.
    ///
    /// Returns the ids of the entries finalized by this call.
    pub fn finalize_all(&mut self) -> Vec<u64> {
        self.entries
            .retain(|e| e.is_final || !e.text.trim().is_empty());

        let mut finalized = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| !e.is_final) {
            entry.is_final = true;
            finalized.push(entry.id);
        }

        if !finalized.is_empty() {
            log::debug!("Transcript: finalized {} entries", finalized.len());
        }
        finalized
    }

    /// Attach a coaching reply to an entry. Returns false if the entry is gone.
    pub fn attach_coaching(&mut self, id: u64, feedback: CoachingFeedback) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.coaching = Some(feedback);
                true
            }
            None => false,
        }
    }

    /// The last `max_turns` finalized entries, oldest first
    pub fn recent_final(&self, max_turns: usize) -> Vec<&TranscriptEntry> {
        let finals: Vec<&TranscriptEntry> = self.entries.iter().filter(|e| e.is_final).collect();
        let skip = finals.len().saturating_sub(max_turns);
        finals.into_iter().skip(skip).collect()
    }

    fn push(&mut self, speaker: Speaker, text: String, is_final: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(TranscriptEntry {
            id,
            speaker,
            text,
            is_final,
            created_at: Utc::now(),
            coaching: None,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_accumulate_into_one_entry() {
        let mut t = Transcript::new();
        t.append_delta(Speaker::User, "Hel");
        t.append_delta(Speaker::User, "lo ");
        t.append_delta(Speaker::User, "there");

        assert_eq!(t.len(), 1);
        assert_eq!(t.entries()[0].text, "Hello there");
        assert!(!t.entries()[0].is_final);
    }

    #[test]
    fn test_empty_delta_is_ignored() {
        let mut t = Transcript::new();
        assert_eq!(t.append_delta(Speaker::User, ""), None);
        assert!(t.is_empty());
    }

    #[test]
    fn test_speakers_have_separate_open_entries() {
        let mut t = Transcript::new();
        t.append_delta(Speaker::User, "Hi");
        t.append_delta(Speaker::Assistant, "Hello");
        t.append_delta(Speaker::User, " again");

        assert_eq!(t.len(), 2);
        assert_eq!(t.open_entry(Speaker::User).unwrap().text, "Hi again");
        assert_eq!(t.open_entry(Speaker::Assistant).unwrap().text, "Hello");
    }

    #[test]
    fn test_finalize_all_drops_empty_entries() {
        let mut t = Transcript::new();
        t.append_delta(Speaker::User, "Question?");
        t.append_delta(Speaker::Assistant, "   ");

        let finalized = t.finalize_all();

        assert_eq!(finalized.len(), 1);
        assert_eq!(t.len(), 1);
        assert!(t.entries().iter().all(|e| e.is_final));
        assert!(t.finalize_all().is_empty());
    }

    #[test]
    fn test_delta_after_finalize_opens_new_entry() {
        let mut t = Transcript::new();
        t.append_delta(Speaker::Assistant, "First.");
        t.finalize_speaker(Speaker::Assistant);
        t.append_delta(Speaker::Assistant, "Second.");

        assert_eq!(t.len(), 2);
        assert_eq!(t.entries()[0].text, "First.");
        assert!(t.entries()[0].is_final);
        assert_eq!(t.entries()[1].text, "Second.");
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let mut t = Transcript::new();
        let a = t.push_final(Speaker::User, "a");
        let b = t.append_delta(Speaker::Assistant, "b").unwrap();
        let c = t.push_final(Speaker::User, "c");
        assert!(a < b && b < c);
    }

    #[test]
    fn test_attach_coaching() {
        let mut t = Transcript::new();
        let id = t.push_final(Speaker::User, "Ich habe gegangen");
        let feedback = CoachingFeedback {
            summary: "Use 'bin gegangen'".to_string(),
            ..Default::default()
        };

        assert!(t.attach_coaching(id, feedback.clone()));
        assert_eq!(t.get(id).unwrap().coaching.as_ref(), Some(&feedback));
        assert!(!t.attach_coaching(999, feedback));
    }

    #[test]
    fn test_recent_final_keeps_order() {
        let mut t = Transcript::new();
        for i in 0..5 {
            t.push_final(Speaker::User, format!("turn {}", i));
        }
        t.append_delta(Speaker::Assistant, "open");

        let recent: Vec<&str> = t.recent_final(2).iter().map(|e| e.text.as_str()).collect();
        assert_eq!(recent, vec!["turn 3", "turn 4"]);
    }
}
