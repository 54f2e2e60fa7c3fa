use serde::Serialize;

use crate::core::transport::Speaker;

/// Transcript text of the current turn for both speakers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranscriptSnapshot {
    pub user: String,
    pub agent: String,
}

impl TranscriptSnapshot {
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.agent.is_empty()
    }
}

/// Accumulates incremental transcript fragments per speaker for one turn.
///
/// Text only grows within a turn; [`clear`](Self::clear) empties both
/// speakers at once at the turn boundary.
#[derive(Debug, Clone, Default)]
pub struct TranscriptAccumulator {
    current: TranscriptSnapshot,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment exactly as received.
    pub fn append(&mut self, speaker: Speaker, fragment: &str) {
        match speaker {
            Speaker::User => self.current.user.push_str(fragment),
            Speaker::Agent => self.current.agent.push_str(fragment),
        }
    }

    pub fn text(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::User => &self.current.user,
            Speaker::Agent => &self.current.agent,
        }
    }

    pub fn clear(&mut self) {
        self.current = TranscriptSnapshot::default();
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        self.current.clone()
    }
}
