//! Shared playback state.
//!
//! The [`StatusBoard`] wraps the scheduler's [`PlaybackState`] in an
//! `Arc<RwLock>`. Only the playback thread writes it; the transport and the
//! console read snapshots.

use crate::events::PlaybackStatus;
use crate::note::NoteEvent;
use crate::segment::SegmentId;
use crate::timing::StepTime;
use std::sync::{Arc, PoisonError, RwLock};

/// What the playback thread is doing right now.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    /// Segment currently sounding.
    pub current_segment: Option<SegmentId>,
    /// Position on the global step timeline. Continues across segments and
    /// resets only on Stop.
    pub position: StepTime,
    /// Timeline step at which `current_segment` started.
    pub segment_origin: StepTime,
    pub steps_per_second: f64,
    /// Most recently played notes, oldest first.
    pub history_tail: Vec<NoteEvent>,
    pub underruns: u64,
    pub notes_played: u64,
    pub sink_errors: u64,
}

impl PlaybackState {
    /// Step offset into the current segment; zero when nothing is sounding.
    pub fn segment_offset(&self) -> StepTime {
        if self.current_segment.is_none() || self.position < self.segment_origin {
            return StepTime::ZERO;
        }
        self.position - self.segment_origin
    }
}

/// Thread-safe handle to the playback state.
#[derive(Clone, Debug, Default)]
pub struct StatusBoard {
    state: Arc<RwLock<PlaybackState>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the state with a closure.
    pub fn with_read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&PlaybackState) -> R,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Modify the state with a closure.
    pub(crate) fn with_write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut PlaybackState) -> R,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Clone of the full state.
    pub fn snapshot(&self) -> PlaybackState {
        self.with_read(|s| s.clone())
    }

    pub fn status(&self) -> PlaybackStatus {
        self.with_read(|s| s.status)
    }

    pub fn position(&self) -> StepTime {
        self.with_read(|s| s.position)
    }
}
