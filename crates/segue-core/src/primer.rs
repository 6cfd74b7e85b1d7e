//! Primer extraction.
//!
//! The primer for the next request is the tail of the most recent segment.
//! Pure functions only; the buffer and the batch generator decide which
//! segment to feed in.

use crate::note::NoteEvent;
use crate::segment::Segment;

/// Last `window` notes of `notes`, or all of them if there are fewer.
pub fn tail(notes: &[NoteEvent], window: usize) -> Vec<NoteEvent> {
    let start = notes.len().saturating_sub(window);
    notes[start..].to_vec()
}

/// Primer derived from `segment`, falling back to `default` when there is
/// no previous segment. Either way the result is at most `window` long.
pub fn extract(segment: Option<&Segment>, window: usize, default: &[NoteEvent]) -> Vec<NoteEvent> {
    match segment {
        Some(segment) => tail(segment.notes(), window),
        None => tail(default, window),
    }
}
