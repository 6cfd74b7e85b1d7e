//! Segments and the requests that produce them.

use crate::note::NoteEvent;
use crate::timing::StepTime;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Monotonically increasing segment identifier.
///
/// Ids are handed out when a generation request is issued, so playback
/// order equals id order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Model parameters sent with every request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Model bundle path or identifier.
    pub bundle: String,
    /// Length of each generated segment in steps.
    pub step_count: u32,
    /// Sampling temperature ("creativity").
    pub temperature: f64,
}

/// A request for one segment, consumed by exactly one worker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationRequest {
    /// Id the resulting segment will carry.
    pub segment: SegmentId,
    /// Buffer slot waiting for the result.
    pub slot: usize,
    /// 1-based attempt number for this segment.
    pub attempt: u32,
    /// Seed melody, at most the configured primer window long.
    pub primer: Vec<NoteEvent>,
    pub settings: GenerationSettings,
}

/// One generated unit of melody. Immutable once created.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    id: SegmentId,
    notes: Vec<NoteEvent>,
    step_count: u32,
    primer_used: Vec<NoteEvent>,
    generated_at: SystemTime,
}

impl Segment {
    /// Create a segment stamped with the current time.
    pub fn new(id: SegmentId, notes: Vec<NoteEvent>, step_count: u32, primer_used: Vec<NoteEvent>) -> Self {
        Self {
            id,
            notes,
            step_count,
            primer_used,
            generated_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn notes(&self) -> &[NoteEvent] {
        &self.notes
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn primer_used(&self) -> &[NoteEvent] {
        &self.primer_used
    }

    pub fn generated_at(&self) -> SystemTime {
        self.generated_at
    }

    /// Length of the segment on the playback timeline.
    pub fn len_steps(&self) -> StepTime {
        StepTime::from_steps(self.step_count)
    }

    /// Each note paired with its onset in steps from the segment start.
    pub fn onsets(&self) -> impl Iterator<Item = (StepTime, &NoteEvent)> + '_ {
        self.notes.iter().scan(StepTime::ZERO, |offset, note| {
            let onset = *offset;
            *offset += note.duration;
            Some((onset, note))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_onsets_accumulate_durations() {
        let notes = vec![
            NoteEvent::note(60, StepTime::from_steps(2), 100),
            NoteEvent::rest(StepTime::from_ratio(1, 2)),
            NoteEvent::note(62, StepTime::from_steps(1), 100),
        ];
        let seg = Segment::new(SegmentId(1), notes, 4, Vec::new());
        let onsets: Vec<StepTime> = seg.onsets().map(|(at, _)| at).collect();
        assert_eq!(
            onsets,
            vec![StepTime::ZERO, StepTime::from_steps(2), StepTime::from_ratio(5, 2)]
        );
        assert_eq!(seg.len_steps(), StepTime::from_steps(4));
    }

    #[test]
    fn test_segment_id_ordering_and_display() {
        assert!(SegmentId(3) < SegmentId(4));
        assert_eq!(SegmentId(7).to_string(), "#7");
    }
}
