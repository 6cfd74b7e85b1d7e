//! Standard MIDI File recorder.
//!
//! Captures played notes on the global step timeline and writes them as a
//! format 1 SMF: track 0 holds the tempo, track 1 the melody.
//! Four steps make a quarter note.

use crate::error::{Error, Result, SinkError};
use crate::note::NoteEvent;
use crate::segment::Segment;
use crate::sink::{NoteSink, ScheduledNote};
use crate::timing::StepTime;
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind};
use std::path::{Path, PathBuf};

/// MIDI ticks per quarter note.
pub const TICKS_PER_QUARTER: u16 = 480;
/// Steps per quarter note.
pub const STEPS_PER_QUARTER: i64 = 4;

const CHANNEL: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RecordedNote {
    start: StepTime,
    length: StepTime,
    key: u8,
    velocity: u8,
}

/// Records notes and writes them to a `.mid` file.
#[derive(Debug)]
pub struct MidiRecorder {
    path: Option<PathBuf>,
    steps_per_second: f64,
    notes: Vec<RecordedNote>,
    /// Added to incoming positions so a restarted timeline continues after
    /// what is already recorded.
    offset: StepTime,
    last_position: Option<StepTime>,
    end: StepTime,
}

impl MidiRecorder {
    /// Recorder that only keeps notes in memory.
    pub fn new(steps_per_second: f64) -> Self {
        Self {
            path: None,
            steps_per_second,
            notes: Vec::new(),
            offset: StepTime::ZERO,
            last_position: None,
            end: StepTime::ZERO,
        }
    }

    /// Recorder that writes to `path` when finished.
    pub fn with_path(path: impl Into<PathBuf>, steps_per_second: f64) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(steps_per_second)
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of sounding notes recorded.
    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Record a note at a position on the playback timeline. Rests only
    /// move the end marker.
    pub fn record(&mut self, position: StepTime, note: &NoteEvent) {
        if self.last_position.is_some_and(|last| position <= last) {
            self.offset = self.end;
        }
        self.last_position = Some(position);

        let start = position + self.offset;
        let stop = start + note.duration;
        if stop > self.end {
            self.end = stop;
        }

        if let Some(key) = note.pitch.midi() {
            self.notes.push(RecordedNote {
                start,
                length: note.duration,
                key,
                velocity: note.velocity.clamp(1, 127),
            });
        }
    }

    /// Record a whole segment starting at `origin`.
    pub fn record_segment(&mut self, origin: StepTime, segment: &Segment) {
        for (onset, note) in segment.onsets() {
            self.record(origin + onset, note);
        }
    }

    /// Build the SMF in memory.
    pub fn to_smf(&self) -> Smf<'static> {
        let mut smf = Smf::new(Header::new(
            Format::Parallel,
            Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
        ));

        let mut tempo_track: Track<'static> = Vec::new();
        let sps = self.steps_per_second.clamp(0.25, 10_000.0);
        let micros_per_quarter = (STEPS_PER_QUARTER as f64 / sps * 1_000_000.0).round() as u32;
        tempo_track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(micros_per_quarter.min(0xFF_FFFF)))),
        });
        tempo_track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        smf.tracks.push(tempo_track);

        // (tick, is_on, key, velocity); offs sort before ons at the same tick.
        let mut events: Vec<(u32, bool, u8, u8)> = Vec::with_capacity(self.notes.len() * 2);
        for note in &self.notes {
            let on = to_ticks(note.start);
            let off = to_ticks(note.start + note.length).max(on + 1);
            events.push((on, true, note.key, note.velocity));
            events.push((off, false, note.key, 0));
        }
        events.sort_by_key(|&(tick, is_on, key, _)| (tick, is_on, key));

        let mut track: Track<'static> = Vec::new();
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(b"segue")),
        });
        let mut last = 0u32;
        for (tick, is_on, key, velocity) in events {
            let message = if is_on {
                MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(velocity),
                }
            } else {
                MidiMessage::NoteOff {
                    key: u7::new(key),
                    vel: u7::new(0),
                }
            };
            track.push(TrackEvent {
                delta: u28::new(tick - last),
                kind: TrackEventKind::Midi {
                    channel: u4::new(CHANNEL),
                    message,
                },
            });
            last = tick;
        }
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        smf.tracks.push(track);
        smf
    }

    /// Encode the recording as SMF bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.to_smf()
            .write(&mut buf)
            .map_err(|e| Error::Midi(e.to_string()))?;
        Ok(buf)
    }

    /// Write the recording to `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        log::info!("[RECORDER] Wrote {} notes to {}", self.notes.len(), path.display());
        Ok(())
    }
}

fn to_ticks(steps: StepTime) -> u32 {
    let per_step = TICKS_PER_QUARTER as i64 / STEPS_PER_QUARTER;
    let ticks = (steps.ticks() * per_step + StepTime::TICKS_PER_STEP / 2) / StepTime::TICKS_PER_STEP;
    ticks.clamp(0, 0x0FFF_FFFF) as u32
}

impl NoteSink for MidiRecorder {
    fn play(&mut self, note: &ScheduledNote) -> std::result::Result<(), SinkError> {
        self.record(note.position, &note.note);
        Ok(())
    }

    fn finish(&mut self) -> std::result::Result<(), SinkError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.write_to(&path).map_err(|e| match e {
            Error::Io(io) => SinkError::Io(io),
            other => SinkError::Send(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentId;

    fn midi_events(smf: &Smf) -> Vec<(u32, MidiMessage)> {
        let mut tick = 0;
        smf.tracks[1]
            .iter()
            .filter_map(|ev| {
                tick += ev.delta.as_int();
                match ev.kind {
                    TrackEventKind::Midi { message, .. } => Some((tick, message)),
                    _ => None,
                }
            })
            .collect()
    }

    #[test]
    fn test_steps_convert_to_ticks() {
        assert_eq!(to_ticks(StepTime::from_steps(1)), 120);
        assert_eq!(to_ticks(StepTime::from_steps(4)), 480);
        assert_eq!(to_ticks(StepTime::from_ratio(1, 3)), 40);
    }

    #[test]
    fn test_notes_and_rests_are_placed_on_the_timeline() {
        let mut rec = MidiRecorder::new(8.0);
        rec.record(StepTime::ZERO, &NoteEvent::note(60, StepTime::from_steps(2), 90));
        rec.record(StepTime::from_steps(2), &NoteEvent::rest(StepTime::from_steps(1)));
        rec.record(StepTime::from_steps(3), &NoteEvent::note(64, StepTime::from_steps(1), 100));
        assert_eq!(rec.len(), 2);

        let smf = rec.to_smf();
        assert_eq!(smf.tracks.len(), 2);
        let events = midi_events(&smf);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], (0, MidiMessage::NoteOn { key: u7::new(60), vel: u7::new(90) }));
        assert_eq!(events[1], (240, MidiMessage::NoteOff { key: u7::new(60), vel: u7::new(0) }));
        assert_eq!(events[2], (360, MidiMessage::NoteOn { key: u7::new(64), vel: u7::new(100) }));
        assert_eq!(events[3].0, 480);
    }

    #[test]
    fn test_tempo_follows_steps_per_second() {
        let smf = MidiRecorder::new(8.0).to_smf();
        // 8 steps/s = 2 quarters/s = 500000 us per quarter
        assert!(matches!(
            smf.tracks[0][0].kind,
            TrackEventKind::Meta(MetaMessage::Tempo(t)) if t.as_int() == 500_000
        ));
    }

    #[test]
    fn test_restarted_timeline_appends() {
        let mut rec = MidiRecorder::new(8.0);
        rec.record(StepTime::ZERO, &NoteEvent::note(60, StepTime::from_steps(4), 100));
        rec.record(StepTime::ZERO, &NoteEvent::note(62, StepTime::from_steps(4), 100));
        let events = midi_events(&rec.to_smf());
        assert_eq!(events[2].0, 480);
    }

    #[test]
    fn test_segment_and_file_output() {
        let seg = Segment::new(
            SegmentId(1),
            vec![
                NoteEvent::note(60, StepTime::from_steps(2), 100),
                NoteEvent::note(67, StepTime::from_steps(2), 100),
            ],
            4,
            Vec::new(),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("take.mid");
        let mut rec = MidiRecorder::with_path(&path, 8.0);
        rec.record_segment(StepTime::ZERO, &seg);
        rec.record_segment(seg.len_steps(), &seg);
        rec.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.header.format, Format::Parallel);
        assert_eq!(midi_events(&smf).len(), 8);
    }
}
