//! Note sinks - where played notes go.
//!
//! The scheduler hands every event (rests included) to a [`NoteSink`] at the
//! moment it becomes current. Sink errors are logged and counted by the
//! scheduler but never interrupt playback.

use crate::error::SinkError;
use crate::note::{note_name, NoteEvent};
use crate::segment::SegmentId;
use crate::timing::StepTime;
use crossbeam_channel::Sender;
use std::time::{Duration, Instant};

/// A note at its place in the performance.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledNote {
    pub note: NoteEvent,
    pub segment: SegmentId,
    /// Index of the note within its segment.
    pub index: usize,
    /// Onset on the global step timeline.
    pub position: StepTime,
    /// Wall-clock onset.
    pub at: Instant,
    /// Wall-clock length at the tempo in effect.
    pub length: Duration,
}

/// Destination for played notes.
pub trait NoteSink: Send {
    /// Sound (or record) one note.
    fn play(&mut self, note: &ScheduledNote) -> Result<(), SinkError>;

    /// Cut every sounding note. Called on pause, stop, regenerate and shutdown.
    fn silence(&mut self) {}

    /// Flush any pending output. Called once when playback shuts down.
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl NoteSink for Box<dyn NoteSink> {
    fn play(&mut self, note: &ScheduledNote) -> Result<(), SinkError> {
        (**self).play(note)
    }

    fn silence(&mut self) {
        (**self).silence()
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        (**self).finish()
    }
}

/// Logs each note at info level.
#[derive(Debug, Default)]
pub struct LogSink;

impl NoteSink for LogSink {
    fn play(&mut self, note: &ScheduledNote) -> Result<(), SinkError> {
        if note.note.pitch.is_rest() {
            log::debug!("[PLAYBACK] {}[{}] rest {:?}", note.segment, note.index, note.length);
        } else {
            log::info!(
                "[PLAYBACK] {}[{}] {} vel {} for {:?}",
                note.segment,
                note.index,
                note_name(note.note.pitch),
                note.note.velocity,
                note.length
            );
        }
        Ok(())
    }
}

/// What a [`ChannelSink`] forwards.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkMessage {
    Note(ScheduledNote),
    Silence,
}

/// Forwards notes over a channel, for consoles and tests.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<SinkMessage>,
}

impl ChannelSink {
    pub fn new(tx: Sender<SinkMessage>) -> Self {
        Self { tx }
    }
}

impl NoteSink for ChannelSink {
    fn play(&mut self, note: &ScheduledNote) -> Result<(), SinkError> {
        self.tx
            .send(SinkMessage::Note(note.clone()))
            .map_err(|_| SinkError::Send("channel receiver dropped".to_string()))
    }

    fn silence(&mut self) {
        let _ = self.tx.send(SinkMessage::Silence);
    }
}

/// Plays every note on several sinks.
///
/// All sinks are tried even if one fails; the first error is returned.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn NoteSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl NoteSink + 'static) -> Self {
        self.push(sink);
        self
    }

    pub fn push(&mut self, sink: impl NoteSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NoteSink for FanoutSink {
    fn play(&mut self, note: &ScheduledNote) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.play(note) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn silence(&mut self) {
        for sink in &mut self.sinks {
            sink.silence();
        }
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.finish() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn scheduled(pitch: u8) -> ScheduledNote {
        ScheduledNote {
            note: NoteEvent::note(pitch, StepTime::from_steps(1), 100),
            segment: SegmentId(1),
            index: 0,
            position: StepTime::ZERO,
            at: Instant::now(),
            length: Duration::from_millis(125),
        }
    }

    struct Failing;

    impl NoteSink for Failing {
        fn play(&mut self, _: &ScheduledNote) -> Result<(), SinkError> {
            Err(SinkError::Send("port closed".into()))
        }
    }

    #[test]
    fn test_channel_sink_forwards_notes_and_silence() {
        let (tx, rx) = unbounded();
        let mut sink = ChannelSink::new(tx);
        let note = scheduled(60);
        sink.play(&note).unwrap();
        sink.silence();
        assert_eq!(rx.recv().unwrap(), SinkMessage::Note(note));
        assert_eq!(rx.recv().unwrap(), SinkMessage::Silence);
    }

    #[test]
    fn test_channel_sink_reports_dropped_receiver() {
        let (tx, rx) = unbounded();
        drop(rx);
        assert!(ChannelSink::new(tx).play(&scheduled(60)).is_err());
    }

    #[test]
    fn test_fanout_keeps_going_after_failure() {
        let (tx, rx) = unbounded();
        let mut sink = FanoutSink::new().with(Failing).with(ChannelSink::new(tx));
        assert_eq!(sink.len(), 2);
        assert!(matches!(sink.play(&scheduled(64)), Err(SinkError::Send(_))));
        assert!(matches!(rx.try_recv(), Ok(SinkMessage::Note(n)) if n.note.pitch.midi() == Some(64)));
    }

    #[test]
    fn test_log_sink_never_fails() {
        let mut sink = LogSink;
        assert!(sink.play(&scheduled(60)).is_ok());
        assert!(sink.play(&ScheduledNote {
            note: NoteEvent::rest(StepTime::from_steps(2)),
            ..scheduled(0)
        })
        .is_ok());
    }
}
