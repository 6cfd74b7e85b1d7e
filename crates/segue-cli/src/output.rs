//! Assembles the note sink from the configuration and flags.

use anyhow::Result;
use segue_core::{FanoutSink, Harmony, HarmonizerSink, LogSink, MidiRecorder, NoteSink, PipelineConfig};

/// Where played notes go besides the recorder.
#[derive(Debug, Default, Clone)]
pub struct OutputOptions {
    /// MIDI port name (substring match)
    pub midi_port: Option<String>,
    /// MIDI channel, 0-based
    pub midi_channel: u8,
    /// Log every note
    pub log_notes: bool,
}

/// Build the sink chain: optional note log, optional MIDI port and the
/// recorder when enabled. With `[harmony]` enabled every output hears the
/// fitted notes.
pub fn build_sink(config: &PipelineConfig, options: &OutputOptions) -> Result<Box<dyn NoteSink>> {
    let mut sinks = FanoutSink::new();

    if options.log_notes {
        sinks.push(LogSink);
    }

    if let Some(port) = &options.midi_port {
        push_midi_port(&mut sinks, port, options.midi_channel)?;
    }

    if config.recorder.enabled {
        log::info!("Recording to {}", config.recorder.path.display());
        sinks.push(MidiRecorder::with_path(
            config.recorder.path.clone(),
            config.playback.steps_per_second,
        ));
    }

    if sinks.is_empty() {
        log::warn!("No output configured; notes are only logged");
        sinks.push(LogSink);
    }

    if config.harmony.enabled {
        let harmony = Harmony::from_settings(&config.harmony)?;
        log::info!("Harmonizing over {} chord(s) in key {}", harmony.len(), config.harmony.key);
        return Ok(Box::new(HarmonizerSink::new(sinks, harmony)));
    }
    Ok(Box::new(sinks))
}

#[cfg(feature = "midi")]
fn push_midi_port(sinks: &mut FanoutSink, port: &str, channel: u8) -> Result<()> {
    let sink = crate::midi_out::MidiPortSink::connect(port, channel)?;
    log::debug!("MIDI output ready on '{}'", sink.port_name());
    sinks.push(sink);
    Ok(())
}

#[cfg(not(feature = "midi"))]
fn push_midi_port(_sinks: &mut FanoutSink, port: &str, _channel: u8) -> Result<()> {
    anyhow::bail!("Cannot open MIDI port '{}': segue was built without the `midi` feature", port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_is_added_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.recorder.enabled = true;
        config.recorder.path = dir.path().join("take.mid");

        let mut sink = build_sink(&config, &OutputOptions::default()).unwrap();
        sink.finish().unwrap();
        assert!(config.recorder.path.exists());
    }

    #[test]
    fn test_recording_hears_harmonized_notes() {
        use segue_core::{NoteEvent, ScheduledNote, SegmentId, StepTime};
        use std::time::{Duration, Instant};

        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.recorder.enabled = true;
        config.recorder.path = dir.path().join("fitted.mid");
        config.harmony.enabled = true;

        let mut sink = build_sink(&config, &OutputOptions::default()).unwrap();
        sink.play(&ScheduledNote {
            note: NoteEvent::note(61, StepTime::from_steps(1), 100),
            segment: SegmentId(1),
            index: 0,
            position: StepTime::ZERO,
            at: Instant::now(),
            length: Duration::from_millis(125),
        })
        .unwrap();
        sink.finish().unwrap();

        let bytes = std::fs::read(&config.recorder.path).unwrap();
        let smf = midly::Smf::parse(&bytes).unwrap();
        let keys: Vec<u8> = smf
            .tracks
            .iter()
            .flatten()
            .filter_map(|event| match event.kind {
                midly::TrackEventKind::Midi {
                    message: midly::MidiMessage::NoteOn { key, .. },
                    ..
                } => Some(key.as_int()),
                _ => None,
            })
            .collect();
        // C# sits outside C major, so it moves onto D below middle C.
        assert_eq!(keys, vec![50]);
    }

    #[test]
    fn test_bad_key_is_reported() {
        let mut config = PipelineConfig::default();
        config.harmony.enabled = true;
        config.harmony.key = "Q".to_string();
        assert!(build_sink(&config, &OutputOptions::default()).is_err());
    }

    #[test]
    fn test_falls_back_to_log_sink() {
        let config = PipelineConfig::default();
        let mut sink = build_sink(&config, &OutputOptions::default()).unwrap();
        sink.finish().unwrap();
    }
}
