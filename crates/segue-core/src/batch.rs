//! One-shot batch generation.
//!
//! Generates a fixed number of segments back to back, each primed by the
//! previous one, without any playback. Uses the same retry policy and
//! timeout as the live pipeline.

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::oracle::OracleAdapter;
use crate::pool::call_with_timeout;
use crate::primer;
use crate::recorder::MidiRecorder;
use crate::segment::{GenerationRequest, Segment, SegmentId};
use crate::timing::StepTime;
use std::path::Path;

/// Generate `count` chained segments.
///
/// Fails with [`Error::PersistentGenerationFailure`] if one segment cannot be
/// generated within the retry limit.
pub fn generate_batch(adapter: &OracleAdapter, config: &PipelineConfig, count: usize) -> Result<Vec<Segment>> {
    config.validate()?;
    let mut rng = rand::rng();
    let mut segments: Vec<Segment> = Vec::with_capacity(count);

    for n in 0..count {
        let id = SegmentId(n as u64 + 1);
        let primer = primer::extract(
            segments.last(),
            config.buffer.primer_window,
            &config.buffer.initial_primer,
        );

        let mut attempt = 1;
        let segment = loop {
            let request = GenerationRequest {
                segment: id,
                slot: 0,
                attempt,
                primer: primer.clone(),
                settings: config.generation_settings(),
            };
            match call_with_timeout(adapter, &request, config.oracle.timeout) {
                Ok(segment) => break segment,
                Err(last) if attempt >= config.retry.limit => {
                    return Err(Error::PersistentGenerationFailure {
                        slot: 0,
                        segment: id,
                        attempts: attempt,
                        last,
                    });
                }
                Err(e) => {
                    attempt += 1;
                    let delay = config.retry.backoff_with_jitter(attempt, &mut rng);
                    log::warn!("[BATCH] {} failed: {}; retrying in {}", id, e, humantime::format_duration(delay));
                    std::thread::sleep(delay);
                }
            }
        };

        log::info!("[BATCH] Generated {} ({} notes)", id, segment.notes().len());
        segments.push(segment);
    }
    Ok(segments)
}

/// Write segments back to back into a MIDI file.
pub fn write_midi(segments: &[Segment], steps_per_second: f64, path: &Path) -> Result<()> {
    let mut recorder = MidiRecorder::new(steps_per_second);
    let mut origin = StepTime::ZERO;
    for segment in segments {
        recorder.record_segment(origin, segment);
        origin += segment.len_steps();
    }
    recorder.write_to(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::OracleError;
    use crate::note::NoteEvent;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.model.step_count = 4;
        config.buffer.primer_window = 2;
        config.playback.history_len = 2;
        config.retry = RetryPolicy {
            limit: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        config
    }

    #[test]
    fn test_batch_chains_primers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let oracle = move |req: &GenerationRequest| -> std::result::Result<Vec<NoteEvent>, OracleError> {
            log.lock().unwrap().push(req.primer.clone());
            let base = 60 + 2 * req.segment.0 as u8;
            Ok((0..4)
                .map(|i| NoteEvent::note(base + i, StepTime::from_steps(1), 100))
                .collect())
        };
        let adapter = OracleAdapter::new(Arc::new(oracle));
        let segments = generate_batch(&adapter, &fast_config(), 3).unwrap();
        assert_eq!(segments.len(), 3);

        let primers = seen.lock().unwrap();
        assert!(primers[0].is_empty());
        assert_eq!(primers[1], primer::extract(Some(&segments[0]), 2, &[]));
        assert_eq!(primers[2], primer::extract(Some(&segments[1]), 2, &[]));
    }

    #[test]
    fn test_batch_retries_then_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let oracle = move |_: &GenerationRequest| -> std::result::Result<Vec<NoteEvent>, OracleError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::InvalidOutput("garbage".into()))
        };
        let adapter = OracleAdapter::new(Arc::new(oracle));
        let err = generate_batch(&adapter, &fast_config(), 2).unwrap_err();
        assert!(matches!(
            err,
            Error::PersistentGenerationFailure { attempts: 3, segment: SegmentId(1), .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_write_midi() {
        let seg = Segment::new(
            SegmentId(1),
            vec![NoteEvent::note(60, StepTime::from_steps(4), 100)],
            4,
            Vec::new(),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.mid");
        write_midi(&[seg.clone(), seg], 8.0, &path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
