//! End-to-end pipeline scenarios: buffer, worker pool, playback thread and
//! transport wired together with scripted oracles.

use crossbeam_channel::{unbounded, Receiver};
use segue_core::{
    primer, BufferConfig, ChannelSink, EventSink, GenerationRequest, LookaheadBuffer, NoteEvent, OracleError,
    PipelineConfig, PipelineEvent, PlaybackStatus, RetryPolicy, ScheduledNote, Segment, SegmentId,
    SinkMessage, StepTime, TransportCommand, TransportController, TransportStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type OracleResult = Result<Vec<NoteEvent>, OracleError>;

fn config(step_count: u32, steps_per_second: f64) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.model.step_count = step_count;
    config.buffer.lookahead_depth = 2;
    config.buffer.workers = 2;
    config.buffer.primer_window = 4;
    config.playback.steps_per_second = steps_per_second;
    config.playback.prefetch = Duration::from_millis(20);
    config.playback.history_len = 4;
    config.oracle.timeout = Duration::from_secs(5);
    config.retry = RetryPolicy {
        limit: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
        ..RetryPolicy::default()
    };
    config
}

/// One-step notes, pitch = base + index.
fn melody(base: u8, len: u32) -> Vec<NoteEvent> {
    (0..len)
        .map(|i| NoteEvent::note(base + i as u8, StepTime::from_steps(1), 100))
        .collect()
}

fn transport(
    config: PipelineConfig,
    oracle: impl Fn(&GenerationRequest) -> OracleResult + Send + Sync + 'static,
) -> (TransportController, Receiver<SinkMessage>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (tx, rx) = unbounded();
    let controller = TransportController::new(config, Arc::new(oracle), Box::new(ChannelSink::new(tx))).unwrap();
    (controller, rx)
}

fn next_note(rx: &Receiver<SinkMessage>) -> ScheduledNote {
    loop {
        match rx.recv_timeout(Duration::from_secs(3)).expect("no note within 3s") {
            SinkMessage::Note(note) => return note,
            SinkMessage::Silence => continue,
        }
    }
}

fn wait_for(controller: &TransportController, what: &str, cond: impl Fn(&TransportStatus) -> bool) -> TransportStatus {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let status = controller.status();
        if cond(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}: {status:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_refill_after_take_is_primed_from_taken_segment() {
    let (jobs_tx, jobs) = unbounded();
    let buffer = LookaheadBuffer::new(
        BufferConfig::from_pipeline(&config(16, 8.0)),
        jobs_tx,
        EventSink::disabled(),
    );
    buffer.start().unwrap();

    let first = jobs.try_recv().unwrap();
    let second = jobs.try_recv().unwrap();
    assert!(first.request.primer.is_empty());
    assert!(second.request.primer.is_empty());
    assert_eq!(first.request.settings.step_count, 16);

    let segment1 = Segment::new(first.request.segment, melody(60, 16), 16, Vec::new());
    buffer.complete(&first, Ok(segment1.clone()));

    let taken = buffer.try_take_next().unwrap();
    assert_eq!(taken.id(), segment1.id());

    let refill = jobs.try_recv().unwrap();
    assert_eq!(refill.request.slot, first.request.slot);
    assert_eq!(refill.request.primer, primer::extract(Some(&segment1), 4, &[]));
    assert_eq!(refill.request.primer, melody(60, 16)[12..].to_vec());

    // The second slot still delivers next even though the refill exists.
    let segment2 = Segment::new(second.request.segment, melody(70, 16), 16, Vec::new());
    buffer.complete(&second, Ok(segment2));
    assert_eq!(buffer.try_take_next().unwrap().id(), second.request.segment);
}

#[test]
fn test_two_segments_play_without_gap() {
    let oracle = |req: &GenerationRequest| -> OracleResult { Ok(melody(40 + req.segment.0 as u8, 16)) };
    let (mut controller, notes) = transport(config(16, 400.0), oracle);
    controller.dispatch(TransportCommand::Start).unwrap();

    let played: Vec<ScheduledNote> = (0..32).map(|_| next_note(&notes)).collect();
    for (i, note) in played.iter().enumerate() {
        assert_eq!(note.position, StepTime::from_steps(i as u32));
        assert_eq!(note.segment, SegmentId(1 + i as u64 / 16));
        assert_eq!(note.index, i % 16);
    }
    controller.shutdown();
}

#[test]
fn test_persistent_failure_marks_degraded_and_keeps_playing() {
    let oracle = |req: &GenerationRequest| -> OracleResult {
        if req.segment == SegmentId(1) {
            Ok(melody(60, 4))
        } else {
            Err(OracleError::Unavailable("model crashed".into()))
        }
    };
    let (mut controller, notes) = transport(config(4, 200.0), oracle);
    controller.dispatch(TransportCommand::Start).unwrap();

    let played: Vec<ScheduledNote> = (0..4).map(|_| next_note(&notes)).collect();
    assert!(played.iter().all(|n| n.segment == SegmentId(1)));
    assert_eq!(played.iter().map(|n| n.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

    // Both slots give up: #2 and the refill after #1 was taken.
    let status = wait_for(&controller, "degraded", |s| s.degraded && s.parked == 2);
    assert!(status.last_error.is_some());

    let events = controller.recent_events(200);
    let failure = events
        .iter()
        .find_map(|e| match e {
            PipelineEvent::PersistentFailure {
                segment: SegmentId(2),
                attempts,
                error,
                ..
            } => Some((*attempts, error.clone())),
            _ => None,
        })
        .expect("persistent failure event");
    assert_eq!(failure.0, 3);
    assert!(failure.1.to_string().contains("model crashed"));

    let attempts = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::AttemptFailed { segment: SegmentId(2), .. }))
        .count();
    assert_eq!(attempts, 2);
    controller.shutdown();
}

#[test]
fn test_regenerate_drops_remaining_notes_and_primes_from_history() {
    let primers: Arc<Mutex<HashMap<u64, Vec<NoteEvent>>>> = Arc::default();
    let seen = primers.clone();
    let oracle = move |req: &GenerationRequest| -> OracleResult {
        seen.lock().unwrap().insert(req.segment.0, req.primer.clone());
        if req.segment == SegmentId(2) {
            // Still in flight when Regenerate arrives.
            thread::sleep(Duration::from_millis(300));
        }
        Ok(melody(40 + 2 * req.segment.0 as u8, 16))
    };
    let (mut controller, notes) = transport(config(16, 50.0), oracle);
    controller.dispatch(TransportCommand::Start).unwrap();

    let mut old = vec![next_note(&notes), next_note(&notes), next_note(&notes)];
    controller.dispatch(TransportCommand::Regenerate).unwrap();

    let fresh = loop {
        let note = next_note(&notes);
        if note.segment != SegmentId(1) {
            break note;
        }
        old.push(note);
    };

    assert!(old.len() < 16, "current segment should not finish");
    for (i, note) in old.iter().enumerate() {
        assert_eq!(note.index, i);
    }
    assert!(fresh.segment.0 >= 3, "stale segment {} played", fresh.segment);
    assert_eq!(fresh.index, 0);
    assert!(fresh.position >= old.last().unwrap().position);

    let played: Vec<NoteEvent> = old.iter().map(|n| n.note).collect();
    let primers = primers.lock().unwrap();
    assert_eq!(primers[&fresh.segment.0], primer::tail(&played, 4));

    // The slow result for #2 arrives after the cut and must never sound.
    thread::sleep(Duration::from_millis(350));
    for msg in notes.try_iter() {
        if let SinkMessage::Note(note) = msg {
            assert_ne!(note.segment, SegmentId(2));
        }
    }
    controller.shutdown();
}

#[test]
fn test_pause_resume_neither_skips_nor_repeats() {
    let oracle = |req: &GenerationRequest| -> OracleResult { Ok(melody(40 + req.segment.0 as u8, 4)) };
    let (mut controller, notes) = transport(config(4, 100.0), oracle);
    controller.dispatch(TransportCommand::Start).unwrap();

    let mut played = vec![next_note(&notes), next_note(&notes), next_note(&notes)];
    controller.dispatch(TransportCommand::Pause).unwrap();
    wait_for(&controller, "pause", |s| s.state == PlaybackStatus::Paused);
    for msg in notes.try_iter() {
        if let SinkMessage::Note(note) = msg {
            played.push(note);
        }
    }

    let frozen = controller.status().position;
    thread::sleep(Duration::from_millis(100));
    assert!(notes.try_iter().all(|m| !matches!(m, SinkMessage::Note(_))));
    assert_eq!(controller.status().position, frozen);

    controller.dispatch(TransportCommand::Resume).unwrap();
    while played.len() < 12 {
        played.push(next_note(&notes));
    }

    for (i, note) in played.iter().enumerate() {
        assert_eq!(note.position, StepTime::from_steps(i as u32));
        assert_eq!(note.segment, SegmentId(1 + i as u64 / 4));
        assert_eq!(note.index, i % 4);
    }
    controller.shutdown();
}

#[test]
fn test_out_of_order_generation_plays_in_order() {
    // Odd segments take longer, so even ones finish first.
    let oracle = |req: &GenerationRequest| -> OracleResult {
        if req.segment.0 % 2 == 1 {
            thread::sleep(Duration::from_millis(15));
        }
        Ok(melody(40 + req.segment.0 as u8, 2))
    };
    let mut cfg = config(2, 200.0);
    cfg.buffer.lookahead_depth = 3;
    cfg.buffer.workers = 3;
    let (mut controller, notes) = transport(cfg, oracle);
    controller.dispatch(TransportCommand::Start).unwrap();

    let played: Vec<ScheduledNote> = (0..20).map(|_| next_note(&notes)).collect();
    assert_eq!(played[0].segment, SegmentId(1));
    for pair in played.windows(2) {
        assert!(pair[1].segment >= pair[0].segment);
        if pair[1].segment == pair[0].segment {
            assert_eq!(pair[1].index, pair[0].index + 1);
        } else {
            assert_eq!(pair[1].segment.0, pair[0].segment.0 + 1);
            assert_eq!(pair[1].index, 0);
        }
    }
    controller.shutdown();
}

#[test]
fn test_set_config_applies_temperature_to_next_request() {
    let temperatures: Arc<Mutex<Vec<f64>>> = Arc::default();
    let seen = temperatures.clone();
    let oracle = move |req: &GenerationRequest| -> OracleResult {
        seen.lock().unwrap().push(req.settings.temperature);
        Ok(melody(60, 2))
    };
    let cfg = config(2, 100.0);
    let (mut controller, notes) = transport(cfg.clone(), oracle);
    controller.dispatch(TransportCommand::Start).unwrap();
    next_note(&notes);

    let mut hotter = cfg;
    hotter.model.temperature = 1.5;
    controller
        .dispatch(TransportCommand::SetConfig(Box::new(hotter)))
        .unwrap();
    assert_eq!(controller.status().temperature, 1.5);

    for _ in 0..8 {
        next_note(&notes);
    }
    let temperatures = temperatures.lock().unwrap();
    assert_eq!(temperatures[0], 1.0);
    assert_eq!(*temperatures.last().unwrap(), 1.5);
    controller.shutdown();
}

#[test]
fn test_structural_change_waits_for_stop() {
    let oracle = |_: &GenerationRequest| -> OracleResult { Ok(melody(60, 2)) };
    let cfg = config(2, 100.0);
    let (mut controller, notes) = transport(cfg.clone(), oracle);
    controller.dispatch(TransportCommand::Start).unwrap();
    next_note(&notes);

    let mut deeper = cfg;
    deeper.buffer.lookahead_depth = 4;
    controller
        .dispatch(TransportCommand::SetConfig(Box::new(deeper)))
        .unwrap();
    let status = controller.status();
    assert!(status.restart_pending);
    assert_eq!(status.depth, 2);

    controller.dispatch(TransportCommand::Stop).unwrap();
    let stopped = controller.status();
    assert_eq!(stopped.state, PlaybackStatus::Stopped);
    assert_eq!(stopped.position, StepTime::ZERO);

    controller.dispatch(TransportCommand::Start).unwrap();
    let status = wait_for(&controller, "resized buffer", |s| s.depth == 4);
    assert!(!status.restart_pending);
    controller.shutdown();
}
