//! Events reported by the pipeline threads.
//!
//! The buffer, the worker pool and the scheduler push [`PipelineEvent`]s onto
//! one crossbeam channel; the transport drains it to build its status and the
//! console shows them in its event log.

use crate::error::OracleError;
use crate::segment::{GenerationSettings, SegmentId};
use crate::timing::StepTime;
use crossbeam_channel::Sender;
use std::time::Duration;

/// Playback state machine states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Playing,
    Paused,
    /// Waiting for a late segment.
    Draining,
    Stopped,
}

impl PlaybackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Paused => "paused",
            PlaybackStatus::Draining => "draining",
            PlaybackStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    /// A generation request was handed to the pool.
    Requested {
        slot: usize,
        segment: SegmentId,
        attempt: u32,
        primer_len: usize,
    },
    /// A segment became ready for playback.
    Ready {
        slot: usize,
        segment: SegmentId,
        attempt: u32,
        elapsed: Duration,
    },
    /// An attempt failed and will be retried after `retry_in`.
    AttemptFailed {
        slot: usize,
        segment: SegmentId,
        attempt: u32,
        error: OracleError,
        settings: GenerationSettings,
        retry_in: Duration,
    },
    /// A slot ran out of attempts and was parked.
    PersistentFailure {
        slot: usize,
        segment: SegmentId,
        attempts: u32,
        error: OracleError,
        settings: GenerationSettings,
    },
    /// Generation succeeded again after a persistent failure.
    Recovered { rearmed: usize },
    /// A result arrived for a request that no longer matters.
    StaleDiscarded { slot: usize, segment: SegmentId },
    /// Playback of a segment began at a global step position.
    SegmentStarted { segment: SegmentId, at: StepTime },
    /// Nothing was ready when the current segment ended.
    BufferUnderrun { after: SegmentId, count: u64 },
    /// A late segment arrived and playback continued.
    UnderrunRecovered { segment: SegmentId, waited: Duration },
    /// A sink rejected a note. Playback carried on.
    SinkFailed { message: String },
    /// The scheduler changed state.
    StateChanged(PlaybackStatus),
}

impl PipelineEvent {
    /// One-line description for logs and the console.
    pub fn describe(&self) -> String {
        match self {
            PipelineEvent::Requested {
                slot,
                segment,
                attempt,
                primer_len,
            } => format!("requested {segment} (slot {slot}, attempt {attempt}, primer {primer_len} notes)"),
            PipelineEvent::Ready {
                slot,
                segment,
                elapsed,
                ..
            } => format!(
                "{segment} ready in slot {slot} after {}",
                humantime::format_duration(round_ms(*elapsed))
            ),
            PipelineEvent::AttemptFailed {
                segment,
                attempt,
                error,
                retry_in,
                ..
            } => format!(
                "{segment} attempt {attempt} failed: {error}; retry in {}",
                humantime::format_duration(round_ms(*retry_in))
            ),
            PipelineEvent::PersistentFailure {
                slot,
                segment,
                attempts,
                error,
                ..
            } => format!("{segment} gave up after {attempts} attempts (slot {slot} parked): {error}"),
            PipelineEvent::Recovered { rearmed } => format!("generation recovered, {rearmed} slot(s) re-armed"),
            PipelineEvent::StaleDiscarded { segment, .. } => format!("discarded stale result for {segment}"),
            PipelineEvent::SegmentStarted { segment, at } => format!("playing {segment} from step {at}"),
            PipelineEvent::BufferUnderrun { after, count } => format!("buffer underrun after {after} (total {count})"),
            PipelineEvent::UnderrunRecovered { segment, waited } => format!(
                "{segment} arrived {} late",
                humantime::format_duration(round_ms(*waited))
            ),
            PipelineEvent::SinkFailed { message } => format!("sink error: {message}"),
            PipelineEvent::StateChanged(state) => format!("state: {state}"),
        }
    }
}

fn round_ms(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Best-effort event publisher. A disconnected receiver is ignored.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<Sender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A publisher that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_is_readable() {
        let event = PipelineEvent::AttemptFailed {
            slot: 1,
            segment: SegmentId(4),
            attempt: 2,
            error: OracleError::Unavailable("busy".into()),
            settings: GenerationSettings {
                bundle: "b".into(),
                step_count: 16,
                temperature: 1.0,
            },
            retry_in: Duration::from_micros(500_400),
        };
        assert_eq!(
            event.describe(),
            "#4 attempt 2 failed: oracle unavailable: busy; retry in 500ms"
        );
        assert_eq!(PipelineEvent::StateChanged(PlaybackStatus::Draining).describe(), "state: draining");
    }

    #[test]
    fn test_disabled_sink_drops_events() {
        EventSink::disabled().emit(PipelineEvent::Recovered { rearmed: 0 });
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        EventSink::new(tx).emit(PipelineEvent::Recovered { rearmed: 0 });
    }
}
