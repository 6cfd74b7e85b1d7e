//! Transport controller.
//!
//! The single entry point for a console: it owns the buffer, the worker pool
//! and the playback thread, turns [`TransportCommand`]s into calls on them
//! and folds the [`PipelineEvent`] stream into a [`TransportStatus`].

use crate::buffer::{BufferConfig, GenerationJob, LookaheadBuffer};
use crate::config::{OracleKind, PipelineConfig};
use crate::error::Result;
use crate::events::{EventSink, PipelineEvent, PlaybackStatus};
use crate::oracle::{build_oracle, Oracle, OracleAdapter};
use crate::pool::{GenerationPool, SharedTimeout};
use crate::scheduler::{PlaybackCommand, PlaybackScheduler, SchedulerConfig};
use crate::segment::SegmentId;
use crate::sink::NoteSink;
use crate::status::StatusBoard;
use crate::timing::StepTime;
use crossbeam_channel::{unbounded, Receiver};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Events kept for [`TransportController::recent_events`].
const EVENT_LOG_LEN: usize = 200;

/// How long `Stop` waits for the playback thread to settle.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq)]
pub enum TransportCommand {
    Start,
    Pause,
    Resume,
    Stop,
    Regenerate,
    /// Replace the configuration. Tempo, model, primer, retry and timeout
    /// settings apply immediately; lookahead depth, worker count and oracle
    /// backend wait until the transport is stopped.
    SetConfig(Box<PipelineConfig>),
}

/// Aggregated view for the console.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransportStatus {
    pub state: PlaybackStatus,
    pub ready: usize,
    pub pending: usize,
    pub parked: usize,
    pub depth: usize,
    pub segment: Option<SegmentId>,
    /// Global timeline step.
    pub position: StepTime,
    /// Step offset into `segment`.
    pub segment_offset: StepTime,
    pub steps_per_second: f64,
    pub temperature: f64,
    pub underruns: u64,
    pub notes_played: u64,
    pub sink_errors: u64,
    pub degraded: bool,
    pub last_error: Option<String>,
    /// A configuration change is waiting for the next Start.
    pub restart_pending: bool,
}

/// Parts of the configuration that need a stopped pipeline to change.
#[derive(Clone, Debug, PartialEq)]
struct Structure {
    depth: usize,
    workers: usize,
    backend: OracleKind,
}

impl Structure {
    fn of(config: &PipelineConfig) -> Self {
        Self {
            depth: config.buffer.lookahead_depth,
            workers: config.buffer.workers,
            backend: config.oracle.backend.clone(),
        }
    }
}

#[derive(Default)]
struct EventLog {
    recent: VecDeque<PipelineEvent>,
    last_error: Option<String>,
}

pub struct TransportController {
    config: PipelineConfig,
    applied: Structure,
    buffer: Arc<LookaheadBuffer>,
    jobs: Receiver<GenerationJob>,
    adapter: OracleAdapter,
    /// The oracle was passed in rather than built from the configuration.
    custom_oracle: bool,
    timeout: SharedTimeout,
    pool: Option<GenerationPool>,
    scheduler: PlaybackScheduler,
    events: Receiver<PipelineEvent>,
    log: Mutex<EventLog>,
}

impl TransportController {
    /// Build a stopped pipeline using the oracle named in the configuration.
    pub fn from_config(config: PipelineConfig, sink: Box<dyn NoteSink>) -> Result<Self> {
        let oracle = build_oracle(&config.oracle.backend);
        Self::build(config, oracle, false, sink)
    }

    /// Build a stopped pipeline around a given oracle.
    pub fn new(config: PipelineConfig, oracle: Arc<dyn Oracle>, sink: Box<dyn NoteSink>) -> Result<Self> {
        Self::build(config, oracle, true, sink)
    }

    fn build(config: PipelineConfig, oracle: Arc<dyn Oracle>, custom_oracle: bool, sink: Box<dyn NoteSink>) -> Result<Self> {
        config.validate()?;
        let (events_tx, events) = unbounded();
        let (jobs_tx, jobs) = unbounded();
        let buffer = Arc::new(LookaheadBuffer::new(
            BufferConfig::from_pipeline(&config),
            jobs_tx,
            EventSink::new(events_tx.clone()),
        ));
        let scheduler = PlaybackScheduler::spawn(
            buffer.clone(),
            sink,
            Self::scheduler_config(&config),
            EventSink::new(events_tx),
        )?;
        let adapter = OracleAdapter::new(oracle);
        log::info!(
            "[TRANSPORT] Ready: depth {}, {} worker(s), {} steps/segment, oracle '{}'",
            config.buffer.lookahead_depth,
            config.buffer.workers,
            config.model.step_count,
            adapter.name()
        );

        Ok(Self {
            applied: Structure::of(&config),
            timeout: SharedTimeout::new(config.oracle.timeout),
            config,
            buffer,
            jobs,
            adapter,
            custom_oracle,
            pool: None,
            scheduler,
            events,
            log: Mutex::new(EventLog::default()),
        })
    }

    fn scheduler_config(config: &PipelineConfig) -> SchedulerConfig {
        SchedulerConfig {
            steps_per_second: config.playback.steps_per_second,
            prefetch: config.playback.prefetch,
            history_len: config.playback.history_len.max(config.buffer.primer_window),
        }
    }

    /// Execute one command.
    pub fn dispatch(&mut self, command: TransportCommand) -> Result<()> {
        match command {
            TransportCommand::Start => {
                if !self.buffer.is_running() {
                    self.apply_structure()?;
                }
                self.scheduler.send(PlaybackCommand::Start)
            }
            TransportCommand::Pause => self.scheduler.send(PlaybackCommand::Pause),
            TransportCommand::Resume => self.scheduler.send(PlaybackCommand::Resume),
            TransportCommand::Regenerate => self.scheduler.send(PlaybackCommand::Regenerate),
            TransportCommand::Stop => {
                self.scheduler.send(PlaybackCommand::Stop)?;
                self.wait_until_stopped();
                Ok(())
            }
            TransportCommand::SetConfig(config) => self.set_config(*config),
        }
    }

    fn set_config(&mut self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        self.buffer.update_settings(&BufferConfig::from_pipeline(&config));
        self.timeout.set(config.oracle.timeout);
        self.scheduler
            .send(PlaybackCommand::Configure(Self::scheduler_config(&config)))?;
        self.config = config;

        if Structure::of(&self.config) != self.applied {
            if self.buffer.is_running() {
                log::info!("[TRANSPORT] Depth/worker/oracle change takes effect after Stop");
            } else {
                self.apply_structure()?;
            }
        }
        Ok(())
    }

    /// Bring buffer size, pool and oracle in line with the configuration.
    /// Only called while the buffer is stopped.
    fn apply_structure(&mut self) -> Result<()> {
        let wanted = Structure::of(&self.config);
        if wanted.depth != self.applied.depth {
            self.buffer.resize(wanted.depth)?;
            log::info!("[TRANSPORT] Lookahead depth now {}", wanted.depth);
        }

        let oracle_changed = !self.custom_oracle && wanted.backend != self.applied.backend;
        if oracle_changed {
            self.adapter = OracleAdapter::new(build_oracle(&wanted.backend));
        }
        if oracle_changed || wanted.workers != self.applied.workers {
            if let Some(mut pool) = self.pool.take() {
                pool.shutdown();
            }
        }
        if self.pool.is_none() {
            self.pool = Some(GenerationPool::spawn(
                wanted.workers,
                self.buffer.clone(),
                self.jobs.clone(),
                self.adapter.clone(),
                self.timeout.clone(),
            )?);
        }
        self.applied = wanted;
        Ok(())
    }

    fn wait_until_stopped(&self) {
        let deadline = Instant::now() + STOP_TIMEOUT;
        while Instant::now() < deadline {
            if matches!(
                self.scheduler.board().status(),
                PlaybackStatus::Stopped | PlaybackStatus::Idle
            ) {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        log::warn!("[TRANSPORT] Playback did not confirm Stop in time");
    }

    /// Current status, folding in any events that arrived since last call.
    pub fn status(&self) -> TransportStatus {
        let log = self.collect_events();
        let playback = self.scheduler.board().snapshot();
        let buffer = self.buffer.snapshot();
        TransportStatus {
            state: playback.status,
            ready: buffer.ready,
            pending: buffer.pending,
            parked: buffer.parked,
            depth: buffer.depth,
            segment: playback.current_segment,
            position: playback.position,
            segment_offset: playback.segment_offset(),
            steps_per_second: playback.steps_per_second,
            temperature: self.config.model.temperature,
            underruns: playback.underruns,
            notes_played: playback.notes_played,
            sink_errors: playback.sink_errors,
            degraded: buffer.degraded,
            last_error: log.last_error.clone(),
            restart_pending: Structure::of(&self.config) != self.applied,
        }
    }

    /// The most recent events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<PipelineEvent> {
        let log = self.collect_events();
        let skip = log.recent.len().saturating_sub(limit);
        log.recent.iter().skip(skip).cloned().collect()
    }

    fn collect_events(&self) -> std::sync::MutexGuard<'_, EventLog> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        for event in self.events.try_iter() {
            if let Some(text) = error_text(&event) {
                log.last_error = Some(text);
            }
            if log.recent.len() == EVENT_LOG_LEN {
                log.recent.pop_front();
            }
            log.recent.push_back(event);
        }
        log
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn oracle_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn board(&self) -> &StatusBoard {
        self.scheduler.board()
    }

    pub fn buffer(&self) -> &Arc<LookaheadBuffer> {
        &self.buffer
    }

    /// Stop everything and join all threads. The sink is flushed.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
        self.buffer.close();
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
        log::debug!("[TRANSPORT] Shut down");
    }
}

impl Drop for TransportController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn error_text(event: &PipelineEvent) -> Option<String> {
    match event {
        PipelineEvent::AttemptFailed { .. } | PipelineEvent::PersistentFailure { .. } | PipelineEvent::SinkFailed { .. } => {
            Some(event.describe())
        }
        _ => None,
    }
}
