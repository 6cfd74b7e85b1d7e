//! Lookahead buffer.
//!
//! A fixed table of D slots, each cycling Empty → Pending → Ready → consumed.
//! Every request gets a ticket from a counter that never resets; the ticket
//! becomes the segment id, and [`LookaheadBuffer::take_next`] always hands
//! out the lowest outstanding ticket. Playback order therefore equals request
//! order no matter which worker finishes first.
//!
//! Cancellation is by epoch: Start, Stop and Regenerate bump the epoch, and a
//! result is accepted only if its epoch, ticket and attempt still match the
//! slot it was issued for.
//!
//! All slot transitions happen under one mutex. Jobs leave through a
//! crossbeam channel to the worker pool and results come back through
//! [`LookaheadBuffer::complete`].

use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::{Error, OracleError, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::note::NoteEvent;
use crate::primer;
use crate::segment::{GenerationRequest, GenerationSettings, Segment, SegmentId};
use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Buffer parameters. Derived from [`PipelineConfig`].
#[derive(Clone, Debug, PartialEq)]
pub struct BufferConfig {
    pub depth: usize,
    pub primer_window: usize,
    pub initial_primer: Vec<NoteEvent>,
    pub settings: GenerationSettings,
    pub retry: RetryPolicy,
}

impl BufferConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            depth: config.buffer.lookahead_depth.max(1),
            primer_window: config.buffer.primer_window,
            initial_primer: config.buffer.initial_primer.clone(),
            settings: config.generation_settings(),
            retry: config.retry.clone(),
        }
    }
}

/// A request on its way to the worker pool.
#[derive(Clone, Debug)]
pub struct GenerationJob {
    pub request: GenerationRequest,
    /// Buffer epoch the request belongs to.
    pub epoch: u64,
    /// Backoff to wait before calling the oracle.
    pub delay: Duration,
    pub issued: Instant,
}

impl GenerationJob {
    /// Earliest time the oracle may be called for this job.
    pub fn due(&self) -> Instant {
        self.issued + self.delay
    }
}

#[derive(Debug)]
enum Slot {
    Empty,
    Pending { ticket: u64, attempt: u32, since: Instant },
    Ready { segment: Segment },
    /// Gave up on `ticket`; skipped by `take_next` until re-armed.
    Parked { ticket: u64, error: OracleError, since: Instant },
}

impl Slot {
    /// Ticket that still has to be delivered from this slot.
    fn active_ticket(&self) -> Option<u64> {
        match self {
            Slot::Pending { ticket, .. } => Some(*ticket),
            Slot::Ready { segment } => Some(segment.id().0),
            Slot::Empty | Slot::Parked { .. } => None,
        }
    }

    fn view(&self) -> SlotView {
        match self {
            Slot::Empty => SlotView::Empty,
            Slot::Pending { ticket, attempt, .. } => SlotView::Pending {
                segment: SegmentId(*ticket),
                attempt: *attempt,
            },
            Slot::Ready { segment } => SlotView::Ready { segment: segment.id() },
            Slot::Parked { ticket, .. } => SlotView::Parked {
                segment: SegmentId(*ticket),
            },
        }
    }
}

/// Read-only view of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotView {
    Empty,
    Pending { segment: SegmentId, attempt: u32 },
    Ready { segment: SegmentId },
    Parked { segment: SegmentId },
}

/// Point-in-time summary of the buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferSnapshot {
    pub depth: usize,
    pub ready: usize,
    pub pending: usize,
    pub parked: usize,
    pub slots: Vec<SlotView>,
    pub degraded: bool,
    pub running: bool,
    /// Segments handed to playback since construction.
    pub delivered: u64,
}

struct BufferState {
    slots: Vec<Slot>,
    config: BufferConfig,
    epoch: u64,
    next_ticket: u64,
    running: bool,
    closed: bool,
    degraded: bool,
    /// Primer source when no earlier segment exists in this epoch.
    seed: Vec<NoteEvent>,
    /// Most recent segment handed to playback in this epoch.
    last_delivered: Option<Segment>,
    delivered: u64,
    rng: StdRng,
}

/// Bounded FIFO of generated segments.
pub struct LookaheadBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
    jobs: Sender<GenerationJob>,
    events: EventSink,
}

impl LookaheadBuffer {
    /// Create a stopped buffer that sends its requests to `jobs`.
    pub fn new(config: BufferConfig, jobs: Sender<GenerationJob>, events: EventSink) -> Self {
        let depth = config.depth.max(1);
        Self {
            state: Mutex::new(BufferState {
                slots: (0..depth).map(|_| Slot::Empty).collect(),
                seed: config.initial_primer.clone(),
                config: BufferConfig { depth, ..config },
                epoch: 0,
                next_ticket: 1,
                running: false,
                closed: false,
                degraded: false,
                last_delivered: None,
                delivered: 0,
                rng: StdRng::from_os_rng(),
            }),
            ready: Condvar::new(),
            jobs,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a new run: every slot is requested, primed from the initial
    /// primer. Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Shutdown);
        }
        if state.running {
            return Ok(());
        }
        state.running = true;
        state.seed = state.config.initial_primer.clone();
        self.reset_locked(&mut state);
        log::info!("[BUFFER] Started with {} slot(s)", state.slots.len());
        self.fill_locked(&mut state);
        Ok(())
    }

    /// Cancel all outstanding work and empty every slot.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.running = false;
        self.reset_locked(&mut state);
        log::info!("[BUFFER] Stopped");
        self.ready.notify_all();
    }

    /// Throw away everything buffered and in flight and refill primed by
    /// `seed` (typically the recently played notes).
    pub fn regenerate(&self, seed: Vec<NoteEvent>) {
        let mut state = self.lock();
        if !state.running {
            return;
        }
        state.seed = seed;
        self.reset_locked(&mut state);
        log::info!("[BUFFER] Regenerating from {} seed note(s)", state.seed.len());
        self.fill_locked(&mut state);
        self.ready.notify_all();
    }

    /// Permanently shut the buffer. Blocked consumers return `None`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.running = false;
        self.reset_locked(&mut state);
        self.ready.notify_all();
    }

    /// Request a segment for `slot` unless one is already pending or ready.
    ///
    /// Returns `true` if a request was issued.
    pub fn request_refill(&self, slot: usize) -> bool {
        let mut state = self.lock();
        if !state.running || slot >= state.slots.len() {
            return false;
        }
        match state.slots[slot] {
            Slot::Pending { .. } | Slot::Ready { .. } => false,
            Slot::Empty | Slot::Parked { .. } => {
                let ticket = Self::next_ticket(&mut state);
                self.issue_locked(&mut state, slot, ticket, 1, Duration::ZERO);
                true
            }
        }
    }

    /// Whether `job` would still be accepted.
    pub fn is_current(&self, job: &GenerationJob) -> bool {
        let state = self.lock();
        Self::matches(&state, job)
    }

    fn matches(state: &BufferState, job: &GenerationJob) -> bool {
        if job.epoch != state.epoch || !state.running {
            return false;
        }
        matches!(
            state.slots.get(job.request.slot),
            Some(Slot::Pending { ticket, attempt, .. })
                if *ticket == job.request.segment.0 && *attempt == job.request.attempt
        )
    }

    /// Report the outcome of a job.
    ///
    /// Success makes the slot Ready. Failure schedules a retry with backoff,
    /// or parks the slot once the retry limit is reached. Results for
    /// cancelled or superseded requests are dropped.
    pub fn complete(&self, job: &GenerationJob, result: std::result::Result<Segment, OracleError>) {
        let mut state = self.lock();
        let slot = job.request.slot;
        let segment = job.request.segment;

        if !Self::matches(&state, job) {
            log::debug!("[BUFFER] Discarding stale result for {} (slot {})", segment, slot);
            self.events.emit(PipelineEvent::StaleDiscarded { slot, segment });
            return;
        }

        let since = match state.slots[slot] {
            Slot::Pending { since, .. } => since,
            _ => Instant::now(),
        };

        match result {
            Ok(generated) => {
                log::debug!(
                    "[BUFFER] {} ready in slot {} ({} notes)",
                    segment,
                    slot,
                    generated.notes().len()
                );
                state.slots[slot] = Slot::Ready { segment: generated };
                self.events.emit(PipelineEvent::Ready {
                    slot,
                    segment,
                    attempt: job.request.attempt,
                    elapsed: since.elapsed(),
                });
                if state.degraded {
                    self.recover_locked(&mut state);
                }
                self.ready.notify_all();
            }
            Err(error) if job.request.attempt < state.config.retry.limit => {
                let next_attempt = job.request.attempt + 1;
                let policy = state.config.retry.clone();
                let delay = policy.backoff_with_jitter(next_attempt, &mut state.rng);
                log::warn!(
                    "[BUFFER] {} attempt {} failed ({}): {}; retrying in {}",
                    segment,
                    job.request.attempt,
                    error.kind(),
                    error,
                    humantime::format_duration(delay)
                );
                self.events.emit(PipelineEvent::AttemptFailed {
                    slot,
                    segment,
                    attempt: job.request.attempt,
                    error,
                    settings: job.request.settings.clone(),
                    retry_in: delay,
                });
                self.issue_locked(&mut state, slot, segment.0, next_attempt, delay);
            }
            Err(error) => {
                log::error!(
                    "[BUFFER] {}",
                    Error::PersistentGenerationFailure {
                        slot,
                        segment,
                        attempts: job.request.attempt,
                        last: error.clone(),
                    }
                );
                state.slots[slot] = Slot::Parked {
                    ticket: segment.0,
                    error: error.clone(),
                    since: Instant::now(),
                };
                state.degraded = true;
                self.events.emit(PipelineEvent::PersistentFailure {
                    slot,
                    segment,
                    attempts: job.request.attempt,
                    error,
                    settings: job.request.settings.clone(),
                });
                // Consumers waiting on this ticket move on to the next one.
                self.ready.notify_all();
            }
        }
    }

    /// Block until the oldest outstanding segment is ready and take it.
    ///
    /// The emptied slot is refilled immediately. Returns `None` once the
    /// buffer is stopped or closed.
    pub fn take_next(&self) -> Option<Segment> {
        let mut state = self.lock();
        loop {
            if state.closed || !state.running {
                return None;
            }
            if let Some(segment) = self.pop_locked(&mut state) {
                return Some(segment);
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take the oldest segment if it is already ready.
    pub fn try_take_next(&self) -> Option<Segment> {
        let mut state = self.lock();
        if state.closed || !state.running {
            return None;
        }
        self.pop_locked(&mut state)
    }

    /// [`take_next`](Self::take_next) with an upper bound on the wait.
    pub fn take_next_timeout(&self, timeout: Duration) -> Option<Segment> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed || !state.running {
                return None;
            }
            if let Some(segment) = self.pop_locked(&mut state) {
                return Some(segment);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Try again once every slot has been parked for `retry.rearm_after`.
    ///
    /// Nothing else re-arms a fully parked buffer, since re-arming normally
    /// follows a success in another slot. Returns when the next attempt is
    /// due while the buffer is waiting out the cool-down. The degraded flag
    /// stays set until a segment actually arrives.
    pub fn rearm_stalled(&self) -> Option<Instant> {
        let mut state = self.lock();
        if !state.running {
            return None;
        }
        let mut stalled_since = None;
        for slot in &state.slots {
            match slot {
                Slot::Parked { since, .. } => stalled_since = stalled_since.max(Some(*since)),
                _ => return None,
            }
        }
        let cooldown = state.config.retry.rearm_after;
        let due = stalled_since? + cooldown;
        if Instant::now() < due {
            return Some(due);
        }

        log::info!(
            "[BUFFER] Every slot gave up {} ago; trying again",
            humantime::format_duration(cooldown)
        );
        for slot in 0..state.slots.len() {
            let ticket = Self::next_ticket(&mut state);
            self.issue_locked(&mut state, slot, ticket, 1, Duration::ZERO);
        }
        None
    }

    /// Apply new model, primer and retry settings to future requests.
    /// The slot count is left alone; see [`resize`](Self::resize).
    pub fn update_settings(&self, config: &BufferConfig) {
        let mut state = self.lock();
        let depth = state.config.depth;
        state.config = BufferConfig {
            depth,
            ..config.clone()
        };
    }

    /// Change the number of slots. Only allowed while stopped.
    pub fn resize(&self, depth: usize) -> Result<()> {
        if depth == 0 {
            return Err(Error::Config("lookahead depth must be at least 1".to_string()));
        }
        let mut state = self.lock();
        if state.running {
            return Err(Error::Config("cannot resize a running buffer".to_string()));
        }
        state.config.depth = depth;
        state.slots = (0..depth).map(|_| Slot::Empty).collect();
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        let state = self.lock();
        let slots: Vec<SlotView> = state.slots.iter().map(Slot::view).collect();
        let count = |f: fn(&SlotView) -> bool| slots.iter().filter(|s| f(s)).count();
        BufferSnapshot {
            depth: slots.len(),
            ready: count(|s| matches!(s, SlotView::Ready { .. })),
            pending: count(|s| matches!(s, SlotView::Pending { .. })),
            parked: count(|s| matches!(s, SlotView::Parked { .. })),
            degraded: state.degraded,
            running: state.running,
            delivered: state.delivered,
            slots,
        }
    }

    fn next_ticket(state: &mut BufferState) -> u64 {
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        ticket
    }

    /// Drop all slot contents and invalidate in-flight requests.
    fn reset_locked(&self, state: &mut BufferState) {
        state.epoch += 1;
        state.degraded = false;
        state.last_delivered = None;
        for slot in state.slots.iter_mut() {
            *slot = Slot::Empty;
        }
    }

    /// Request every empty slot, lowest slot index first.
    fn fill_locked(&self, state: &mut BufferState) {
        for slot in 0..state.slots.len() {
            if matches!(state.slots[slot], Slot::Empty) {
                let ticket = Self::next_ticket(state);
                self.issue_locked(state, slot, ticket, 1, Duration::ZERO);
            }
        }
    }

    /// Primer for `ticket`: the tail of the newest earlier segment that is
    /// ready or already delivered, else the epoch seed.
    fn primer_for(state: &BufferState, ticket: u64) -> Vec<NoteEvent> {
        let ready = state.slots.iter().filter_map(|slot| match slot {
            Slot::Ready { segment } => Some(segment),
            _ => None,
        });
        let source = ready
            .chain(state.last_delivered.as_ref())
            .filter(|segment| segment.id().0 < ticket)
            .max_by_key(|segment| segment.id());
        primer::extract(source, state.config.primer_window, &state.seed)
    }

    fn issue_locked(&self, state: &mut BufferState, slot: usize, ticket: u64, attempt: u32, delay: Duration) {
        let request = GenerationRequest {
            segment: SegmentId(ticket),
            slot,
            attempt,
            primer: Self::primer_for(state, ticket),
            settings: state.config.settings.clone(),
        };
        state.slots[slot] = Slot::Pending {
            ticket,
            attempt,
            since: Instant::now(),
        };
        self.events.emit(PipelineEvent::Requested {
            slot,
            segment: request.segment,
            attempt,
            primer_len: request.primer.len(),
        });
        log::trace!("[BUFFER] Requesting {} in slot {} (attempt {})", request.segment, slot, attempt);

        let job = GenerationJob {
            request,
            epoch: state.epoch,
            delay,
            issued: Instant::now(),
        };
        if self.jobs.send(job).is_err() {
            log::warn!("[BUFFER] No worker pool attached; request for slot {} dropped", slot);
        }
    }

    /// Take the segment with the lowest outstanding ticket, if it is ready.
    fn pop_locked(&self, state: &mut BufferState) -> Option<Segment> {
        let (_, slot) = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.active_ticket().map(|t| (t, i)))
            .min()?;

        let segment = match std::mem::replace(&mut state.slots[slot], Slot::Empty) {
            Slot::Ready { segment } => segment,
            other => {
                state.slots[slot] = other;
                return None;
            }
        };

        state.last_delivered = Some(segment.clone());
        state.delivered += 1;
        let ticket = Self::next_ticket(state);
        self.issue_locked(state, slot, ticket, 1, Duration::ZERO);
        Some(segment)
    }

    /// Clear the degraded flag and give parked slots a fresh ticket.
    fn recover_locked(&self, state: &mut BufferState) {
        state.degraded = false;
        let parked: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Parked { .. }))
            .map(|(i, _)| i)
            .collect();
        for &slot in &parked {
            if let Slot::Parked { ticket, error, .. } = &state.slots[slot] {
                log::info!("[BUFFER] Re-arming slot {} (gave up on #{}: {})", slot, ticket, error.kind());
            }
            let ticket = Self::next_ticket(state);
            self.issue_locked(state, slot, ticket, 1, Duration::ZERO);
        }
        self.events.emit(PipelineEvent::Recovered { rearmed: parked.len() });
    }
}

impl std::fmt::Debug for LookaheadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookaheadBuffer").field("snapshot", &self.snapshot()).finish()
    }
}
