//! Generation worker pool.
//!
//! A fixed number of named threads pull [`GenerationJob`]s from the buffer's
//! job channel, call the oracle and report back. Each oracle call runs on a
//! short-lived helper thread so the worker can give up after the configured
//! timeout; a result arriving after that is dropped with the helper.
//!
//! Workers never wait out a retry backoff themselves. A job that is not due
//! yet goes to the retry timer thread, which hands it back to the workers
//! when its backoff has passed, or drops it if it went stale meanwhile. The
//! same thread re-arms the buffer after every slot has given up.

use crate::buffer::{GenerationJob, LookaheadBuffer};
use crate::error::{Error, OracleError, Result};
use crate::oracle::OracleAdapter;
use crate::segment::{GenerationRequest, Segment};
use crossbeam_channel::{at, bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest the retry timer sleeps before checking for a stalled buffer.
const STALL_CHECK: Duration = Duration::from_millis(250);

/// Oracle timeout shared with the workers so it can change while running.
#[derive(Clone, Debug)]
pub struct SharedTimeout(Arc<AtomicU64>);

impl SharedTimeout {
    pub fn new(timeout: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(Self::to_millis(timeout))))
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, timeout: Duration) {
        self.0.store(Self::to_millis(timeout), Ordering::Relaxed);
    }

    fn to_millis(timeout: Duration) -> u64 {
        (timeout.as_millis() as u64).max(1)
    }
}

/// Running worker threads. Dropping the pool stops and joins them.
pub struct GenerationPool {
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    /// Dropped to signal shutdown; every thread sees the disconnect.
    shutdown_tx: Option<Sender<()>>,
    oracle_name: String,
}

impl GenerationPool {
    /// Spawn `size` workers serving `jobs`, plus the retry timer.
    pub fn spawn(
        size: usize,
        buffer: Arc<LookaheadBuffer>,
        jobs: Receiver<GenerationJob>,
        adapter: OracleAdapter,
        timeout: SharedTimeout,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (delayed_tx, delayed_rx) = unbounded();
        let (due_tx, due_rx) = unbounded();
        let oracle_name = adapter.name().to_string();

        let timer = RetryTimer {
            buffer: buffer.clone(),
            delayed: delayed_rx,
            due: due_tx,
            shutdown: shutdown_rx.clone(),
            waiting: BinaryHeap::new(),
        };
        let timer = thread::Builder::new()
            .name("segue-gen-retry".to_string())
            .spawn(move || timer.run())
            .map_err(Error::Io)?;

        let mut workers = Vec::with_capacity(size.max(1));
        for id in 0..size.max(1) {
            let worker = Worker {
                id,
                buffer: buffer.clone(),
                jobs: jobs.clone(),
                retries: due_rx.clone(),
                delayed: delayed_tx.clone(),
                shutdown: shutdown_rx.clone(),
                adapter: adapter.clone(),
                timeout: timeout.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("segue-gen-{id}"))
                .spawn(move || worker.run())
                .map_err(Error::Io)?;
            workers.push(handle);
        }

        log::info!("[POOL] Started {} worker(s) using oracle '{}'", workers.len(), oracle_name);
        Ok(Self {
            workers,
            timer: Some(timer),
            shutdown_tx: Some(shutdown_tx),
            oracle_name,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn oracle_name(&self) -> &str {
        &self.oracle_name
    }

    /// Stop all threads and wait for them.
    ///
    /// A worker blocked in an oracle call finishes waiting for it (bounded by
    /// the timeout) before it exits.
    pub fn shutdown(&mut self) {
        if self.shutdown_tx.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..).chain(self.timer.take()) {
            let _ = handle.join();
        }
        log::debug!("[POOL] Workers stopped");
    }
}

impl Drop for GenerationPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    id: usize,
    buffer: Arc<LookaheadBuffer>,
    jobs: Receiver<GenerationJob>,
    /// Retries whose backoff has passed.
    retries: Receiver<GenerationJob>,
    /// Retries still backing off go here.
    delayed: Sender<GenerationJob>,
    shutdown: Receiver<()>,
    adapter: OracleAdapter,
    timeout: SharedTimeout,
}

impl Worker {
    fn run(self) {
        loop {
            let job = select! {
                recv(self.shutdown) -> _ => break,
                recv(self.retries) -> msg => msg,
                recv(self.jobs) -> msg => msg,
            };
            match job {
                Ok(job) => self.process(job),
                Err(_) => break,
            }
        }
        log::trace!("[POOL] Worker {} exiting", self.id);
    }

    fn process(&self, job: GenerationJob) {
        if !self.buffer.is_current(&job) {
            log::debug!("[POOL] Skipping stale request for {}", job.request.segment);
            return;
        }

        if job.due() > Instant::now() {
            if self.delayed.send(job).is_err() {
                log::trace!("[POOL] Retry timer gone; dropping delayed request");
            }
            return;
        }

        log::debug!(
            "[POOL] Worker {} generating {} (attempt {}, {} primer notes)",
            self.id,
            job.request.segment,
            job.request.attempt,
            job.request.primer.len()
        );
        let result = call_with_timeout(&self.adapter, &job.request, self.timeout.get());
        self.buffer.complete(&job, result);
    }
}

/// A job waiting out its backoff, ordered earliest due first.
struct Delayed(GenerationJob);

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.0.due() == other.0.due()
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.due().cmp(&self.0.due())
    }
}

/// Holds backed-off jobs so that no worker sleeps through a backoff.
struct RetryTimer {
    buffer: Arc<LookaheadBuffer>,
    delayed: Receiver<GenerationJob>,
    due: Sender<GenerationJob>,
    shutdown: Receiver<()>,
    waiting: BinaryHeap<Delayed>,
}

impl RetryTimer {
    fn run(mut self) {
        loop {
            let now = Instant::now();
            self.release_due(now);

            let mut wake = now + STALL_CHECK;
            if let Some(next) = self.waiting.peek() {
                wake = wake.min(next.0.due());
            }
            if let Some(rearm) = self.buffer.rearm_stalled() {
                wake = wake.min(rearm);
            }

            select! {
                recv(self.shutdown) -> _ => break,
                recv(self.delayed) -> msg => match msg {
                    Ok(job) => self.waiting.push(Delayed(job)),
                    Err(_) => break,
                },
                recv(at(wake)) -> _ => {}
            }
        }
        log::trace!("[POOL] Retry timer exiting");
    }

    /// Hand due jobs back to the workers, dropping the stale ones.
    fn release_due(&mut self, now: Instant) {
        while self.waiting.peek().is_some_and(|next| next.0.due() <= now) {
            let Some(Delayed(job)) = self.waiting.pop() else {
                break;
            };
            if !self.buffer.is_current(&job) {
                log::debug!("[POOL] Dropping stale retry for {}", job.request.segment);
                continue;
            }
            if self.due.send(job).is_err() {
                break;
            }
        }
    }
}

/// Run one oracle call on a helper thread and wait at most `timeout`.
///
/// The oracle learns the deadline too; on expiry the helper is left to
/// finish on its own and its result is dropped.
pub fn call_with_timeout(
    adapter: &OracleAdapter,
    request: &GenerationRequest,
    timeout: Duration,
) -> std::result::Result<Segment, OracleError> {
    let (tx, rx) = bounded(1);
    let adapter = adapter.clone();
    let owned = request.clone();
    let deadline = Instant::now() + timeout;

    thread::Builder::new()
        .name(format!("segue-oracle-{}", request.segment.0))
        .spawn(move || {
            let _ = tx.send(adapter.generate_until(&owned, deadline));
        })
        .map_err(|e| OracleError::Unavailable(format!("failed to start oracle call: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            log::warn!(
                "[POOL] {} timed out after {}",
                request.segment,
                humantime::format_duration(timeout)
            );
            Err(OracleError::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(OracleError::Unavailable("oracle call panicked".to_string())),
    }
}
