//! Timing primitives for playback.
//!
//! - [`StepTime`] - Fixed-point step representation for exact note durations
//! - [`PlaybackClock`] - Anchor-based clock converting between instants and steps
//!
//! Note times are always derived from a single anchor point rather than from
//! accumulated sleep deltas, so timing error does not compound over a long
//! performance.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Fixed-point step count.
///
/// One step is split into 5040 ticks, which divides evenly by every
/// denominator from 1 to 10. Triplets, quintuplets and septuplets are
/// therefore exact and summing durations never drifts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct StepTime {
    ticks: i64,
}

impl StepTime {
    /// Ticks per step.
    pub const TICKS_PER_STEP: i64 = 5040;

    /// Zero step time constant.
    pub const ZERO: StepTime = StepTime { ticks: 0 };

    /// Create a StepTime from a whole number of steps.
    #[inline]
    pub const fn from_steps(steps: u32) -> Self {
        Self {
            ticks: steps as i64 * Self::TICKS_PER_STEP,
        }
    }

    /// Create a StepTime from the rational `num / den` steps.
    ///
    /// Rounds to the nearest tick. A zero denominator yields zero.
    pub fn from_ratio(num: i64, den: i64) -> Self {
        if den == 0 {
            return Self::ZERO;
        }
        let (num, den) = if den < 0 { (-(num as i128), -(den as i128)) } else { (num as i128, den as i128) };
        let scaled = num * Self::TICKS_PER_STEP as i128;
        // Round half away from zero.
        let rounded = if scaled >= 0 {
            (2 * scaled + den) / (2 * den)
        } else {
            (2 * scaled - den) / (2 * den)
        };
        Self {
            ticks: rounded as i64,
        }
    }

    /// Create a StepTime from a floating-point step value.
    #[inline]
    pub fn from_float(value: f64) -> Self {
        Self {
            ticks: (value * Self::TICKS_PER_STEP as f64).round() as i64,
        }
    }

    /// Convert to a floating-point step value.
    #[inline]
    pub fn to_float(self) -> f64 {
        self.ticks as f64 / Self::TICKS_PER_STEP as f64
    }

    /// Raw tick count.
    #[inline]
    pub fn ticks(self) -> i64 {
        self.ticks
    }

    /// True for strictly positive step times.
    #[inline]
    pub fn is_positive(self) -> bool {
        self.ticks > 0
    }
}

impl std::ops::Add for StepTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            ticks: self.ticks.saturating_add(rhs.ticks),
        }
    }
}

impl std::ops::AddAssign for StepTime {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for StepTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            ticks: self.ticks.saturating_sub(rhs.ticks),
        }
    }
}

impl std::iter::Sum for StepTime {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(StepTime::ZERO, |acc, s| acc + s)
    }
}

impl From<f64> for StepTime {
    fn from(value: f64) -> Self {
        StepTime::from_float(value)
    }
}

impl From<StepTime> for f64 {
    fn from(value: StepTime) -> Self {
        value.to_float()
    }
}

impl std::fmt::Display for StepTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}", self.to_float())
    }
}

/// Anchor-based playback clock.
///
/// The clock keeps an anchor point (a step position at a specific instant)
/// and uses the tempo in steps per second to derive positions at other
/// times. While paused the position stays frozen at the anchor.
#[derive(Clone, Debug)]
pub struct PlaybackClock {
    steps_per_second: f64,
    running: bool,
    anchor_instant: Instant,
    anchor_step: StepTime,
}

impl PlaybackClock {
    /// Create a stopped clock at step 0.
    pub fn new(steps_per_second: f64) -> Self {
        Self {
            steps_per_second: Self::clamp_rate(steps_per_second),
            running: false,
            anchor_instant: Instant::now(),
            anchor_step: StepTime::ZERO,
        }
    }

    fn clamp_rate(rate: f64) -> f64 {
        if rate.is_finite() {
            rate.clamp(0.01, 10_000.0)
        } else {
            8.0
        }
    }

    /// Tempo in steps per second.
    pub fn steps_per_second(&self) -> f64 {
        self.steps_per_second
    }

    /// Start (or restart) running from the current anchor step.
    pub fn start(&mut self, now: Instant) {
        self.anchor_instant = now;
        self.running = true;
    }

    /// Freeze the clock, returning the position reached.
    pub fn pause(&mut self, now: Instant) -> StepTime {
        self.anchor_step = self.step_at(now);
        self.anchor_instant = now;
        self.running = false;
        self.anchor_step
    }

    /// Continue from the frozen position.
    pub fn resume(&mut self, now: Instant) {
        self.start(now);
    }

    /// Move the anchor to `step` at `now` without changing the run state.
    pub fn seek(&mut self, step: StepTime, now: Instant) {
        self.anchor_step = step;
        self.anchor_instant = now;
    }

    /// Change the tempo, preserving the current position.
    pub fn set_rate(&mut self, steps_per_second: f64, now: Instant) {
        let step = self.step_at(now);
        self.anchor_step = step;
        self.anchor_instant = now;
        self.steps_per_second = Self::clamp_rate(steps_per_second);
    }

    /// Step position at a given instant.
    pub fn step_at(&self, time: Instant) -> StepTime {
        if !self.running || time <= self.anchor_instant {
            return self.anchor_step;
        }
        let elapsed = time.duration_since(self.anchor_instant).as_secs_f64();
        self.anchor_step + StepTime::from_float(elapsed * self.steps_per_second)
    }

    /// Instant at which the clock reaches `step`.
    ///
    /// Steps before the anchor map to the anchor instant.
    pub fn instant_at(&self, step: StepTime) -> Instant {
        if step <= self.anchor_step {
            return self.anchor_instant;
        }
        self.anchor_instant + self.duration_of(step - self.anchor_step)
    }

    /// Wall-clock length of a span of steps at the current tempo.
    pub fn duration_of(&self, steps: StepTime) -> Duration {
        let seconds = steps.to_float() / self.steps_per_second;
        if seconds <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(seconds)
        }
    }

    /// Number of steps covered by a wall-clock duration at the current tempo.
    pub fn steps_in(&self, duration: Duration) -> StepTime {
        StepTime::from_float(duration.as_secs_f64() * self.steps_per_second)
    }

    /// Check if the clock is running.
    pub fn is_running(&self) -> bool {
        self.running
    }
}
