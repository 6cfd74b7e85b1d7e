//! Built-in oracle: a random walk over the C major scale.
//!
//! Continues from the last sounding pitch of the primer. Temperature widens
//! the interval spread and makes rests more likely. Optional latency and
//! failure rate simulate a slow or flaky model.

use super::Oracle;
use crate::error::OracleError;
use crate::note::{NoteEvent, Pitch};
use crate::segment::GenerationRequest;
use crate::timing::StepTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

const SCALE: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];
const LOWEST: u8 = 48;
const HIGHEST: u8 = 84;
const START_PITCH: u8 = 60;
const DURATIONS: [u32; 5] = [1, 1, 2, 2, 4];

pub struct RandomWalkOracle {
    rng: Mutex<StdRng>,
    latency: Duration,
    failure_rate: f64,
}

impl RandomWalkOracle {
    /// Create a walker. `seed` makes the output reproducible.
    pub fn new(seed: Option<u64>, latency: Duration, failure_rate: f64) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng: Mutex::new(rng),
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    /// Index into the scale-degree ladder nearest to `pitch`.
    fn degree_of(pitch: u8) -> i32 {
        let octave = (pitch / 12) as i32;
        let pc = pitch % 12;
        let step = SCALE
            .iter()
            .position(|&s| s >= pc)
            .unwrap_or(SCALE.len() - 1) as i32;
        octave * SCALE.len() as i32 + step
    }

    fn pitch_of(degree: i32) -> u8 {
        let len = SCALE.len() as i32;
        let octave = degree.div_euclid(len);
        let step = degree.rem_euclid(len) as usize;
        (octave * 12 + SCALE[step] as i32).clamp(LOWEST as i32, HIGHEST as i32) as u8
    }

    fn walk(&self, rng: &mut StdRng, request: &GenerationRequest) -> Vec<NoteEvent> {
        let temperature = request.settings.temperature.max(0.01);
        let spread = ((2.0 * temperature).round() as i32).max(1);
        let rest_chance = (0.08 * temperature).min(0.5);

        let start = request
            .primer
            .iter()
            .rev()
            .find_map(|n| n.pitch.midi())
            .unwrap_or(START_PITCH);
        let mut degree = Self::degree_of(start);
        let low = Self::degree_of(LOWEST);
        let high = Self::degree_of(HIGHEST);

        let mut notes = Vec::new();
        let mut remaining = request.settings.step_count;
        while remaining > 0 {
            let steps = DURATIONS[rng.random_range(0..DURATIONS.len())].min(remaining);
            remaining -= steps;
            let duration = StepTime::from_steps(steps);

            if !notes.is_empty() && rng.random_bool(rest_chance) {
                notes.push(NoteEvent::rest(duration));
                continue;
            }

            degree = (degree + rng.random_range(-spread..=spread)).clamp(low, high);
            notes.push(NoteEvent {
                pitch: Pitch::Note(Self::pitch_of(degree)),
                duration,
                velocity: rng.random_range(80..=110),
            });
        }
        notes
    }
}

impl Oracle for RandomWalkOracle {
    fn generate(&self, request: &GenerationRequest) -> Result<Vec<NoteEvent>, OracleError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let mut rng = self
            .rng
            .lock()
            .map_err(|_| OracleError::Unavailable("random walk state poisoned".to_string()))?;

        if self.failure_rate > 0.0 && rng.random_bool(self.failure_rate) {
            return Err(OracleError::Unavailable("simulated model failure".to_string()));
        }

        Ok(self.walk(&mut rng, request))
    }

    fn name(&self) -> &str {
        "random-walk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::tests::request;
    use crate::oracle::into_segment;

    #[test]
    fn test_fills_exact_step_count() {
        let oracle = RandomWalkOracle::new(Some(7), Duration::ZERO, 0.0);
        for steps in [1, 5, 16, 33] {
            let notes = oracle.generate(&request(steps)).unwrap();
            let total: StepTime = notes.iter().map(|n| n.duration).sum();
            assert_eq!(total, StepTime::from_steps(steps));
            assert!(into_segment(&request(steps), notes).is_ok());
        }
    }

    #[test]
    fn test_seed_is_reproducible() {
        let a = RandomWalkOracle::new(Some(42), Duration::ZERO, 0.0);
        let b = RandomWalkOracle::new(Some(42), Duration::ZERO, 0.0);
        assert_eq!(a.generate(&request(16)).unwrap(), b.generate(&request(16)).unwrap());
    }

    #[test]
    fn test_pitches_stay_in_range_and_scale() {
        let oracle = RandomWalkOracle::new(Some(3), Duration::ZERO, 0.0);
        let mut req = request(64);
        req.settings.temperature = 2.0;
        for note in oracle.generate(&req).unwrap() {
            if let Some(p) = note.pitch.midi() {
                assert!((LOWEST..=HIGHEST).contains(&p));
                assert!(SCALE.contains(&(p % 12)));
            }
        }
    }

    #[test]
    fn test_continues_near_primer() {
        let oracle = RandomWalkOracle::new(Some(11), Duration::ZERO, 0.0);
        let mut req = request(4);
        req.settings.temperature = 0.1;
        req.primer = vec![NoteEvent::note(72, StepTime::from_steps(1), 100)];
        let first = oracle.generate(&req).unwrap()[0].pitch.midi().unwrap();
        // One scale degree at most from C5.
        assert!((71..=74).contains(&first), "first pitch {first}");
    }

    #[test]
    fn test_failure_rate_one_always_fails() {
        let oracle = RandomWalkOracle::new(Some(1), Duration::ZERO, 1.0);
        assert_eq!(oracle.generate(&request(4)).unwrap_err().kind(), "OracleUnavailable");
    }
}
