//! Pipeline configuration.
//!
//! Stored as TOML. Every section and field has a default, so a partial file
//! (or none at all) is valid. Durations are human-readable strings such as
//! `"250ms"` or `"2s"`.

use crate::error::{Error, Result};
use crate::note::NoteEvent;
use crate::segment::GenerationSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lowest temperature reachable from the console.
pub const MIN_TEMPERATURE: f64 = 0.1;
/// Highest temperature reachable from the console.
pub const MAX_TEMPERATURE: f64 = 2.0;

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: ModelSettings,
    pub buffer: BufferSettings,
    pub playback: PlaybackSettings,
    pub retry: RetryPolicy,
    pub oracle: OracleSettings,
    pub recorder: RecorderSettings,
    pub harmony: HarmonySettings,
}

/// Generative model parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model bundle path or identifier, passed through to the oracle
    pub bundle: String,
    /// Steps per generated segment
    pub step_count: u32,
    /// Sampling temperature
    pub temperature: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            bundle: "attention_rnn.mag".to_string(),
            step_count: 16,
            temperature: 1.0,
        }
    }
}

/// Lookahead buffer sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Number of segment slots (D)
    pub lookahead_depth: usize,
    /// Number of generation worker threads
    pub workers: usize,
    /// Notes taken from the previous segment as primer
    pub primer_window: usize,
    /// Primer used when no segment exists yet
    pub initial_primer: Vec<NoteEvent>,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            lookahead_depth: 2,
            workers: 2,
            primer_window: 8,
            initial_primer: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Tempo. 8 steps per second is 120 qpm at four steps per quarter.
    pub steps_per_second: f64,
    /// How long before the end of the current segment the next one is staged
    #[serde(with = "human_duration")]
    pub prefetch: Duration,
    /// Number of most recently played notes kept for Regenerate
    pub history_len: usize,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            steps_per_second: 8.0,
            prefetch: Duration::from_secs(2),
            history_len: 32,
        }
    }
}

/// Retry policy for failed generation requests.
///
/// The delay before attempt `n + 1` is `base_delay * 2^(n - 1)`, capped at
/// `max_delay`, plus up to `jitter * delay` of random extra wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per segment before the slot is parked
    pub limit: u32,
    #[serde(with = "human_duration")]
    pub base_delay: Duration,
    #[serde(with = "human_duration")]
    pub max_delay: Duration,
    pub jitter: f64,
    /// Once every slot has given up, wait this long and try again
    #[serde(with = "human_duration")]
    pub rearm_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
            rearm_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt, without jitter.
    ///
    /// The first attempt is never delayed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) plus random jitter drawn from `rng`.
    pub fn backoff_with_jitter<R: rand::Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(attempt);
        if delay.is_zero() || self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(self.jitter.min(1.0) * rng.random::<f64>());
        delay + extra
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    /// Per-call timeout
    #[serde(with = "human_duration")]
    pub timeout: Duration,
    /// Which oracle to run
    pub backend: OracleKind,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            backend: OracleKind::default(),
        }
    }
}

/// Oracle selection, tagged by `kind`:
///
/// ```toml
/// [oracle.backend]
/// kind = "command"
/// program = "python3"
/// args = ["melody_rnn_bridge.py"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OracleKind {
    /// Built-in scale walker
    RandomWalk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
        /// Artificial delay per call
        #[serde(default, with = "human_duration")]
        latency: Duration,
        /// Probability of a simulated failure per call
        #[serde(default)]
        failure_rate: f64,
    },
    /// External program speaking JSON over stdio
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for OracleKind {
    fn default() -> Self {
        OracleKind::RandomWalk {
            seed: None,
            latency: Duration::ZERO,
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    /// Record everything played to a MIDI file
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("recording.mid"),
        }
    }
}

/// Fits played notes onto a chord progression.
///
/// ```toml
/// [harmony]
/// enabled = true
/// key = "D"
///
/// [[harmony.parts]]
/// name = "verse"
/// chords = ["I", "vi", "IV", "V7"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonySettings {
    pub enabled: bool,
    /// Tonic of the major key, e.g. "C", "F#", "Bb"
    pub key: String,
    /// How long each chord lasts. 16 steps is one 4/4 bar.
    pub steps_per_chord: u32,
    /// Song parts played in order, then from the top again
    pub parts: Vec<SongPart>,
}

impl Default for HarmonySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            key: "C".to_string(),
            steps_per_chord: 16,
            parts: vec![SongPart {
                name: "main".to_string(),
                chords: ["I", "V", "vi", "IV"].iter().map(|c| c.to_string()).collect(),
            }],
        }
    }
}

/// A named run of chords in Roman numeral notation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongPart {
    pub name: String,
    #[serde(default)]
    pub chords: Vec<String>,
}

impl PipelineConfig {
    /// Load and validate a configuration file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Settings attached to each generation request.
    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            bundle: self.model.bundle.clone(),
            step_count: self.model.step_count,
            temperature: self.model.temperature,
        }
    }

    /// Check that the configuration can drive a pipeline.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.buffer.lookahead_depth == 0 {
            return fail("buffer.lookahead_depth must be at least 1");
        }
        if self.buffer.workers == 0 {
            return fail("buffer.workers must be at least 1");
        }
        if self.buffer.primer_window == 0 {
            return fail("buffer.primer_window must be at least 1");
        }
        if self.model.step_count == 0 {
            return fail("model.step_count must be at least 1");
        }
        if !(self.model.temperature.is_finite() && self.model.temperature > 0.0) {
            return fail("model.temperature must be positive");
        }
        if !(self.playback.steps_per_second.is_finite() && self.playback.steps_per_second > 0.0) {
            return fail("playback.steps_per_second must be positive");
        }
        if self.playback.history_len < self.buffer.primer_window {
            return fail("playback.history_len must not be shorter than buffer.primer_window");
        }
        if self.retry.limit == 0 {
            return fail("retry.limit must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return fail("retry.jitter must be between 0 and 1");
        }
        if self.retry.rearm_after.is_zero() {
            return fail("retry.rearm_after must be positive");
        }
        if self.oracle.timeout.is_zero() {
            return fail("oracle.timeout must be positive");
        }
        if let OracleKind::RandomWalk { failure_rate, .. } = self.oracle.backend {
            if !(0.0..=1.0).contains(&failure_rate) {
                return fail("oracle.backend.failure_rate must be between 0 and 1");
            }
        }
        if let OracleKind::Command { program, .. } = &self.oracle.backend {
            if program.trim().is_empty() {
                return fail("oracle.backend.program must not be empty");
            }
        }
        if self.harmony.enabled {
            crate::harmony::Harmony::from_settings(&self.harmony)?;
        }
        for (i, note) in self.buffer.initial_primer.iter().enumerate() {
            if let Some(reason) = note.validate() {
                return Err(Error::Config(format!("buffer.initial_primer note {i}: {reason}")));
            }
        }
        Ok(())
    }
}

/// Clamp a temperature to the console range.
pub fn clamp_temperature(value: f64) -> f64 {
    value.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
}

/// Commented configuration file with every default spelled out.
pub fn default_config_toml() -> &'static str {
    r#"# segue configuration file

[model]
# Model bundle path or identifier, passed to the oracle
bundle = "attention_rnn.mag"

# Steps per generated segment (4 steps = one quarter note)
step_count = 16

# Sampling temperature, 0.1 to 2.0 from the console
temperature = 1.0

[buffer]
# Segments generated ahead of playback
lookahead_depth = 2

# Generation worker threads
workers = 2

# Notes of the previous segment used as primer
primer_window = 8

# Seed melody for the very first request
# initial_primer = [{ pitch = 60, duration = 2 }, { pitch = 64, duration = 2 }]

[playback]
# 8 steps per second = 120 quarter notes per minute
steps_per_second = 8.0

# Stage the next segment this long before the current one ends
prefetch = "2s"

# Played notes remembered as primer for Regenerate
history_len = 32

[retry]
# Attempts per segment before giving up
limit = 3
base_delay = "250ms"
max_delay = "5s"
jitter = 0.2

# When every slot has given up, start over after this long
rearm_after = "30s"

[oracle]
timeout = "10s"

[oracle.backend]
kind = "random-walk"
# seed = 42
# latency = "300ms"
# failure_rate = 0.0

# [oracle.backend]
# kind = "command"
# program = "python3"
# args = ["melody_rnn_bridge.py"]

[recorder]
enabled = false
path = "recording.mid"

[harmony]
# Fit played notes onto the chords below
enabled = false
key = "C"

# 16 steps = one bar of 4/4
steps_per_chord = 16

[[harmony.parts]]
name = "main"
chords = ["I", "V", "vi", "IV"]
"#
}

/// Serde adapter for `Duration` as a humantime string.
pub mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::note::Pitch;
    use crate::timing::StepTime;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_config_file_matches_defaults() {
        let parsed: PipelineConfig = toml::from_str(default_config_toml()).unwrap();
        assert_eq!(parsed, PipelineConfig::default());
        parsed.validate().unwrap();
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
[buffer]
lookahead_depth = 4
initial_primer = [{ pitch = 62, duration = 2 }, { duration = 1 }]

[retry]
base_delay = "100ms"
"#,
        )
        .unwrap();
        assert_eq!(parsed.buffer.lookahead_depth, 4);
        assert_eq!(parsed.buffer.workers, 2);
        assert_eq!(parsed.buffer.initial_primer[0].pitch, Pitch::Note(62));
        assert_eq!(parsed.buffer.initial_primer[0].duration, StepTime::from_steps(2));
        assert!(parsed.buffer.initial_primer[1].pitch.is_rest());
        assert_eq!(parsed.retry.base_delay, Duration::from_millis(100));
        assert_eq!(parsed.retry.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_command_backend() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
[oracle]
timeout = "30s"

[oracle.backend]
kind = "command"
program = "python3"
args = ["bridge.py", "--gpu"]
"#,
        )
        .unwrap();
        assert_eq!(parsed.oracle.timeout, Duration::from_secs(30));
        assert_eq!(
            parsed.oracle.backend,
            OracleKind::Command {
                program: "python3".to_string(),
                args: vec!["bridge.py".to_string(), "--gpu".to_string()],
            }
        );
    }

    #[test]
    fn test_harmony_parts() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
[harmony]
enabled = true
key = "G"
steps_per_chord = 8

[[harmony.parts]]
name = "verse"
chords = ["I", "IV"]

[[harmony.parts]]
name = "chorus"
chords = ["vi", "V7"]
"#,
        )
        .unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.harmony.steps_per_chord, 8);
        let names: Vec<&str> = parsed.harmony.parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["verse", "chorus"]);
        assert_eq!(parsed.harmony.parts[1].chords, vec!["vi", "V7"]);
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = PipelineConfig::default();
        config.oracle.backend = OracleKind::RandomWalk {
            seed: Some(5),
            latency: Duration::from_millis(300),
            failure_rate: 0.25,
        };
        config.playback.prefetch = Duration::from_millis(1500);
        config.harmony.parts.push(SongPart {
            name: "bridge".to_string(),
            chords: vec!["ii".to_string(), "V".to_string()],
        });
        let text = config.to_toml().unwrap();
        let parsed: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("segue.toml");
        let mut config = PipelineConfig::default();
        config.model.step_count = 32;
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<fn(&mut PipelineConfig)> = vec![
            |c| c.buffer.lookahead_depth = 0,
            |c| c.buffer.workers = 0,
            |c| c.buffer.primer_window = 0,
            |c| c.model.step_count = 0,
            |c| c.model.temperature = 0.0,
            |c| c.playback.steps_per_second = -1.0,
            |c| c.playback.history_len = 2,
            |c| c.retry.limit = 0,
            |c| c.retry.jitter = 1.5,
            |c| c.oracle.timeout = Duration::ZERO,
            |c| c.retry.rearm_after = Duration::ZERO,
            |c| {
                c.harmony.enabled = true;
                c.harmony.key = "H".to_string();
            },
            |c| {
                c.harmony.enabled = true;
                c.harmony.parts[0].chords.push("VIII".to_string());
            },
            |c| {
                c.oracle.backend = OracleKind::Command {
                    program: " ".to_string(),
                    args: Vec::new(),
                }
            },
        ];
        for mutate in cases {
            let mut config = PipelineConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(Error::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            limit: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..100 {
            let d = policy.backoff_with_jitter(2, &mut rng);
            assert!(d >= Duration::from_millis(250) && d <= Duration::from_millis(375));
        }
    }

    #[test]
    fn test_clamp_temperature() {
        assert_eq!(clamp_temperature(0.0), MIN_TEMPERATURE);
        assert_eq!(clamp_temperature(5.0), MAX_TEMPERATURE);
        assert_eq!(clamp_temperature(1.3), 1.3);
    }
}
