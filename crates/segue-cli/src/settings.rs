//! Configuration file discovery and command-line overrides.

use anyhow::{Context, Result};
use clap::Args;
use directories::ProjectDirs;
use segue_core::{clamp_temperature, default_config_toml, OracleKind, PipelineConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub fn config_path() -> Result<PathBuf> {
    ProjectDirs::from("", "", "segue")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .context("Could not determine config directory")
}

/// Write the commented default configuration to `path`.
pub fn create_default_config_file(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, default_config_toml()).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Flags shared by the commands that run the pipeline.
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Configuration file (defaults to the user config file if it exists)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Tempo in steps per second
    #[arg(long, value_name = "STEPS")]
    pub tempo: Option<f64>,

    /// Sampling temperature (0.1 - 2.0)
    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// Steps per generated segment
    #[arg(long, value_name = "N")]
    pub steps: Option<u32>,

    /// Number of segments kept ahead of playback
    #[arg(long, value_name = "N")]
    pub depth: Option<usize>,

    /// Number of generation workers
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Oracle call timeout (e.g. "5s")
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Seed for the built-in random-walk oracle
    #[arg(long)]
    pub seed: Option<u64>,

    /// Use an external generator program instead of the built-in oracle
    #[arg(long, value_name = "PROGRAM")]
    pub oracle_command: Option<String>,

    /// Arguments for --oracle-command
    #[arg(long = "oracle-arg", value_name = "ARG", requires = "oracle_command")]
    pub oracle_args: Vec<String>,

    /// Record the performance to a MIDI file
    #[arg(long, value_name = "FILE")]
    pub record: Option<PathBuf>,

    /// Fit notes onto the configured chords in this key (e.g. "G", "Bb")
    #[arg(long, value_name = "KEY")]
    pub key: Option<String>,
}

impl Overrides {
    /// Load the configuration and apply the flags on top.
    pub fn load(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load_from(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => {
                let path = config_path()?;
                if path.exists() {
                    log::debug!("Loading config from {}", path.display());
                    PipelineConfig::load_from(&path)
                        .with_context(|| format!("Failed to load config {}", path.display()))?
                } else {
                    PipelineConfig::default()
                }
            }
        };
        self.apply(&mut config);
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(tempo) = self.tempo {
            config.playback.steps_per_second = tempo;
        }
        if let Some(temperature) = self.temperature {
            config.model.temperature = clamp_temperature(temperature);
        }
        if let Some(steps) = self.steps {
            config.model.step_count = steps;
        }
        if let Some(depth) = self.depth {
            config.buffer.lookahead_depth = depth;
        }
        if let Some(workers) = self.workers {
            config.buffer.workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.oracle.timeout = timeout;
        }
        if let Some(program) = &self.oracle_command {
            config.oracle.backend = OracleKind::Command {
                program: program.clone(),
                args: self.oracle_args.clone(),
            };
        } else if let Some(wanted) = self.seed {
            if let OracleKind::RandomWalk { seed, .. } = &mut config.oracle.backend {
                *seed = Some(wanted);
            }
        }
        if let Some(path) = &self.record {
            config.recorder.enabled = true;
            config.recorder.path = path.clone();
        }
        if let Some(key) = &self.key {
            config.harmony.enabled = true;
            config.harmony.key = key.clone();
        }
    }
}
