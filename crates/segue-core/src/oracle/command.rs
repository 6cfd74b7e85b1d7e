//! Oracle backed by an external program.
//!
//! The program receives one JSON request on stdin:
//!
//! ```json
//! {"segment": 3, "primer": [{"pitch": 60, "duration": 1.0, "velocity": 100}],
//!  "bundle": "models/melody.mag", "step_count": 16, "temperature": 1.0}
//! ```
//!
//! and must print `{"notes": [...]}` on stdout and exit with status 0.
//! A program still running at the call's deadline is killed.

use super::Oracle;
use crate::error::OracleError;
use crate::note::NoteEvent;
use crate::segment::GenerationRequest;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const EXIT_POLL: Duration = Duration::from_millis(10);

#[derive(Serialize)]
struct WireRequest<'a> {
    segment: u64,
    primer: &'a [NoteEvent],
    bundle: &'a str,
    step_count: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct WireResponse {
    notes: Vec<NoteEvent>,
}

/// Runs a program once per request.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    program: String,
    args: Vec<String>,
    label: String,
}

impl CommandOracle {
    pub fn new(program: String, args: Vec<String>) -> Self {
        let label = format!("command:{program}");
        Self { program, args, label }
    }

    fn encode(request: &GenerationRequest) -> Result<Vec<u8>, OracleError> {
        serde_json::to_vec(&WireRequest {
            segment: request.segment.0,
            primer: &request.primer,
            bundle: &request.settings.bundle,
            step_count: request.settings.step_count,
            temperature: request.settings.temperature,
        })
        .map_err(|e| OracleError::Unavailable(format!("failed to encode request: {e}")))
    }

    fn run(&self, request: &GenerationRequest, deadline: Option<Instant>) -> Result<Vec<NoteEvent>, OracleError> {
        let payload = Self::encode(request)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OracleError::Unavailable(format!("failed to start '{}': {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload) {
                log::debug!("[ORACLE] {} closed stdin early: {}", self.program, e);
            }
        }

        // Both pipes are drained concurrently so a chatty program cannot
        // block on a full pipe while we wait for it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match deadline {
            Some(deadline) => self.wait_until(&mut child, deadline)?,
            None => child.wait().map_err(|e| self.lost(e))?,
        };

        let stdout = stdout.join().unwrap_or_default();
        if !status.success() {
            let stderr = stderr.join().unwrap_or_default();
            return Err(OracleError::Unavailable(format!(
                "'{}' exited with {}: {}",
                self.program,
                status,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }

        let response: WireResponse = serde_json::from_slice(&stdout)
            .map_err(|e| OracleError::InvalidOutput(format!("unparseable response: {e}")))?;
        Ok(response.notes)
    }

    /// Wait for the child, killing it once `deadline` passes.
    fn wait_until(&self, child: &mut Child, deadline: Instant) -> Result<ExitStatus, OracleError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    log::warn!("[ORACLE] Killed '{}' (pid {}) at its deadline", self.program, child.id());
                    return Err(OracleError::Timeout(started.elapsed()));
                }
                Ok(None) => thread::sleep(EXIT_POLL),
                Err(e) => return Err(self.lost(e)),
            }
        }
    }

    fn lost(&self, e: std::io::Error) -> OracleError {
        OracleError::Unavailable(format!("'{}' did not finish: {e}", self.program))
    }
}

/// Read a child pipe to the end on its own thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl Oracle for CommandOracle {
    fn generate(&self, request: &GenerationRequest) -> Result<Vec<NoteEvent>, OracleError> {
        self.run(request, None)
    }

    fn generate_until(&self, request: &GenerationRequest, deadline: Instant) -> Result<Vec<NoteEvent>, OracleError> {
        self.run(request, Some(deadline))
    }

    fn name(&self) -> &str {
        &self.label
    }
}
