//! Segment oracle boundary.
//!
//! The generative model is an opaque request/response oracle: given a primer
//! and settings it answers with a melody or fails. [`OracleAdapter`] turns a
//! raw answer into a validated, immutable [`Segment`].
//!
//! Built-in oracles:
//! - [`CommandOracle`] - runs an external program speaking JSON over stdio
//! - [`RandomWalkOracle`] - a self-contained scale walker for demos and tests
//!
//! Any `Fn(&GenerationRequest) -> Result<Vec<NoteEvent>, OracleError>` closure
//! is an oracle too.

mod command;
mod random_walk;

pub use command::CommandOracle;
pub use random_walk::RandomWalkOracle;

use crate::config::OracleKind;
use crate::error::OracleError;
use crate::note::NoteEvent;
use crate::segment::{GenerationRequest, Segment};
use crate::timing::StepTime;
use std::sync::Arc;
use std::time::Instant;

/// A generative model reachable through a single blocking call.
pub trait Oracle: Send + Sync {
    /// Generate a melody continuing `request.primer`.
    fn generate(&self, request: &GenerationRequest) -> Result<Vec<NoteEvent>, OracleError>;

    /// [`generate`](Self::generate), abandoned at `deadline`.
    ///
    /// The caller stops waiting at the deadline either way. Oracles that hold
    /// external resources during a call override this to release them.
    fn generate_until(&self, request: &GenerationRequest, deadline: Instant) -> Result<Vec<NoteEvent>, OracleError> {
        let _ = deadline;
        self.generate(request)
    }

    /// Name used in log messages.
    fn name(&self) -> &str {
        "oracle"
    }
}

impl<F> Oracle for F
where
    F: Fn(&GenerationRequest) -> Result<Vec<NoteEvent>, OracleError> + Send + Sync,
{
    fn generate(&self, request: &GenerationRequest) -> Result<Vec<NoteEvent>, OracleError> {
        self(request)
    }
}

/// Build the oracle described by a configuration entry.
pub fn build_oracle(kind: &OracleKind) -> Arc<dyn Oracle> {
    match kind {
        OracleKind::RandomWalk {
            seed,
            latency,
            failure_rate,
        } => Arc::new(RandomWalkOracle::new(*seed, *latency, *failure_rate)),
        OracleKind::Command { program, args } => Arc::new(CommandOracle::new(program.clone(), args.clone())),
    }
}

/// Wraps an [`Oracle`] and validates what it returns.
#[derive(Clone)]
pub struct OracleAdapter {
    oracle: Arc<dyn Oracle>,
}

impl OracleAdapter {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self { oracle }
    }

    /// The wrapped oracle.
    pub fn oracle(&self) -> Arc<dyn Oracle> {
        self.oracle.clone()
    }

    pub fn name(&self) -> &str {
        self.oracle.name()
    }

    /// Call the oracle and convert its answer into a segment.
    pub fn generate(&self, request: &GenerationRequest) -> Result<Segment, OracleError> {
        let raw = self.oracle.generate(request)?;
        into_segment(request, raw)
    }

    /// [`generate`](Self::generate) with a deadline passed to the oracle.
    pub fn generate_until(&self, request: &GenerationRequest, deadline: Instant) -> Result<Segment, OracleError> {
        let raw = self.oracle.generate_until(request, deadline)?;
        into_segment(request, raw)
    }
}

impl std::fmt::Debug for OracleAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleAdapter")
            .field("oracle", &self.oracle.name())
            .finish()
    }
}

/// Validate a raw melody and fit it into the requested step count.
///
/// Notes starting at or after the segment end are dropped and a note
/// crossing the end is shortened. Malformed notes or an empty result are
/// reported as [`OracleError::InvalidOutput`].
pub fn into_segment(request: &GenerationRequest, raw: Vec<NoteEvent>) -> Result<Segment, OracleError> {
    if let Some((index, reason)) = raw
        .iter()
        .enumerate()
        .find_map(|(i, n)| n.validate().map(|r| (i, r)))
    {
        return Err(OracleError::InvalidOutput(format!("note {index}: {reason}")));
    }

    let end = StepTime::from_steps(request.settings.step_count);
    let mut notes = Vec::with_capacity(raw.len());
    let mut onset = StepTime::ZERO;
    for mut note in raw {
        if onset >= end {
            break;
        }
        if onset + note.duration > end {
            note.duration = end - onset;
        }
        onset += note.duration;
        notes.push(note);
    }

    if notes.is_empty() {
        return Err(OracleError::InvalidOutput("empty melody".to_string()));
    }

    Ok(Segment::new(
        request.segment,
        notes,
        request.settings.step_count,
        request.primer.clone(),
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::segment::{GenerationSettings, SegmentId};

    pub(crate) fn request(step_count: u32) -> GenerationRequest {
        GenerationRequest {
            segment: SegmentId(1),
            slot: 0,
            attempt: 1,
            primer: vec![NoteEvent::note(60, StepTime::from_steps(1), 100)],
            settings: GenerationSettings {
                bundle: "test.mag".to_string(),
                step_count,
                temperature: 1.0,
            },
        }
    }

    #[test]
    fn test_closure_is_an_oracle() {
        let oracle = |req: &GenerationRequest| -> Result<Vec<NoteEvent>, OracleError> {
            Ok(vec![NoteEvent::note(64, StepTime::from_steps(req.settings.step_count), 90)])
        };
        let adapter = OracleAdapter::new(Arc::new(oracle));
        let seg = adapter.generate(&request(4)).unwrap();
        assert_eq!(seg.id(), SegmentId(1));
        assert_eq!(seg.notes().len(), 1);
        assert_eq!(seg.primer_used(), request(4).primer.as_slice());
    }

    #[test]
    fn test_overlong_output_is_trimmed() {
        let raw = vec![
            NoteEvent::note(60, StepTime::from_steps(3), 100),
            NoteEvent::note(62, StepTime::from_steps(3), 100),
            NoteEvent::note(64, StepTime::from_steps(3), 100),
        ];
        let seg = into_segment(&request(4), raw).unwrap();
        assert_eq!(seg.notes().len(), 2);
        assert_eq!(seg.notes()[1].duration, StepTime::from_steps(1));
        let total: StepTime = seg.notes().iter().map(|n| n.duration).sum();
        assert_eq!(total, StepTime::from_steps(4));
    }

    #[test]
    fn test_empty_output_is_invalid() {
        let err = into_segment(&request(4), Vec::new()).unwrap_err();
        assert_eq!(err.kind(), "OracleInvalidOutput");
    }

    #[test]
    fn test_malformed_note_is_invalid() {
        let raw = vec![NoteEvent::note(60, StepTime::ZERO, 100)];
        let err = into_segment(&request(4), raw).unwrap_err();
        assert!(matches!(err, OracleError::InvalidOutput(msg) if msg.contains("note 0")));
    }

    #[test]
    fn test_oracle_failure_passes_through() {
        let oracle = |_: &GenerationRequest| -> Result<Vec<NoteEvent>, OracleError> {
            Err(OracleError::Unavailable("model not loaded".into()))
        };
        let adapter = OracleAdapter::new(Arc::new(oracle));
        assert_eq!(
            adapter.generate(&request(4)).unwrap_err(),
            OracleError::Unavailable("model not loaded".into())
        );
    }
}
