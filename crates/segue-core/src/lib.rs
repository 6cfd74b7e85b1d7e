//! segue-core - continuous generated-melody pipeline
//!
//! Keeps a generative model one step ahead of playback so machine-generated
//! melody plays as one seamless performance:
//!
//! - A [`LookaheadBuffer`] of D slots is kept filled by a [`GenerationPool`]
//! - Each request is primed with the tail of the previous segment
//! - A [`PlaybackScheduler`] thread plays segments gaplessly against an
//!   absolute clock anchor and absorbs late segments
//! - A [`TransportController`] takes console commands and reports status
//!
//! The model itself is an opaque [`Oracle`]: anything that turns a primer and
//! settings into a list of [`NoteEvent`]s.
//!
//! # Usage
//!
//! ```no_run
//! use segue_core::{LogSink, PipelineConfig, TransportCommand, TransportController};
//!
//! let config = PipelineConfig::default();
//! let mut transport = TransportController::from_config(config, Box::new(LogSink))?;
//! transport.dispatch(TransportCommand::Start)?;
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! println!("{:?}", transport.status());
//! transport.shutdown();
//! # Ok::<(), segue_core::Error>(())
//! ```

pub mod batch;
pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod harmony;
pub mod note;
pub mod oracle;
pub mod pool;
pub mod primer;
pub mod recorder;
pub mod scheduler;
pub mod segment;
pub mod sink;
pub mod status;
pub mod timing;
pub mod transport;

// Re-export main types
pub use batch::{generate_batch, write_midi};
pub use buffer::{BufferConfig, BufferSnapshot, GenerationJob, LookaheadBuffer, SlotView};
pub use config::{
    clamp_temperature, default_config_toml, HarmonySettings, OracleKind, PipelineConfig, RetryPolicy,
    SongPart, MAX_TEMPERATURE, MIN_TEMPERATURE,
};
pub use error::{Error, OracleError, Result, SinkError};
pub use events::{EventSink, PipelineEvent, PlaybackStatus};
pub use harmony::{fit_note, Chord, Harmony, HarmonizerSink};
pub use note::{note_name, NoteEvent, Pitch};
pub use oracle::{build_oracle, CommandOracle, Oracle, OracleAdapter, RandomWalkOracle};
pub use pool::{GenerationPool, SharedTimeout};
pub use recorder::MidiRecorder;
pub use scheduler::{PlaybackCommand, PlaybackScheduler, SchedulerConfig};
pub use segment::{GenerationRequest, GenerationSettings, Segment, SegmentId};
pub use sink::{ChannelSink, FanoutSink, LogSink, NoteSink, ScheduledNote, SinkMessage};
pub use status::{PlaybackState, StatusBoard};
pub use timing::{PlaybackClock, StepTime};
pub use transport::{TransportCommand, TransportController, TransportStatus};
