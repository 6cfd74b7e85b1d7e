//! Note events - the unit of melody exchanged with oracles and sinks.

use crate::timing::StepTime;
use serde::{Deserialize, Serialize};

/// Highest valid MIDI pitch and velocity.
pub const MIDI_MAX: u8 = 127;

/// Default velocity for generated notes.
pub const DEFAULT_VELOCITY: u8 = 100;

/// Pitch of a note event: a MIDI semitone or a rest.
///
/// Serialized as a MIDI number, or `null` for a rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<u8>", into = "Option<u8>")]
pub enum Pitch {
    /// A sounding MIDI note number.
    Note(u8),
    /// Silence for the event's duration.
    Rest,
}

impl Pitch {
    /// MIDI note number, if this is not a rest.
    pub fn midi(self) -> Option<u8> {
        match self {
            Pitch::Note(n) => Some(n),
            Pitch::Rest => None,
        }
    }

    /// Check if this is a rest.
    pub fn is_rest(self) -> bool {
        matches!(self, Pitch::Rest)
    }
}

impl From<Option<u8>> for Pitch {
    fn from(value: Option<u8>) -> Self {
        value.map_or(Pitch::Rest, Pitch::Note)
    }
}

impl From<Pitch> for Option<u8> {
    fn from(value: Pitch) -> Self {
        value.midi()
    }
}

/// One event of a melody.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub pitch: Pitch,
    /// Length in steps; always positive for validated events.
    pub duration: StepTime,
    /// MIDI velocity (0-127).
    #[serde(default = "default_velocity")]
    pub velocity: u8,
}

fn default_velocity() -> u8 {
    DEFAULT_VELOCITY
}

impl NoteEvent {
    /// A sounding note.
    pub fn note(pitch: u8, duration: StepTime, velocity: u8) -> Self {
        Self {
            pitch: Pitch::Note(pitch),
            duration,
            velocity,
        }
    }

    /// A rest.
    pub fn rest(duration: StepTime) -> Self {
        Self {
            pitch: Pitch::Rest,
            duration,
            velocity: 0,
        }
    }

    /// Describe why this event is malformed, if it is.
    pub fn validate(&self) -> Option<String> {
        if !self.duration.is_positive() {
            return Some(format!("non-positive duration {}", self.duration));
        }
        if let Pitch::Note(n) = self.pitch {
            if n > MIDI_MAX {
                return Some(format!("pitch {n} out of MIDI range"));
            }
        }
        if self.velocity > MIDI_MAX {
            return Some(format!("velocity {} out of MIDI range", self.velocity));
        }
        None
    }
}

/// Get the note name for a MIDI note number (e.g., 60 -> "C4")
pub fn note_name(pitch: Pitch) -> String {
    const NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    match pitch {
        Pitch::Note(n) => {
            let octave = (n / 12) as i32 - 1;
            format!("{}{}", NAMES[(n % 12) as usize], octave)
        }
        Pitch::Rest => "rest".to_string(),
    }
}
