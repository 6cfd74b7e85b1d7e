//! Harmonizer - fits played notes onto a chord progression.
//!
//! A [`Harmony`] is built from the `[harmony]` table: a major key and a list
//! of song parts, each a run of Roman numeral chords. Every chord lasts
//! `steps_per_chord` steps and the parts repeat from the top.
//!
//! Fitting remaps rather than snaps. The pitch space is rebuilt from the
//! current chord tones and the key's scale tones, and each input semitone
//! moves one entry through that list, pivoting middle C onto the first tone
//! from C3 up. The contour of the line survives while every pitch lands on a
//! chord or scale tone.
//!
//! [`HarmonizerSink`] applies this to the live performance.

use crate::config::HarmonySettings;
use crate::error::{Error, Result, SinkError};
use crate::note::{note_name, NoteEvent, Pitch};
use crate::segment::Segment;
use crate::sink::{NoteSink, ScheduledNote};
use crate::timing::StepTime;
use std::collections::BTreeSet;

/// Semitone offsets of the major scale.
pub const MAJOR_SCALE: [i32; 7] = [0, 2, 4, 5, 7, 9, 11];

const NUMERALS: [&str; 7] = ["I", "II", "III", "IV", "V", "VI", "VII"];

/// Octaves below this index hold the tones that notes under the pivot map to.
const SPLIT_OCTAVE: i32 = 4;
const OCTAVES: i32 = 11;
/// Input notes are lifted by three octaves before fitting.
const LIFT: i32 = 36;
/// Lifted pitch of the note that maps onto the first upper tone.
const PIVOT: i32 = 96;

/// Pitch class of a key name such as `"C"`, `"F#"` or `"Bb"`.
pub fn parse_key(name: &str) -> Result<i32> {
    let bad = || Error::Config(format!("unknown key '{name}'"));
    let mut chars = name.trim().chars();
    let base: i32 = match chars.next().map(|c| c.to_ascii_uppercase()) {
        Some('C') => 0,
        Some('D') => 2,
        Some('E') => 4,
        Some('F') => 5,
        Some('G') => 7,
        Some('A') => 9,
        Some('B') => 11,
        _ => return Err(bad()),
    };
    let shift = match chars.as_str() {
        "" => 0,
        "#" => 1,
        "b" => -1,
        _ => return Err(bad()),
    };
    Ok((base + shift).rem_euclid(12))
}

/// One chord of a progression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chord {
    pub symbol: String,
    /// Semitones above the C at or below the root, root first. The root is
    /// always below 12; upper tones may run past the octave.
    pub tones: Vec<i32>,
}

impl Chord {
    /// Parse a Roman numeral in the major key whose tonic is `key`.
    ///
    /// The numeral picks the scale degree and the chord is stacked in thirds
    /// from the scale, so `ii` and `II` are the same minor chord in a major
    /// key. Suffixes: `7` adds the diatonic seventh, `dim` and `aug` force
    /// that triad on the degree's root.
    pub fn parse(symbol: &str, key: i32) -> Result<Self> {
        let bad = || Error::Config(format!("unknown chord '{symbol}'"));
        let trimmed = symbol.trim();
        let split = trimmed
            .find(|c: char| !matches!(c, 'I' | 'V' | 'i' | 'v'))
            .unwrap_or(trimmed.len());
        let (numeral, suffix) = trimmed.split_at(split);
        let degree = NUMERALS
            .iter()
            .position(|n| n.eq_ignore_ascii_case(numeral))
            .ok_or_else(bad)?;

        let stacked = |count: usize| -> Vec<i32> {
            (0..count)
                .map(|k| {
                    let step = degree + 2 * k;
                    MAJOR_SCALE[step % 7] + 12 * (step / 7) as i32
                })
                .collect()
        };
        let root = MAJOR_SCALE[degree];
        let mut tones = match suffix {
            "" => stacked(3),
            "7" => stacked(4),
            "dim" => vec![root, root + 3, root + 6],
            "aug" => vec![root, root + 4, root + 8],
            _ => return Err(bad()),
        };

        let octave = 12 * (key + root).div_euclid(12);
        for tone in &mut tones {
            *tone += key - octave;
        }
        Ok(Self {
            symbol: trimmed.to_string(),
            tones,
        })
    }

    /// Pitch classes of the chord.
    pub fn pitch_classes(&self) -> BTreeSet<i32> {
        self.tones.iter().map(|t| t.rem_euclid(12)).collect()
    }
}

/// Precomputed target pitches for one chord.
#[derive(Debug, Clone)]
struct FitTable {
    /// Tones in the low octaves, ascending. Notes under the pivot count down
    /// from the top of this list.
    below: Vec<i32>,
    /// Tones from the split octave up, ascending.
    above: Vec<i32>,
}

impl FitTable {
    fn new(chord: &[i32], scale: &[i32]) -> Self {
        let collect = |octaves: std::ops::Range<i32>| -> Vec<i32> {
            let tones: BTreeSet<i32> = octaves
                .flat_map(|o| chord.iter().chain(scale).map(move |t| t + 12 * o))
                .collect();
            tones.into_iter().collect()
        };
        Self {
            below: collect(0..SPLIT_OCTAVE),
            above: collect(SPLIT_OCTAVE..OCTAVES),
        }
    }

    fn fit(&self, note: u8) -> u8 {
        let below = self.below.len() as i32;
        let above = self.above.len() as i32;
        if below == 0 || above == 0 {
            return note;
        }
        let diff = (note as i32 + LIFT - PIVOT).clamp(-below, above - 1);
        let fitted = if diff < 0 {
            self.below[(below + diff) as usize]
        } else {
            self.above[diff as usize]
        };
        fitted.clamp(0, 127) as u8
    }
}

/// Fit one MIDI note onto `chord` plus `scale`.
///
/// Both are semitone offsets from C; values past 11 reach into the next
/// octave.
pub fn fit_note(note: u8, chord: &[i32], scale: &[i32]) -> u8 {
    FitTable::new(chord, scale).fit(note)
}

#[derive(Debug, Clone)]
struct PlacedChord {
    part: String,
    chord: Chord,
    table: FitTable,
}

/// A key and its song parts, ready to fit notes.
#[derive(Debug, Clone)]
pub struct Harmony {
    key: i32,
    steps_per_chord: StepTime,
    chords: Vec<PlacedChord>,
    /// Used when no part carries a chord.
    scale_only: FitTable,
}

impl Harmony {
    pub fn from_settings(settings: &HarmonySettings) -> Result<Self> {
        if settings.steps_per_chord == 0 {
            return Err(Error::Config("harmony.steps_per_chord must be positive".to_string()));
        }
        let key = parse_key(&settings.key)?;
        let scale: Vec<i32> = MAJOR_SCALE.iter().map(|s| s + key).collect();

        let mut chords = Vec::new();
        for part in &settings.parts {
            for symbol in &part.chords {
                let chord = Chord::parse(symbol, key)?;
                let table = FitTable::new(&chord.tones, &scale);
                chords.push(PlacedChord {
                    part: part.name.clone(),
                    chord,
                    table,
                });
            }
        }

        Ok(Self {
            key,
            steps_per_chord: StepTime::from_steps(settings.steps_per_chord),
            chords,
            scale_only: FitTable::new(&[], &scale),
        })
    }

    /// Pitch class of the tonic.
    pub fn key(&self) -> i32 {
        self.key
    }

    /// Number of chords across all parts.
    pub fn len(&self) -> usize {
        self.chords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chords.is_empty()
    }

    fn index_at(&self, position: StepTime) -> Option<usize> {
        if self.chords.is_empty() {
            return None;
        }
        let bar = position.ticks().div_euclid(self.steps_per_chord.ticks());
        Some(bar.rem_euclid(self.chords.len() as i64) as usize)
    }

    /// The part name and chord sounding at `position` on the timeline.
    pub fn chord_at(&self, position: StepTime) -> Option<(&str, &Chord)> {
        self.index_at(position)
            .map(|i| (self.chords[i].part.as_str(), &self.chords[i].chord))
    }

    /// Fit a pitch played at `position`. Rests pass through.
    pub fn fit(&self, pitch: Pitch, position: StepTime) -> Pitch {
        match pitch {
            Pitch::Note(note) => {
                let table = match self.index_at(position) {
                    Some(i) => &self.chords[i].table,
                    None => &self.scale_only,
                };
                Pitch::Note(table.fit(note))
            }
            Pitch::Rest => Pitch::Rest,
        }
    }

    /// Fit a run of events whose first onset is `origin`.
    pub fn fit_events(&self, origin: StepTime, notes: &[NoteEvent]) -> Vec<NoteEvent> {
        let mut onset = origin;
        notes
            .iter()
            .map(|note| {
                let fitted = NoteEvent {
                    pitch: self.fit(note.pitch, onset),
                    ..note.clone()
                };
                onset += note.duration;
                fitted
            })
            .collect()
    }

    /// Fit segments laid back to back from step zero.
    pub fn fit_segments(&self, segments: &[Segment]) -> Vec<Segment> {
        let mut origin = StepTime::ZERO;
        segments
            .iter()
            .map(|segment| {
                let notes = self.fit_events(origin, segment.notes());
                origin += segment.len_steps();
                Segment::new(segment.id(), notes, segment.step_count(), segment.primer_used().to_vec())
            })
            .collect()
    }
}

/// Sink wrapper that fits every note onto the progression before passing
/// it on.
pub struct HarmonizerSink<S: NoteSink> {
    inner: S,
    harmony: Harmony,
    current: Option<usize>,
}

impl<S: NoteSink> HarmonizerSink<S> {
    pub fn new(inner: S, harmony: Harmony) -> Self {
        Self {
            inner,
            harmony,
            current: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: NoteSink> NoteSink for HarmonizerSink<S> {
    fn play(&mut self, note: &ScheduledNote) -> std::result::Result<(), SinkError> {
        let index = self.harmony.index_at(note.position);
        if index != self.current {
            if let Some((part, chord)) = self.harmony.chord_at(note.position) {
                log::debug!("[HARMONY] {} at step {:.2}: {}", part, note.position.to_float(), chord.symbol);
            }
            self.current = index;
        }

        let pitch = self.harmony.fit(note.note.pitch, note.position);
        if pitch == note.note.pitch {
            return self.inner.play(note);
        }
        log::trace!(
            "[HARMONY] {} -> {}",
            note_name(note.note.pitch),
            note_name(pitch)
        );
        let mut fitted = note.clone();
        fitted.note.pitch = pitch;
        self.inner.play(&fitted)
    }

    fn silence(&mut self) {
        self.current = None;
        self.inner.silence();
    }

    fn finish(&mut self) -> std::result::Result<(), SinkError> {
        self.inner.finish()
    }
}
