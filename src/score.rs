// src/score.rs

//! The in-memory score model consumed by the renderer.
//!
//! The rendering core treats everything here as read-only: channels own
//! patterns, patterns own notes, and notes describe their envelope shape as
//! a list of pins. How this model is edited or persisted is the host's
//! business; the serde derives exist so hosts can round-trip songs as JSON.

use crate::config::{self, NOTE_SIZE_MAX};
use serde::{Deserialize, Serialize};

/// What a channel's notes mean.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// Notes are musical pitches rendered by a tonal generator.
    Pitch,
    /// Notes select playback rates of an aperiodic noise table.
    Noise,
    /// Notes carry automation values targeting other channels' settings.
    Mod,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Pitch => write!(f, "pitch"),
            ChannelKind::Noise => write!(f, "noise"),
            ChannelKind::Mod => write!(f, "mod"),
        }
    }
}

/// One breakpoint of a note's envelope: at `time` parts past the note
/// start, the note sounds `interval` semitones away from its base pitches
/// at size `size`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct NotePin {
    pub time: f64,
    pub interval: f64,
    pub size: f64,
}

impl NotePin {
    pub fn new(time: f64, interval: f64, size: f64) -> Self {
        Self {
            time,
            interval,
            size,
        }
    }
}

/// A note covers `start..end` in parts, absolute within its bar. Invariant:
/// at least two pins, pin times monotonic from 0 to `end - start`, sizes in
/// `0..=NOTE_SIZE_MAX`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Note {
    pub pitches: Vec<i32>,
    pub start: f64,
    pub end: f64,
    pub pins: Vec<NotePin>,
    /// True when this note seamlessly continues the same note from the end
    /// of the previous rendition of this pattern.
    pub continues_last_pattern: bool,
}

impl Note {
    /// A flat note: constant interval 0 at the given size.
    pub fn flat(pitches: Vec<i32>, start: f64, end: f64, size: f64) -> Self {
        Self {
            pitches,
            start,
            end,
            pins: vec![
                NotePin::new(0.0, 0.0, size),
                NotePin::new(end - start, 0.0, size),
            ],
            continues_last_pattern: false,
        }
    }

    /// A flat note at full size.
    pub fn simple(pitches: Vec<i32>, start: f64, end: f64) -> Self {
        Self::flat(pitches, start, end, NOTE_SIZE_MAX)
    }

    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    /// Interpolated (interval, size) at `time` parts past the note start.
    /// Clamped to the first/last pin outside the pin range.
    pub fn pin_values_at(&self, time: f64) -> (f64, f64) {
        debug_assert!(self.pins.len() >= 2);
        let first = &self.pins[0];
        if time <= first.time {
            return (first.interval, first.size);
        }
        for window in self.pins.windows(2) {
            let (a, b) = (&window[0], &window[1]);
            if time <= b.time {
                let span = b.time - a.time;
                if span <= 0.0 {
                    return (b.interval, b.size);
                }
                let ratio = (time - a.time) / span;
                return (
                    a.interval + (b.interval - a.interval) * ratio,
                    a.size + (b.size - a.size) * ratio,
                );
            }
        }
        let last = self.pins.last().unwrap();
        (last.interval, last.size)
    }

    /// The note's representative interval, used when a generator needs one
    /// fixed pitch for the whole note (drums, FM carrier selection). The
    /// longest flat pin segment wins; with no flat segment, the loudest
    /// pin's interval is used.
    pub fn main_interval(&self) -> f64 {
        let mut best_interval = None;
        let mut best_length = 0.0;
        for window in self.pins.windows(2) {
            let (a, b) = (&window[0], &window[1]);
            if a.interval == b.interval {
                let length = b.time - a.time;
                if length > best_length {
                    best_length = length;
                    best_interval = Some(a.interval);
                }
            }
        }
        match best_interval {
            Some(interval) => interval,
            None => {
                let mut loudest = &self.pins[0];
                for pin in &self.pins[1..] {
                    if pin.size > loudest.size {
                        loudest = pin;
                    }
                }
                loudest.interval
            }
        }
    }
}

/// One bar's worth of notes, playable by a subset of the channel's
/// instruments.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Pattern {
    pub instruments: Vec<usize>,
    pub notes: Vec<Note>,
}

impl Pattern {
    pub fn new(instruments: Vec<usize>, notes: Vec<Note>) -> Self {
        Self { instruments, notes }
    }
}

/// A channel: an ordered pattern library plus, per bar, which pattern
/// plays. A bar entry of 0 means silence; entry `i + 1` selects pattern
/// `i`, matching the score format this model mirrors.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Channel {
    pub kind: ChannelKind,
    /// Per-channel pitch offset, in octaves.
    pub octave: i32,
    pub instruments: Vec<crate::instrument::Instrument>,
    pub patterns: Vec<Pattern>,
    pub bars: Vec<usize>,
}

impl Channel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            octave: 0,
            instruments: Vec::new(),
            patterns: Vec::new(),
            bars: Vec::new(),
        }
    }

    pub fn pattern_index_at_bar(&self, bar: usize) -> Option<usize> {
        match self.bars.get(bar) {
            Some(&entry) if entry > 0 => Some(entry - 1),
            _ => None,
        }
    }

    pub fn pattern_at_bar(&self, bar: usize) -> Option<&Pattern> {
        self.pattern_index_at_bar(bar)
            .and_then(|index| self.patterns.get(index))
    }
}

/// The whole song. The renderer reads tempo and structure from here every
/// tick so a host (or the modulation bus) may change them between calls.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Song {
    pub channels: Vec<Channel>,
    pub tempo: f64,
    pub beats_per_bar: usize,
    pub bar_count: usize,
    pub loop_start: usize,
    pub loop_length: usize,
    /// Master gain slider, 0..=2 with 1 neutral.
    pub master_gain: f64,
    /// Key transposition in semitones applied to every pitched channel.
    pub key: i32,
}

impl Song {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            tempo: 120.0,
            beats_per_bar: 4,
            bar_count: 1,
            loop_start: 0,
            loop_length: 1,
            master_gain: 1.0,
            key: 0,
        }
    }

    pub fn parts_per_bar(&self) -> f64 {
        (self.beats_per_bar * config::PARTS_PER_BEAT) as f64
    }

    pub fn ticks_per_bar(&self) -> usize {
        self.beats_per_bar * config::TICKS_PER_BEAT
    }
}

impl Default for Song {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bent_note() -> Note {
        Note {
            pitches: vec![48],
            start: 0.0,
            end: 24.0,
            pins: vec![
                NotePin::new(0.0, 0.0, 3.0),
                NotePin::new(12.0, 4.0, 2.0),
                NotePin::new(24.0, 4.0, 0.0),
            ],
            continues_last_pattern: false,
        }
    }

    #[test]
    fn pin_interpolation_is_linear_between_breakpoints() {
        let note = bent_note();
        let (interval, size) = note.pin_values_at(6.0);
        assert!((interval - 2.0).abs() < 1e-12);
        assert!((size - 2.5).abs() < 1e-12);
        let (interval, size) = note.pin_values_at(18.0);
        assert!((interval - 4.0).abs() < 1e-12);
        assert!((size - 1.0).abs() < 1e-12);
    }

    #[test]
    fn pin_interpolation_clamps_outside_range() {
        let note = bent_note();
        assert_eq!(note.pin_values_at(-5.0), (0.0, 3.0));
        assert_eq!(note.pin_values_at(99.0), (4.0, 0.0));
    }

    #[test]
    fn main_interval_prefers_longest_flat_segment() {
        let note = bent_note();
        // The 12..24 segment is flat at interval 4.
        assert_eq!(note.main_interval(), 4.0);
    }

    #[test]
    fn main_interval_falls_back_to_loudest_pin() {
        let note = Note {
            pitches: vec![40],
            start: 0.0,
            end: 12.0,
            pins: vec![
                NotePin::new(0.0, 0.0, 1.0),
                NotePin::new(6.0, 2.0, 3.0),
                NotePin::new(12.0, 5.0, 0.5),
            ],
            continues_last_pattern: false,
        };
        assert_eq!(note.main_interval(), 2.0);
    }

    #[test]
    fn bar_entry_zero_is_silence() {
        let mut channel = Channel::new(ChannelKind::Pitch);
        channel.patterns.push(Pattern::default());
        channel.bars = vec![0, 1];
        assert!(channel.pattern_at_bar(0).is_none());
        assert!(channel.pattern_at_bar(1).is_some());
        assert!(channel.pattern_at_bar(7).is_none());
    }

    #[test]
    fn song_round_trips_through_json() {
        let mut song = Song::new();
        let mut channel = Channel::new(ChannelKind::Pitch);
        channel
            .patterns
            .push(Pattern::new(vec![0], vec![Note::simple(vec![48, 52], 0.0, 24.0)]));
        channel.bars = vec![1];
        channel
            .instruments
            .push(crate::instrument::Instrument::default());
        song.channels.push(channel);

        let json = serde_json::to_string(&song).unwrap();
        let back: Song = serde_json::from_str(&json).unwrap();
        assert_eq!(back.channels.len(), 1);
        assert_eq!(back.channels[0].patterns[0].notes[0].pitches, vec![48, 52]);
    }
}
