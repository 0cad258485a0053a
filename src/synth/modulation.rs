// src/synth/modulation.rs

//! The modulation bus.
//!
//! Mod channels carry notes whose "pitch" selects a target slot and whose
//! pin sizes are raw automation values. Each tick the bus interpolates the
//! active value at the tick boundaries, converts it to the target's natural
//! unit and writes it into the value table. Everything that resolves
//! per-tick parameters consults the table in preference to static
//! settings; absence from the table means "no override". One-shot settings
//! (reset arpeggio, force next bar) are recorded as pending side effects
//! instead of continuous values.

use crate::instrument::{
    FilterModTarget, GeneratorKind, InstrumentModSetting, ModTarget, SongModSetting,
};
use crate::score::{ChannelKind, Song};
use std::collections::{HashMap, HashSet};

/// An override's value at the start and end of the current tick, already
/// converted to the target's natural unit. Pre-interpolated so expiry
/// never snaps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModValue {
    pub start: f64,
    pub end: f64,
}

/// The live override table. "Active" is signaled by presence; the table is
/// rebuilt every tick and cleared when playback stops.
#[derive(Default)]
pub struct ModValueTable {
    song: HashMap<SongModSetting, ModValue>,
    instrument: HashMap<(usize, usize, InstrumentModSetting), ModValue>,
    next_bar_requested: bool,
    arpeggio_resets: Vec<(usize, usize)>,
    warned_targets: HashSet<ModTarget>,
}

impl ModValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every override and pending side effect. Called when playback
    /// stops or seeks.
    pub fn clear(&mut self) {
        self.song.clear();
        self.instrument.clear();
        self.next_bar_requested = false;
        self.arpeggio_resets.clear();
    }

    /// Drops only the per-tick values, keeping the warned-target memory.
    fn clear_values(&mut self) {
        self.song.clear();
        self.instrument.clear();
    }

    pub fn song_value(&self, setting: SongModSetting) -> Option<ModValue> {
        self.song.get(&setting).copied()
    }

    pub fn instrument_value(
        &self,
        channel: usize,
        instrument: usize,
        setting: InstrumentModSetting,
    ) -> Option<ModValue> {
        self.instrument.get(&(channel, instrument, setting)).copied()
    }

    /// Override-or-default convenience for tick resolution.
    pub fn instrument_value_or(
        &self,
        channel: usize,
        instrument: usize,
        setting: InstrumentModSetting,
        default: f64,
    ) -> (f64, f64) {
        match self.instrument_value(channel, instrument, setting) {
            Some(value) => (value.start, value.end),
            None => (default, default),
        }
    }

    pub fn take_next_bar_request(&mut self) -> bool {
        std::mem::take(&mut self.next_bar_requested)
    }

    pub fn take_arpeggio_resets(&mut self) -> Vec<(usize, usize)> {
        std::mem::take(&mut self.arpeggio_resets)
    }
}

/// Converts a raw mod-note value (a pin size, non-negative) to the natural
/// unit of a song-level setting.
fn convert_song_value(setting: SongModSetting, raw: f64) -> f64 {
    match setting {
        SongModSetting::Tempo => raw.clamp(30.0, 500.0),
        SongModSetting::MasterGain => (raw * 0.01).clamp(0.0, 4.0),
        SongModSetting::NextBar => raw,
    }
}

/// Converts a raw mod-note value to an instrument setting's natural unit.
/// Raw values are non-negative, so bipolar settings are stored shifted.
fn convert_instrument_value(setting: InstrumentModSetting, raw: f64) -> f64 {
    match setting {
        // Raw 0..50 maps to slider -25..25.
        InstrumentModSetting::Volume => raw - 25.0,
        // Raw 0..200 maps to -1..1.
        InstrumentModSetting::Pan => (raw * 0.01 - 1.0).clamp(-1.0, 1.0),
        // Raw 0..100 maps to 0..1.
        InstrumentModSetting::PulseWidth
        | InstrumentModSetting::Distortion
        | InstrumentModSetting::BitcrusherFreq
        | InstrumentModSetting::BitcrusherQuantization
        | InstrumentModSetting::ChorusAmount
        | InstrumentModSetting::EchoSustain
        | InstrumentModSetting::ReverbAmount
        | InstrumentModSetting::VibratoDepth
        | InstrumentModSetting::StringSustain => (raw * 0.01).clamp(0.0, 1.0),
        // Raw 0..200 maps to -1..1 semitones.
        InstrumentModSetting::Detune => raw * 0.01 - 1.0,
        // Filter frequency in raw Hz; gain raw 0..200 maps to 0..2 linear.
        InstrumentModSetting::EqFilter(target) | InstrumentModSetting::NoteFilter(target) => {
            match target {
                FilterModTarget::WholeFilter => raw,
                FilterModTarget::ControlPoint { element, .. } => match element {
                    crate::instrument::FilterElement::Frequency => raw.clamp(10.0, 20000.0),
                    crate::instrument::FilterElement::Gain => (raw * 0.01).clamp(0.0, 4.0),
                },
            }
        }
        InstrumentModSetting::ResetArpeggio => raw,
    }
}

/// Whether a target can structurally apply to its destination. Invalid
/// targets are inert: detected here, skipped by the update pass.
pub fn target_is_valid(song: &Song, target: &ModTarget) -> bool {
    match target {
        ModTarget::None => false,
        ModTarget::Song(_) => true,
        ModTarget::Instrument {
            channel,
            instrument,
            setting,
        } => {
            let Some(chan) = song.channels.get(*channel) else {
                return false;
            };
            if chan.kind == ChannelKind::Mod {
                return false;
            }
            let Some(inst) = chan.instruments.get(*instrument) else {
                return false;
            };
            match setting {
                InstrumentModSetting::PulseWidth => {
                    matches!(inst.kind, GeneratorKind::PulseWidth)
                }
                InstrumentModSetting::StringSustain => {
                    matches!(inst.kind, GeneratorKind::PickedString)
                }
                InstrumentModSetting::Distortion => inst.effects.distortion.is_some(),
                InstrumentModSetting::BitcrusherFreq
                | InstrumentModSetting::BitcrusherQuantization => {
                    inst.effects.bitcrusher.is_some()
                }
                InstrumentModSetting::ChorusAmount => inst.effects.chorus.is_some(),
                InstrumentModSetting::EchoSustain => inst.effects.echo.is_some(),
                InstrumentModSetting::ReverbAmount => inst.effects.reverb.is_some(),
                InstrumentModSetting::EqFilter(target) => match target {
                    FilterModTarget::WholeFilter => !inst.eq_sub_filters.is_empty(),
                    FilterModTarget::ControlPoint { index, .. } => {
                        *index < inst.eq_filter.control_points.len()
                            || inst.eq_filter.simple.is_some() && *index == 0
                    }
                },
                InstrumentModSetting::NoteFilter(target) => match inst.note_filter.as_ref() {
                    None => false,
                    Some(filter) => match target {
                        FilterModTarget::WholeFilter => !inst.note_sub_filters.is_empty(),
                        FilterModTarget::ControlPoint { index, .. } => {
                            *index < filter.control_points.len()
                                || filter.simple.is_some() && *index == 0
                        }
                    },
                },
                InstrumentModSetting::ResetArpeggio => {
                    matches!(inst.chord, crate::instrument::ChordPolicy::Arpeggio)
                }
                _ => true,
            }
        }
    }
}

/// Evaluates every mod channel at the current transport position and
/// rewrites the value table for this tick. `part_start`/`part_end` are the
/// positions of the tick boundaries in parts within `bar`.
pub fn tick_update(
    song: &Song,
    table: &mut ModValueTable,
    bar: usize,
    part_start: f64,
    part_end: f64,
) {
    table.clear_values();

    for channel in &song.channels {
        if channel.kind != ChannelKind::Mod {
            continue;
        }
        let Some(pattern) = channel.pattern_at_bar(bar) else {
            continue;
        };
        let instrument_index = pattern.instruments.first().copied().unwrap_or(0);
        let Some(instrument) = channel.instruments.get(instrument_index) else {
            continue;
        };

        for note in &pattern.notes {
            // A mod note is active for the tick when it overlaps the tick
            // start; a note that begins inside the tick fires its one-shot
            // effects but contributes values from the next tick on.
            let starts_this_tick = note.start >= part_start && note.start < part_end;
            let covers_tick = note.start <= part_start && note.end > part_start;
            if !starts_this_tick && !covers_tick {
                continue;
            }

            let slot = note.pitches.first().copied().unwrap_or(0) as usize;
            let Some(&target) = instrument.mod_targets.get(slot) else {
                continue;
            };
            if !target_is_valid(song, &target) {
                if !matches!(target, ModTarget::None) && table.warned_targets.insert(target) {
                    log::warn!("modulation target {:?} is structurally invalid; skipping", target);
                }
                continue;
            }

            let (raw_start, _) = pin_raw_value(note, part_start);
            let (raw_end, _) = pin_raw_value(note, part_end.min(note.end));

            match target {
                ModTarget::None => {}
                ModTarget::Song(setting) => match setting {
                    SongModSetting::NextBar => {
                        if starts_this_tick {
                            table.next_bar_requested = true;
                        }
                    }
                    _ => {
                        if covers_tick {
                            table.song.insert(
                                setting,
                                ModValue {
                                    start: convert_song_value(setting, raw_start),
                                    end: convert_song_value(setting, raw_end),
                                },
                            );
                        }
                    }
                },
                ModTarget::Instrument {
                    channel: target_channel,
                    instrument: target_instrument,
                    setting,
                } => match setting {
                    InstrumentModSetting::ResetArpeggio => {
                        if starts_this_tick {
                            table.arpeggio_resets.push((target_channel, target_instrument));
                        }
                    }
                    _ => {
                        if covers_tick {
                            table.instrument.insert(
                                (target_channel, target_instrument, setting),
                                ModValue {
                                    start: convert_instrument_value(setting, raw_start),
                                    end: convert_instrument_value(setting, raw_end),
                                },
                            );
                        }
                    }
                },
            }
        }
    }
}

fn pin_raw_value(note: &crate::score::Note, part: f64) -> (f64, f64) {
    let (interval, size) = note.pin_values_at(part - note.start);
    (size, interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{FilterElement, Instrument};
    use crate::score::{Channel, Note, NotePin, Pattern};

    fn song_with_mod(targets: Vec<ModTarget>, notes: Vec<Note>) -> Song {
        let mut song = Song::new();

        let mut pitch_channel = Channel::new(ChannelKind::Pitch);
        let mut pitched = Instrument::chip(0);
        pitched.effects.reverb = Some(0.5);
        pitch_channel.instruments.push(pitched);
        pitch_channel.patterns.push(Pattern::new(vec![0], Vec::new()));
        pitch_channel.bars = vec![1];
        song.channels.push(pitch_channel);

        let mut mod_channel = Channel::new(ChannelKind::Mod);
        mod_channel.instruments.push(Instrument::modulator(targets));
        mod_channel.patterns.push(Pattern::new(vec![0], notes));
        mod_channel.bars = vec![1];
        song.channels.push(mod_channel);

        song
    }

    fn mod_note(slot: i32, start: f64, end: f64, value_start: f64, value_end: f64) -> Note {
        Note {
            pitches: vec![slot],
            start,
            end,
            pins: vec![
                NotePin::new(0.0, 0.0, value_start),
                NotePin::new(end - start, 0.0, value_end),
            ],
            continues_last_pattern: false,
        }
    }

    #[test]
    fn tempo_override_interpolates_between_tick_boundaries() {
        let song = song_with_mod(
            vec![ModTarget::Song(SongModSetting::Tempo)],
            vec![mod_note(0, 0.0, 48.0, 120.0, 60.0)],
        );
        let mut table = ModValueTable::new();
        tick_update(&song, &mut table, 0, 24.0, 24.5);
        let value = table.song_value(SongModSetting::Tempo).unwrap();
        assert!((value.start - 90.0).abs() < 1e-9, "start {}", value.start);
        assert!(value.end < value.start);
    }

    #[test]
    fn override_absent_outside_note_range() {
        let song = song_with_mod(
            vec![ModTarget::Song(SongModSetting::Tempo)],
            vec![mod_note(0, 0.0, 24.0, 90.0, 90.0)],
        );
        let mut table = ModValueTable::new();
        tick_update(&song, &mut table, 0, 30.0, 30.5);
        assert!(table.song_value(SongModSetting::Tempo).is_none());
    }

    #[test]
    fn volume_override_wins_and_converts_units() {
        let target = ModTarget::Instrument {
            channel: 0,
            instrument: 0,
            setting: InstrumentModSetting::Volume,
        };
        let song = song_with_mod(vec![target], vec![mod_note(0, 0.0, 48.0, 35.0, 35.0)]);
        let mut table = ModValueTable::new();
        tick_update(&song, &mut table, 0, 0.0, 0.5);
        let (start, end) =
            table.instrument_value_or(0, 0, InstrumentModSetting::Volume, 0.0);
        assert!((start - 10.0).abs() < 1e-9);
        assert_eq!(start, end);
    }

    #[test]
    fn structurally_invalid_target_is_inert() {
        // Pulse-width modulation aimed at a chip instrument never lands.
        let target = ModTarget::Instrument {
            channel: 0,
            instrument: 0,
            setting: InstrumentModSetting::PulseWidth,
        };
        let song = song_with_mod(vec![target], vec![mod_note(0, 0.0, 48.0, 50.0, 50.0)]);
        let mut table = ModValueTable::new();
        tick_update(&song, &mut table, 0, 0.0, 0.5);
        assert!(table
            .instrument_value(0, 0, InstrumentModSetting::PulseWidth)
            .is_none());
    }

    #[test]
    fn filter_control_point_target_requires_existing_point() {
        let bad = ModTarget::Instrument {
            channel: 0,
            instrument: 0,
            setting: InstrumentModSetting::EqFilter(FilterModTarget::ControlPoint {
                index: 3,
                element: FilterElement::Frequency,
            }),
        };
        let song = song_with_mod(vec![bad], Vec::new());
        assert!(!target_is_valid(&song, &bad));
    }

    #[test]
    fn next_bar_fires_once_when_note_starts() {
        let song = song_with_mod(
            vec![ModTarget::Song(SongModSetting::NextBar)],
            vec![mod_note(0, 12.0, 13.0, 1.0, 1.0)],
        );
        let mut table = ModValueTable::new();
        tick_update(&song, &mut table, 0, 12.0, 12.5);
        assert!(table.take_next_bar_request());
        assert!(!table.take_next_bar_request(), "request is one-shot");
        tick_update(&song, &mut table, 0, 12.5, 13.0);
        assert!(!table.take_next_bar_request());
    }

    #[test]
    fn clear_empties_everything() {
        let song = song_with_mod(
            vec![ModTarget::Song(SongModSetting::MasterGain)],
            vec![mod_note(0, 0.0, 48.0, 100.0, 100.0)],
        );
        let mut table = ModValueTable::new();
        tick_update(&song, &mut table, 0, 0.0, 0.5);
        assert!(table.song_value(SongModSetting::MasterGain).is_some());
        table.clear();
        assert!(table.song_value(SongModSetting::MasterGain).is_none());
    }
}
