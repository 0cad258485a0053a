// src/synth/scheduler.rs

//! The tone scheduler: maps the score's currently-sounding notes onto the
//! bounded set of pooled tones, once per tick.
//!
//! For each instrument the scheduler matches overlapping notes against the
//! tones that sounded last tick: a tone whose note runs into an adjacent
//! note is carried over seamlessly when the instrument's transition allows
//! it, matching pitch sets exactly across bar boundaries; everything else
//! is released (kept fading) or interrupted. Chord policies decide how many
//! tones a note needs; live input bypasses the score and re-matches voices
//! by nearest pitch to minimize audible jumps.

use crate::instrument::{ChordPolicy, Transition};
use crate::score::{ChannelKind, Note, Song};
use crate::synth::tone::{ToneHandle, TonePool};
use anyhow::{bail, Result};

/// Released tones beyond this count are fast-faded to relieve polyphony
/// pressure.
pub const MAX_RELEASED_TONES: usize = 8;

/// The per-(channel, instrument) voice lists.
#[derive(Default)]
pub struct InstrumentVoices {
    /// Tones sounding this tick, in chord-slot order.
    pub active: Vec<ToneHandle>,
    /// Tones matched from live (real-time) input rather than the score.
    pub live_active: Vec<ToneHandle>,
    /// Tones fading out; addressable until their fade completes.
    pub released: Vec<ToneHandle>,
}

/// Currently-held real-time input.
#[derive(Clone, Debug, Default)]
pub struct LiveInput {
    pub channel: usize,
    pub instrument: usize,
    pub pitches: Vec<i32>,
}

/// What one tone of a chord should play this tick.
struct DesiredTone {
    pitches: Vec<i32>,
    chord_size: usize,
}

fn desired_tones(note: &Note, policy: ChordPolicy, strum_parts: f64, part: f64) -> Vec<DesiredTone> {
    let pitch_count = note.pitches.len().max(1);
    match policy {
        ChordPolicy::Simultaneous => note
            .pitches
            .iter()
            .map(|&pitch| DesiredTone {
                pitches: vec![pitch],
                chord_size: pitch_count,
            })
            .collect(),
        ChordPolicy::Strum => {
            let elapsed = part - note.start;
            note.pitches
                .iter()
                .enumerate()
                .filter(|(i, _)| elapsed >= *i as f64 * strum_parts.max(0.0))
                .map(|(_, &pitch)| DesiredTone {
                    pitches: vec![pitch],
                    chord_size: pitch_count,
                })
                .collect()
        }
        ChordPolicy::Arpeggio => vec![DesiredTone {
            pitches: note.pitches.clone(),
            chord_size: 1,
        }],
        ChordPolicy::CustomInterval => {
            let mut tones = vec![DesiredTone {
                pitches: vec![note.pitches[0]],
                chord_size: note.pitches.len().min(2),
            }];
            if note.pitches.len() > 1 {
                tones.push(DesiredTone {
                    pitches: vec![note.pitches[1]],
                    chord_size: 2,
                });
            }
            tones
        }
    }
}

/// The note covering `part`, plus its immediate neighbors (a neighbor
/// shares a boundary exactly).
fn find_note_at<'a>(
    notes: &'a [Note],
    part: f64,
) -> (Option<&'a Note>, Option<&'a Note>, Option<&'a Note>) {
    let mut current = None;
    for note in notes {
        if note.start <= part && part < note.end {
            current = Some(note);
            break;
        }
    }
    let mut prev = None;
    let mut next = None;
    if let Some(note) = current {
        for other in notes {
            if other.end == note.start {
                prev = Some(other);
            }
            if other.start == note.end {
                next = Some(other);
            }
        }
    }
    (current, prev, next)
}

/// Whether the outgoing note's final sounding pitches equal the incoming
/// note's initial sounding pitches, interval bends included.
fn pitch_sets_match(outgoing: &Note, incoming: &Note) -> bool {
    if outgoing.pitches.len() != incoming.pitches.len() {
        return false;
    }
    let end_interval = outgoing.pins.last().map(|pin| pin.interval).unwrap_or(0.0);
    let start_interval = incoming.pins.first().map(|pin| pin.interval).unwrap_or(0.0);
    outgoing
        .pitches
        .iter()
        .zip(incoming.pitches.iter())
        .all(|(a, b)| (*a as f64 + end_interval - (*b as f64 + start_interval)).abs() < 1e-9)
}

/// Moves a tone from the active list into the fading list. `interrupt`
/// fast-fades it within one tick instead of the instrument's fade-out.
fn release_tone(pool: &mut TonePool, voices: &mut InstrumentVoices, handle: ToneHandle, interrupt: bool) {
    if let Some(tone) = pool.get_mut(handle) {
        tone.released = true;
        tone.ticks_since_released = 0;
        tone.is_on_last_tick = interrupt;
        voices.released.push(handle);
    }
}

/// Determines the exact set of tones for one channel this tick. `part` is
/// the transport position in parts within `bar` at the tick start. With
/// `include_score` false (transport paused or ended) scored notes are
/// treated as absent, so their tones release, while live input still
/// triggers.
pub fn determine_tones_for_channel(
    song: &Song,
    channel_index: usize,
    bar: usize,
    part: f64,
    include_score: bool,
    pool: &mut TonePool,
    voices: &mut [InstrumentVoices],
    live: Option<&LiveInput>,
) -> Result<()> {
    let channel = &song.channels[channel_index];
    if channel.kind == ChannelKind::Mod {
        return Ok(());
    }

    let pattern = if include_score {
        channel.pattern_at_bar(bar)
    } else {
        None
    };
    let scored_instruments: Vec<usize> = match pattern {
        Some(pattern) => {
            for &index in &pattern.instruments {
                if index >= channel.instruments.len() {
                    bail!(
                        "channel {} pattern references instrument {} but only {} exist",
                        channel_index,
                        index,
                        channel.instruments.len()
                    );
                }
            }
            pattern.instruments.clone()
        }
        None => Vec::new(),
    };

    for instrument_index in 0..channel.instruments.len() {
        let instrument = &channel.instruments[instrument_index];
        let plays_pattern = scored_instruments.contains(&instrument_index);
        let notes: &[Note] = match (plays_pattern, pattern) {
            (true, Some(pattern)) => &pattern.notes,
            _ => &[],
        };
        let (current, prev, next) = find_note_at(notes, part);

        let instrument_voices = &mut voices[instrument_index];

        match current {
            None => {
                // Nothing sounding: release everything still active.
                let actives = std::mem::take(&mut instrument_voices.active);
                let interrupt = instrument.transition == Transition::Interrupt;
                for handle in actives {
                    release_tone(pool, instrument_voices, handle, interrupt);
                }
            }
            Some(note) => {
                let desired = desired_tones(note, instrument.chord, instrument.strum_parts, part);
                let mut previous_actives = std::mem::take(&mut instrument_voices.active);

                for (slot, want) in desired.iter().enumerate() {
                    // 1. A tone already playing this exact note keeps going.
                    let same_note = previous_actives.iter().position(|&handle| {
                        pool.get(handle).is_some_and(|tone| {
                            tone.note_bar == bar
                                && tone
                                    .note
                                    .as_ref()
                                    .is_some_and(|n| n.start == note.start)
                                && tone.pitches[..tone.pitch_count]
                                    == want.pitches[..want.pitches.len().min(tone.pitch_count)]
                                    && tone.pitch_count == want.pitches.len()
                        })
                    });
                    if let Some(index) = same_note {
                        let handle = previous_actives.remove(index);
                        instrument_voices.active.push(handle);
                        continue;
                    }

                    // 2. Seamless carry-over from the adjacent note, or
                    //    across the bar boundary when pitch sets match
                    //    exactly.
                    let handle = if instrument.transition.is_seamless() {
                        let carry = previous_actives.iter().position(|&handle| {
                            pool.get(handle).is_some_and(|tone| {
                                let from_prev_note = prev.is_some_and(|p| {
                                    tone.note_bar == bar
                                        && tone.note.as_ref().is_some_and(|n| n.start == p.start)
                                });
                                let across_bar = note.start == 0.0
                                    && tone.note_bar + 1 == bar
                                    && tone
                                        .note
                                        .as_ref()
                                        .is_some_and(|n| pitch_sets_match(n, note));
                                let continues = note.continues_last_pattern
                                    && note.start == 0.0
                                    && tone.note_bar < bar;
                                from_prev_note || across_bar || continues
                            })
                        });
                        carry.map(|index| previous_actives.remove(index))
                    } else {
                        None
                    };

                    let handle = match handle {
                        Some(handle) => {
                            if let Some(tone) = pool.get_mut(handle) {
                                tone.advance_to_note(note.clone());
                                tone.note_bar = bar;
                                tone.force_continue_at_start = true;
                            }
                            handle
                        }
                        None => {
                            // 3. Fresh attack. Under Interrupt the previous
                            //    occupant of this slot dies fast.
                            if slot < previous_actives.len() {
                                let old = previous_actives.remove(slot);
                                release_tone(
                                    pool,
                                    instrument_voices,
                                    old,
                                    instrument.transition == Transition::Interrupt,
                                );
                            }
                            let handle = pool.allocate();
                            let tone = pool.get_mut(handle).expect("freshly allocated");
                            tone.note = Some(note.clone());
                            tone.prev_note = prev.cloned();
                            tone.note_bar = bar;
                            handle
                        }
                    };

                    if let Some(tone) = pool.get_mut(handle) {
                        tone.instrument_index = instrument_index;
                        tone.pitch_count = want.pitches.len().min(tone.pitches.len());
                        tone.pitches[..tone.pitch_count]
                            .copy_from_slice(&want.pitches[..tone.pitch_count]);
                        tone.chord_size = want.chord_size;
                        tone.next_note = next.cloned();
                        // A seamless upcoming boundary suppresses this
                        // note's release fade.
                        tone.force_continue_at_end =
                            next.is_some() && instrument.transition.is_seamless();
                    }
                    instrument_voices.active.push(handle);
                }

                // Leftover actives have no slot this tick.
                let interrupt = instrument.transition == Transition::Interrupt;
                for handle in previous_actives {
                    release_tone(pool, instrument_voices, handle, interrupt);
                }
            }
        }

        // --- Live input, matched by nearest previous pitch ---
        let live_pitches: &[i32] = match live {
            Some(input) if input.channel == channel_index && input.instrument == instrument_index => {
                &input.pitches
            }
            _ => &[],
        };
        let mut previous_live = std::mem::take(&mut instrument_voices.live_active);
        for &pitch in live_pitches {
            let nearest = previous_live
                .iter()
                .enumerate()
                .filter_map(|(i, &handle)| {
                    pool.get(handle).map(|tone| (i, (tone.pitches[0] - pitch).abs()))
                })
                .min_by_key(|&(_, distance)| distance)
                .map(|(i, _)| i);
            let handle = match nearest {
                Some(index) => previous_live.remove(index),
                None => {
                    let handle = pool.allocate();
                    let tone = pool.get_mut(handle).expect("freshly allocated");
                    tone.live_input = true;
                    tone.instrument_index = instrument_index;
                    handle
                }
            };
            if let Some(tone) = pool.get_mut(handle) {
                tone.pitches[0] = pitch;
                tone.pitch_count = 1;
                tone.chord_size = live_pitches.len().max(1);
            }
            instrument_voices.live_active.push(handle);
        }
        for handle in previous_live {
            release_tone(pool, instrument_voices, handle, false);
        }
    }

    Ok(())
}

/// Ages every fading tone by one tick, recycling those whose fade-out has
/// completed and fast-fading the overflow under polyphony pressure.
pub fn advance_released_tones(
    pool: &mut TonePool,
    voices: &mut InstrumentVoices,
    fade_out_ticks: i32,
) {
    let fade_ticks = fade_out_ticks.abs().max(1);
    let mut index = 0;
    while index < voices.released.len() {
        let handle = voices.released[index];
        let done = match pool.get_mut(handle) {
            None => true,
            Some(tone) => {
                tone.ticks_since_released += 1;
                tone.is_on_last_tick =
                    tone.is_on_last_tick || tone.ticks_since_released >= fade_ticks;
                tone.ticks_since_released > fade_ticks
            }
        };
        if done {
            voices.released.swap_remove(index);
            pool.free(handle);
        } else {
            index += 1;
        }
    }

    // Too many simultaneous fades: force the oldest to finish this tick.
    if voices.released.len() > MAX_RELEASED_TONES {
        let excess = voices.released.len() - MAX_RELEASED_TONES;
        for &handle in voices.released.iter().take(excess) {
            if let Some(tone) = pool.get_mut(handle) {
                tone.is_on_last_tick = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{chord_expression, Instrument};
    use crate::score::{Channel, Pattern};

    fn make_song(instrument: Instrument, notes: Vec<Note>) -> Song {
        let mut song = Song::new();
        let mut channel = Channel::new(ChannelKind::Pitch);
        channel.instruments.push(instrument);
        channel.patterns.push(Pattern::new(vec![0], notes));
        channel.bars = vec![1, 1];
        song.channels.push(channel);
        song
    }

    fn run_tick(
        song: &Song,
        bar: usize,
        part: f64,
        pool: &mut TonePool,
        voices: &mut Vec<InstrumentVoices>,
    ) {
        determine_tones_for_channel(song, 0, bar, part, true, pool, voices, None).unwrap();
    }

    #[test]
    fn single_note_allocates_then_releases_then_recycles() {
        let song = make_song(Instrument::chip(0), vec![Note::simple(vec![48], 0.0, 24.0)]);
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];

        run_tick(&song, 0, 0.0, &mut pool, &mut voices);
        assert_eq!(voices[0].active.len(), 1);

        // Past the note's end the tone is released but still addressable.
        run_tick(&song, 0, 30.0, &mut pool, &mut voices);
        assert_eq!(voices[0].active.len(), 0);
        assert_eq!(voices[0].released.len(), 1);
        let handle = voices[0].released[0];
        assert!(pool.get(handle).unwrap().released);

        // After the fade-out tick count it is recycled.
        let fade = song.channels[0].instruments[0].fade_out_ticks();
        for _ in 0..=fade.abs() + 1 {
            advance_released_tones(&mut pool, &mut voices[0], fade);
        }
        assert_eq!(voices[0].released.len(), 0);
        assert!(pool.get(handle).is_none());
    }

    #[test]
    fn held_note_keeps_the_same_tone() {
        let song = make_song(Instrument::chip(0), vec![Note::simple(vec![48], 0.0, 24.0)]);
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        run_tick(&song, 0, 0.0, &mut pool, &mut voices);
        let first = voices[0].active[0];
        run_tick(&song, 0, 12.0, &mut pool, &mut voices);
        assert_eq!(voices[0].active[0], first);
        assert_eq!(voices[0].released.len(), 0);
    }

    #[test]
    fn simultaneous_chord_gets_one_tone_per_pitch() {
        let song = make_song(
            Instrument::chip(0),
            vec![Note::simple(vec![48, 52, 55], 0.0, 24.0)],
        );
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        run_tick(&song, 0, 0.0, &mut pool, &mut voices);
        assert_eq!(voices[0].active.len(), 3);
        for &handle in &voices[0].active {
            let tone = pool.get(handle).unwrap();
            assert_eq!(tone.chord_size, 3);
        }
        // Loudness compensation for a 3-pitch chord.
        assert!((chord_expression(3) - 1.0 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn arpeggio_uses_a_single_tone_with_all_pitches() {
        let mut instrument = Instrument::chip(0);
        instrument.chord = ChordPolicy::Arpeggio;
        let song = make_song(instrument, vec![Note::simple(vec![48, 52, 55, 59], 0.0, 24.0)]);
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        run_tick(&song, 0, 0.0, &mut pool, &mut voices);
        assert_eq!(voices[0].active.len(), 1);
        let tone = pool.get(voices[0].active[0]).unwrap();
        assert_eq!(tone.pitch_count, 4);
    }

    #[test]
    fn strum_staggers_tone_onsets() {
        let mut instrument = Instrument::chip(0);
        instrument.chord = ChordPolicy::Strum;
        instrument.strum_parts = 2.0;
        let song = make_song(instrument, vec![Note::simple(vec![48, 52, 55], 0.0, 24.0)]);
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        run_tick(&song, 0, 0.0, &mut pool, &mut voices);
        assert_eq!(voices[0].active.len(), 1);
        run_tick(&song, 0, 2.0, &mut pool, &mut voices);
        assert_eq!(voices[0].active.len(), 2);
        run_tick(&song, 0, 4.5, &mut pool, &mut voices);
        assert_eq!(voices[0].active.len(), 3);
    }

    #[test]
    fn slide_transition_carries_the_tone_into_the_next_note() {
        let mut instrument = Instrument::chip(0);
        instrument.transition = Transition::Slide;
        let song = make_song(
            instrument,
            vec![
                Note::simple(vec![48], 0.0, 12.0),
                Note::simple(vec![52], 12.0, 24.0),
            ],
        );
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        run_tick(&song, 0, 0.0, &mut pool, &mut voices);
        let handle = voices[0].active[0];
        run_tick(&song, 0, 12.0, &mut pool, &mut voices);
        assert_eq!(voices[0].active.len(), 1);
        assert_eq!(voices[0].active[0], handle, "tone should carry over");
        let tone = pool.get(handle).unwrap();
        assert!(tone.force_continue_at_start);
        assert!(tone.prev_note.is_some());
        assert_eq!(tone.pitches[0], 52);
    }

    #[test]
    fn normal_transition_releases_and_reattacks() {
        let song = make_song(
            Instrument::chip(0),
            vec![
                Note::simple(vec![48], 0.0, 12.0),
                Note::simple(vec![52], 12.0, 24.0),
            ],
        );
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        run_tick(&song, 0, 0.0, &mut pool, &mut voices);
        let first = voices[0].active[0];
        run_tick(&song, 0, 12.0, &mut pool, &mut voices);
        assert_ne!(voices[0].active[0], first);
        assert_eq!(voices[0].released.len(), 1);
        assert!(!pool.get(voices[0].released[0]).unwrap().is_on_last_tick);
    }

    #[test]
    fn interrupt_transition_fast_fades_the_old_tone() {
        let mut instrument = Instrument::chip(0);
        instrument.transition = Transition::Interrupt;
        let song = make_song(
            instrument,
            vec![
                Note::simple(vec![48], 0.0, 12.0),
                Note::simple(vec![52], 12.0, 24.0),
            ],
        );
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        run_tick(&song, 0, 0.0, &mut pool, &mut voices);
        run_tick(&song, 0, 12.0, &mut pool, &mut voices);
        assert_eq!(voices[0].released.len(), 1);
        assert!(pool.get(voices[0].released[0]).unwrap().is_on_last_tick);
    }

    #[test]
    fn continuation_across_bars_requires_exact_pitch_match() {
        let mut instrument = Instrument::chip(0);
        instrument.transition = Transition::Continue;
        let mut song = Song::new();
        let mut channel = Channel::new(ChannelKind::Pitch);
        channel.instruments.push(instrument);
        channel
            .patterns
            .push(Pattern::new(vec![0], vec![Note::simple(vec![48, 52], 0.0, 96.0)]));
        channel
            .patterns
            .push(Pattern::new(vec![0], vec![Note::simple(vec![48, 52], 0.0, 24.0)]));
        channel
            .patterns
            .push(Pattern::new(vec![0], vec![Note::simple(vec![49, 52], 0.0, 24.0)]));
        channel.bars = vec![1, 2, 3];
        song.channels.push(channel);

        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        run_tick(&song, 0, 0.0, &mut pool, &mut voices);
        let handles: Vec<_> = voices[0].active.clone();

        // Matching pitch set: both chord tones continue into bar 1.
        run_tick(&song, 1, 0.0, &mut pool, &mut voices);
        assert_eq!(voices[0].active, handles);

        // Mismatched pitch set in bar 2: fresh tones.
        run_tick(&song, 2, 0.0, &mut pool, &mut voices);
        assert_ne!(voices[0].active, handles);
    }

    #[test]
    fn live_input_matches_voices_by_nearest_pitch() {
        let song = make_song(Instrument::chip(0), Vec::new());
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        let live = LiveInput {
            channel: 0,
            instrument: 0,
            pitches: vec![40, 60],
        };
        determine_tones_for_channel(&song, 0, 0, 0.0, true, &mut pool, &mut voices, Some(&live))
            .unwrap();
        assert_eq!(voices[0].live_active.len(), 2);
        let low = voices[0].live_active[0];

        // Pitch 40 moves to 41: its voice is reused, 60's is released.
        let live = LiveInput {
            channel: 0,
            instrument: 0,
            pitches: vec![41],
        };
        determine_tones_for_channel(&song, 0, 0, 0.5, true, &mut pool, &mut voices, Some(&live))
            .unwrap();
        assert_eq!(voices[0].live_active.len(), 1);
        assert_eq!(voices[0].live_active[0], low);
        assert_eq!(pool.get(low).unwrap().pitches[0], 41);
        assert_eq!(voices[0].released.len(), 1);
    }

    #[test]
    fn corrupt_instrument_reference_is_a_fatal_error() {
        let mut song = make_song(Instrument::chip(0), Vec::new());
        song.channels[0].patterns[0].instruments = vec![7];
        let mut pool = TonePool::new();
        let mut voices = vec![InstrumentVoices::default()];
        let result =
            determine_tones_for_channel(&song, 0, 0, 0.0, true, &mut pool, &mut voices, None);
        assert!(result.is_err());
    }

    #[test]
    fn polyphony_pressure_fast_fades_overflow() {
        let mut pool = TonePool::new();
        let mut voices = InstrumentVoices::default();
        for _ in 0..(MAX_RELEASED_TONES + 3) {
            let handle = pool.allocate();
            pool.get_mut(handle).unwrap().released = true;
            voices.released.push(handle);
        }
        advance_released_tones(&mut pool, &mut voices, 96);
        let fast_fading = voices
            .released
            .iter()
            .filter(|&&handle| pool.get(handle).unwrap().is_on_last_tick)
            .count();
        assert!(fast_fading >= 3);
    }
}
