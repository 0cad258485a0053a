// src/synth.rs

//! The synthesizer orchestrator.
//!
//! `Synth` owns the fractional sample/tick/part/beat/bar transport, the
//! tone pool and all per-instrument render state. `synthesize` subdivides
//! the host's buffer into runs bounded by tick boundaries: once per tick it
//! evaluates the modulation bus, schedules tones, and resolves every
//! envelope/filter/effect parameter to a start value plus per-sample
//! delta; inside a run everything is pure interpolation. The same
//! transport position therefore always yields the same parameter
//! trajectory, which makes playback deterministic and seeking safe.

pub mod effects;
pub mod kernels;
pub mod modulation;
pub mod picked_string;
pub mod scheduler;
pub mod tone;
pub mod voice_state;

use crate::config::{self, SynthConfig};
use crate::envelope::{AutomationTarget, EnvelopeTiming, SlideBlend};
use crate::instrument::{
    chord_expression, ChordPolicy, GeneratorKind, Instrument, InstrumentModSetting,
    SongModSetting,
};
use crate::score::{ChannelKind, Song};
use anyhow::{bail, Result};
use self::modulation::ModValueTable;
use self::scheduler::{InstrumentVoices, LiveInput};
use self::tone::{Tone, TonePool};
use self::voice_state::InstrumentRenderState;

/// Base expression levels per generator family, compensating their raw
/// output ranges.
const CUSTOM_CHIP_EXPRESSION: f64 = 0.6;
const HARMONICS_EXPRESSION: f64 = 0.9;
const SPECTRUM_EXPRESSION: f64 = 0.3;
const FM_EXPRESSION: f64 = 0.7;
const PULSE_EXPRESSION: f64 = 0.5;
const STRING_EXPRESSION: f64 = 0.8;

/// Slide window cap, in parts.
const SLIDE_WINDOW_PARTS_MAX: f64 = 6.0;

/// Soft-knee limiter on the master bus, an envelope follower with fast
/// attack and musical release.
struct Limiter {
    attack_coeff: f64,
    release_coeff: f64,
    envelope: f64,
    threshold: f64,
}

impl Limiter {
    fn new(sample_rate: f64) -> Self {
        let attack_ms = 0.5;
        let release_ms = 80.0;
        Self {
            attack_coeff: (-(1.0 / (attack_ms * 0.001 * sample_rate))).exp(),
            release_coeff: (-(1.0 / (release_ms * 0.001 * sample_rate))).exp(),
            envelope: 0.0,
            threshold: 0.95,
        }
    }

    #[inline(always)]
    fn process(&mut self, left: f64, right: f64) -> (f64, f64) {
        let peak = left.abs().max(right.abs());
        self.envelope = if peak > self.envelope {
            self.attack_coeff * (self.envelope - peak) + peak
        } else {
            self.release_coeff * (self.envelope - peak) + peak
        };
        let gain = if self.envelope > self.threshold {
            self.threshold / self.envelope
        } else {
            1.0
        };
        (left * gain, right * gain)
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
    }
}

struct ChannelState {
    voices: Vec<InstrumentVoices>,
    states: Vec<InstrumentRenderState>,
}

pub struct Synth {
    config: SynthConfig,
    pool: TonePool,
    channel_states: Vec<ChannelState>,
    mods: ModValueTable,

    // Transport.
    bar: usize,
    tick_in_bar: usize,
    tick_sample_countdown: f64,
    song_ended: bool,
    was_playing: bool,
    loop_repeat_count: i32,
    loops_remaining: i32,
    pending_next_bar: bool,

    live_input: Option<LiveInput>,

    limiter: Limiter,
    scratch: Vec<f64>,
    master_left: Vec<f64>,
    master_right: Vec<f64>,
}

impl Synth {
    pub fn new(config: SynthConfig) -> Self {
        let limiter = Limiter::new(config.sample_rate);
        Self {
            config,
            pool: TonePool::new(),
            channel_states: Vec::new(),
            mods: ModValueTable::new(),
            bar: 0,
            tick_in_bar: 0,
            tick_sample_countdown: 0.0,
            song_ended: false,
            was_playing: false,
            loop_repeat_count: -1,
            loops_remaining: -1,
            pending_next_bar: false,
            live_input: None,
            limiter,
            scratch: Vec::new(),
            master_left: Vec::new(),
            master_right: Vec::new(),
        }
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    pub fn current_bar(&self) -> usize {
        self.bar
    }

    pub fn song_ended(&self) -> bool {
        self.song_ended
    }

    /// -1 loops forever; 0 plays straight through; n repeats the loop n
    /// times.
    pub fn set_loop_repeat_count(&mut self, count: i32) {
        self.loop_repeat_count = count;
        self.loops_remaining = count;
        self.mods.clear();
    }

    /// Jumps the playhead to the start of `bar` and resynchronizes
    /// modulation snapshots before the next render call.
    pub fn seek_to_bar(&mut self, bar: usize) {
        self.bar = bar;
        self.tick_in_bar = 0;
        self.tick_sample_countdown = 0.0;
        self.song_ended = false;
        self.pending_next_bar = false;
        self.mods.clear();
        self.release_everything();
        for channel in &mut self.channel_states {
            for state in &mut channel.states {
                state.reset();
            }
        }
        self.limiter.reset();
    }

    /// Sets the playhead as a fraction of the song length.
    pub fn set_playhead_fraction(&mut self, fraction: f64, song: &Song) {
        let bar = (fraction.clamp(0.0, 1.0) * song.bar_count as f64) as usize;
        self.seek_to_bar(bar.min(song.bar_count.saturating_sub(1)));
    }

    /// Declares the currently-held real-time pitches; `None` stops live
    /// input.
    pub fn set_live_input(&mut self, live: Option<LiveInput>) {
        self.live_input = live;
    }

    fn release_everything(&mut self) {
        for channel in &mut self.channel_states {
            for voices in &mut channel.voices {
                for handle in voices
                    .active
                    .drain(..)
                    .chain(voices.live_active.drain(..))
                    .chain(voices.released.drain(..))
                {
                    self.pool.free(handle);
                }
            }
        }
    }

    fn ensure_song_structures(&mut self, song: &Song) {
        while self.channel_states.len() < song.channels.len() {
            self.channel_states.push(ChannelState {
                voices: Vec::new(),
                states: Vec::new(),
            });
        }
        for (channel, state) in song.channels.iter().zip(self.channel_states.iter_mut()) {
            while state.voices.len() < channel.instruments.len() {
                state.voices.push(InstrumentVoices::default());
                state.states.push(InstrumentRenderState::new());
            }
        }
    }

    /// The song tempo for this tick, honoring a live override.
    fn tick_tempo(&self, song: &Song) -> f64 {
        self.mods
            .song_value(SongModSetting::Tempo)
            .map(|value| value.start)
            .unwrap_or(song.tempo)
    }

    /// Fills two equal-length sample buffers in [-1, 1] and advances the
    /// transport by `frame_count` samples. Corrupt score references abort
    /// the pass with an error.
    pub fn synthesize(
        &mut self,
        song: &Song,
        out_left: &mut [f32],
        out_right: &mut [f32],
        frame_count: usize,
        is_playing: bool,
    ) -> Result<()> {
        debug_assert!(out_left.len() >= frame_count && out_right.len() >= frame_count);
        self.ensure_song_structures(song);

        if self.was_playing && !is_playing {
            // Playback stopped: drop stale overrides so a later resume
            // re-synchronizes from scratch.
            self.mods.clear();
            self.tick_sample_countdown = 0.0;
        }
        self.was_playing = is_playing;

        if self.master_left.len() < frame_count {
            self.master_left.resize(frame_count, 0.0);
            self.master_right.resize(frame_count, 0.0);
        }
        self.master_left[..frame_count].fill(0.0);
        self.master_right[..frame_count].fill(0.0);

        let mut buffer_index = 0;
        while buffer_index < frame_count {
            let advancing = is_playing && !self.song_ended;

            if self.tick_sample_countdown <= 0.0 {
                self.compute_one_tick(song, advancing)?;
            }

            let run = (self.tick_sample_countdown.ceil() as usize)
                .min(frame_count - buffer_index)
                .max(1);
            self.render_run(song, buffer_index, run);
            self.tick_sample_countdown -= run as f64;
            buffer_index += run;

            if self.tick_sample_countdown <= 0.0 {
                self.finish_tick(song, advancing);
            }
        }

        // Master gain, limiter, and the final clamp into the host buffers.
        let gain_base = self
            .mods
            .song_value(SongModSetting::MasterGain)
            .map(|value| value.start)
            .unwrap_or(song.master_gain);
        for i in 0..frame_count {
            let left = self.master_left[i] * gain_base;
            let right = self.master_right[i] * gain_base;
            let (left, right) = self.limiter.process(left, right);
            out_left[i] = left.clamp(-1.0, 1.0) as f32;
            out_right[i] = right.clamp(-1.0, 1.0) as f32;
        }

        Ok(())
    }

    /// Everything that happens exactly once per tick: modulation, tone
    /// scheduling, and parameter resolution.
    fn compute_one_tick(&mut self, song: &Song, advancing: bool) -> Result<()> {
        let part_start = self.tick_in_bar as f64 / config::TICKS_PER_PART as f64;
        let part_end = (self.tick_in_bar + 1) as f64 / config::TICKS_PER_PART as f64;

        if advancing {
            // Mod channels resolve before any audible channel reads the
            // table.
            modulation::tick_update(song, &mut self.mods, self.bar, part_start, part_end);
            if self.mods.take_next_bar_request() {
                self.pending_next_bar = true;
            }
            for (channel_index, instrument_index) in self.mods.take_arpeggio_resets() {
                if let Some(state) = self
                    .channel_states
                    .get_mut(channel_index)
                    .and_then(|c| c.states.get_mut(instrument_index))
                {
                    state.arpeggio_time = 0.0;
                }
            }
        }

        // The tick length follows the (possibly overridden) tempo, so a
        // bar's total sample count integrates tempo changes.
        let tempo = self.tick_tempo(song);
        let samples_per_tick = self.config.samples_per_tick(tempo);
        self.tick_sample_countdown += samples_per_tick;

        for channel_index in 0..song.channels.len() {
            let channel = &song.channels[channel_index];
            if channel.kind == ChannelKind::Mod {
                continue;
            }
            let channel_state = &mut self.channel_states[channel_index];
            scheduler::determine_tones_for_channel(
                song,
                channel_index,
                self.bar,
                part_start,
                advancing,
                &mut self.pool,
                &mut channel_state.voices,
                self.live_input.as_ref(),
            )?;

            for instrument_index in 0..channel.instruments.len() {
                let voices = &channel_state.voices[instrument_index];
                let has_tones = !voices.active.is_empty()
                    || !voices.live_active.is_empty()
                    || !voices.released.is_empty();
                let state = &mut channel_state.states[instrument_index];
                if has_tones {
                    state.tones_active_this_tick = true;
                }
                if !state.needs_rendering() {
                    continue;
                }
                let instrument = &channel.instruments[instrument_index];
                state.compute_tick(
                    &self.config,
                    channel_index,
                    instrument_index,
                    instrument,
                    &self.mods,
                    samples_per_tick,
                );
                state.arpeggio_time += instrument.arpeggio_speed;

                let handles: Vec<_> = channel_state.voices[instrument_index]
                    .active
                    .iter()
                    .chain(channel_state.voices[instrument_index].live_active.iter())
                    .chain(channel_state.voices[instrument_index].released.iter())
                    .copied()
                    .collect();
                let arpeggio_time = channel_state.states[instrument_index].arpeggio_time;
                for handle in handles {
                    if let Some(tone) = self.pool.get_mut(handle) {
                        compute_tone(
                            &self.config,
                            song,
                            channel_index,
                            instrument_index,
                            instrument,
                            &self.mods,
                            tone,
                            samples_per_tick,
                            tempo,
                            self.bar,
                            self.tick_in_bar,
                            arpeggio_time,
                        )?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Renders one run of samples (bounded by the tick) for every
    /// instrument with work to do.
    fn render_run(&mut self, song: &Song, buffer_index: usize, run: usize) {
        if self.scratch.len() < run {
            self.scratch.resize(run, 0.0);
        }

        for channel_index in 0..song.channels.len() {
            let channel = &song.channels[channel_index];
            if channel.kind == ChannelKind::Mod {
                continue;
            }
            for instrument_index in 0..channel.instruments.len() {
                let channel_state = &mut self.channel_states[channel_index];
                let state = &mut channel_state.states[instrument_index];
                if !state.awake {
                    continue;
                }
                let instrument = &channel.instruments[instrument_index];
                self.scratch[..run].fill(0.0);

                let voices = &channel_state.voices[instrument_index];
                let handles: Vec<_> = voices
                    .active
                    .iter()
                    .chain(voices.live_active.iter())
                    .chain(voices.released.iter())
                    .copied()
                    .collect();
                for handle in handles {
                    if let Some(tone) = self.pool.get_mut(handle) {
                        kernels::render_tone(
                            &self.config,
                            instrument,
                            tone,
                            &mut self.scratch[..run],
                        );
                        tone.is_fresh = false;
                    }
                }

                effects::process_effects(
                    state,
                    &self.scratch[..run],
                    &mut self.master_left[buffer_index..buffer_index + run],
                    &mut self.master_right[buffer_index..buffer_index + run],
                    self.config.sample_rate,
                );
            }
        }
    }

    /// End-of-tick bookkeeping: tone aging, fade-out progress, and
    /// transport advance.
    fn finish_tick(&mut self, song: &Song, advancing: bool) {
        let tempo = self.tick_tempo(song);
        let seconds_per_tick = self.config.seconds_per_tick(tempo);

        for channel_index in 0..song.channels.len().min(self.channel_states.len()) {
            let channel = &song.channels[channel_index];
            let channel_state = &mut self.channel_states[channel_index];
            for instrument_index in 0..channel.instruments.len() {
                let voices = &mut channel_state.voices[instrument_index];
                for handle in voices
                    .active
                    .iter()
                    .chain(voices.live_active.iter())
                    .chain(voices.released.iter())
                {
                    if let Some(tone) = self.pool.get_mut(*handle) {
                        tone.seconds_alive += seconds_per_tick;
                        tone.ticks_alive += 1.0;
                        tone.envelope_computer.neutralize();
                    }
                }
                let fade = channel.instruments[instrument_index].fade_out_ticks();
                scheduler::advance_released_tones(&mut self.pool, voices, fade);
            }
        }

        if !advancing {
            return;
        }

        self.tick_in_bar += 1;
        let bar_done = self.tick_in_bar >= song.ticks_per_bar();
        if bar_done || self.pending_next_bar {
            self.pending_next_bar = false;
            self.tick_in_bar = 0;
            self.bar += 1;

            let loop_end = song.loop_start + song.loop_length;
            if self.bar >= loop_end && self.loops_remaining != 0 {
                self.bar = song.loop_start;
                if self.loops_remaining > 0 {
                    self.loops_remaining -= 1;
                }
            } else if self.bar >= song.bar_count {
                self.song_ended = true;
                self.mods.clear();
            }
        }
    }
}

/// Resolves one tone's per-tick parameters: pitch trajectory (pins, chord,
/// arpeggio, vibrato, slides), expression and fades, per-operator FM
/// levels, pulse width, string sustain, and the note-filter gradients.
#[allow(clippy::too_many_arguments)]
fn compute_tone(
    config: &SynthConfig,
    song: &Song,
    channel_index: usize,
    instrument_index: usize,
    instrument: &Instrument,
    mods: &ModValueTable,
    tone: &mut Tone,
    samples_per_tick: f64,
    tempo: f64,
    bar: usize,
    tick_in_bar: usize,
    arpeggio_time: f64,
) -> Result<()> {
    let sample_rate = config.sample_rate;
    let inv_samples = 1.0 / samples_per_tick;
    let seconds_per_tick = 60.0 / (tempo * config::TICKS_PER_BEAT as f64);
    let channel = &song.channels[channel_index];

    // Validate generator resources up front; a bad reference means the
    // score is corrupt and this pass must abort loudly.
    match instrument.kind {
        GeneratorKind::Chip { wave } if wave >= config.chip_waves.len() => {
            bail!("chip wave index {} out of range", wave)
        }
        GeneratorKind::Noise { wave } if wave >= config.noise_waves.len() => {
            bail!("noise wave index {} out of range", wave)
        }
        GeneratorKind::Fm => {
            if instrument.fm.algorithm >= config::FM_ALGORITHMS.len() {
                bail!("FM algorithm index {} out of range", instrument.fm.algorithm);
            }
            if instrument.fm.feedback_type >= config::FM_FEEDBACKS.len() {
                bail!("FM feedback index {} out of range", instrument.fm.feedback_type);
            }
        }
        _ => {}
    }

    // --- Note-relative timing ---
    let note_seconds_start = tone.note_seconds();
    let note_seconds_end = note_seconds_start + seconds_per_tick;
    let note_ticks_start = tone.note_ticks();
    let note_ticks_end = note_ticks_start + 1.0;
    let beats_start = bar as f64 * song.beats_per_bar as f64
        + tick_in_bar as f64 / config::TICKS_PER_BEAT as f64;
    let beats_end = beats_start + 1.0 / config::TICKS_PER_BEAT as f64;

    let part_start = tick_in_bar as f64 / config::TICKS_PER_PART as f64;
    let part_end = (tick_in_bar + 1) as f64 / config::TICKS_PER_PART as f64;

    // --- Pin interpolation (interval and size) ---
    let (pin_interval_start, pin_size_start, pin_interval_end, pin_size_end) = match &tone.note {
        Some(note) => {
            let (interval_start, size_start) = note.pin_values_at(part_start - note.start);
            let (interval_end, size_end) = note.pin_values_at(part_end - note.start);
            (interval_start, size_start, interval_end, size_end)
        }
        None => (0.0, config::NOTE_SIZE_MAX, 0.0, config::NOTE_SIZE_MAX),
    };

    // --- Slide blending windows ---
    let slides = instrument.transition.slides();
    let mut slide_in: Option<SlideBlend> = None;
    let mut slide_out: Option<SlideBlend> = None;
    let mut slide_interval_start = 0.0;
    let mut slide_interval_end = 0.0;
    if slides {
        if let (Some(note), Some(prev)) = (&tone.note, &tone.prev_note) {
            let window_parts = (0.5 * prev.length().min(note.length())).min(SLIDE_WINDOW_PARTS_MAX);
            let window_ticks = window_parts * config::TICKS_PER_PART as f64;
            if window_ticks > 0.0 && note_ticks_start < window_ticks {
                let ratio_at = |ticks: f64| (0.5 * (1.0 - ticks / window_ticks)).clamp(0.0, 0.5);
                let ratio_start = ratio_at(note_ticks_start);
                let ratio_end = ratio_at(note_ticks_end);
                let pitch_difference = (prev.pitches.first().copied().unwrap_or(0)
                    - note.pitches.first().copied().unwrap_or(0))
                    as f64;
                slide_interval_start = pitch_difference * ratio_start;
                slide_interval_end = pitch_difference * ratio_end;
                slide_in = Some(SlideBlend {
                    start_ratio: ratio_start,
                    end_ratio: ratio_end,
                    other: EnvelopeTiming {
                        seconds_start: tone.prev_note_seconds(),
                        seconds_end: tone.prev_note_seconds() + seconds_per_tick,
                        ticks_start: tone.prev_note_ticks(),
                        ticks_end: tone.prev_note_ticks() + 1.0,
                        beats_start,
                        beats_end,
                        note_size_start: pin_size_start,
                        note_size_end: pin_size_end,
                    },
                });
            }
        }
        if let (Some(note), Some(next)) = (&tone.note, &tone.next_note) {
            let window_parts = (0.5 * next.length().min(note.length())).min(SLIDE_WINDOW_PARTS_MAX);
            let window_ticks = window_parts * config::TICKS_PER_PART as f64;
            let note_length_ticks = note.length() * config::TICKS_PER_PART as f64;
            let ticks_left_start = note_length_ticks - note_ticks_start;
            if window_ticks > 0.0 && ticks_left_start < window_ticks {
                let ratio_at =
                    |ticks_left: f64| (0.5 * (1.0 - ticks_left / window_ticks)).clamp(0.0, 0.5);
                let ratio_start = ratio_at(ticks_left_start);
                let ratio_end = ratio_at(ticks_left_start - 1.0);
                let pitch_difference = (next.pitches.first().copied().unwrap_or(0)
                    - note.pitches.first().copied().unwrap_or(0))
                    as f64;
                slide_interval_start += pitch_difference * ratio_start;
                slide_interval_end += pitch_difference * ratio_end;
                slide_out = Some(SlideBlend {
                    start_ratio: ratio_start,
                    end_ratio: ratio_end,
                    other: EnvelopeTiming {
                        seconds_start: 0.0,
                        seconds_end: 0.0,
                        ticks_start: 0.0,
                        ticks_end: 0.0,
                        beats_start,
                        beats_end,
                        note_size_start: pin_size_start,
                        note_size_end: pin_size_end,
                    },
                });
            }
        }
    }

    // --- Envelopes ---
    let timing = EnvelopeTiming {
        seconds_start: note_seconds_start,
        seconds_end: note_seconds_end,
        ticks_start: note_ticks_start,
        ticks_end: note_ticks_end,
        beats_start,
        beats_end,
        note_size_start: pin_size_start,
        note_size_end: pin_size_end,
    };
    tone.envelope_computer.compute_tick(
        &instrument.envelopes,
        &timing,
        slide_in.as_ref(),
        slide_out.as_ref(),
    );

    // --- Base pitch ---
    let octave_offset = (channel.octave * config::PITCHES_PER_OCTAVE) as f64;
    let noise_pitched = instrument.kind.is_noise_pitched();
    let uses_main_interval = noise_pitched || matches!(instrument.kind, GeneratorKind::Fm);
    let main_interval = tone
        .note
        .as_ref()
        .map(|note| note.main_interval())
        .unwrap_or(0.0);

    let base_pitch = if instrument.chord == ChordPolicy::Arpeggio && tone.pitch_count > 1 {
        let mut position = arpeggio_time;
        if tone.pitch_count == 2 && instrument.fast_two_note_arp {
            position *= 2.0;
        }
        let index = (position.max(0.0) as usize) % tone.pitch_count;
        tone.pitches[index] as f64
    } else {
        tone.pitches[0] as f64
    };

    let (interval_start, interval_end) = if uses_main_interval {
        (main_interval, main_interval)
    } else {
        (pin_interval_start, pin_interval_end)
    };

    // Pitch shift and detune, both automatable.
    let envelopes = &tone.envelope_computer;
    let pitch_shift_start = instrument.pitch_shift * envelopes.start(AutomationTarget::PitchShift);
    let pitch_shift_end = instrument.pitch_shift * envelopes.end(AutomationTarget::PitchShift);
    let (detune_start, detune_end) = mods.instrument_value_or(
        channel_index,
        instrument_index,
        InstrumentModSetting::Detune,
        instrument.detune,
    );
    let detune_start = detune_start * envelopes.start(AutomationTarget::Detune);
    let detune_end = detune_end * envelopes.end(AutomationTarget::Detune);

    // Vibrato: a pitch LFO that ramps in after its delay.
    let (vibrato_base, _) = mods.instrument_value_or(
        channel_index,
        instrument_index,
        InstrumentModSetting::VibratoDepth,
        instrument.vibrato.amplitude,
    );
    let mut vibrato_start = 0.0;
    let mut vibrato_end = 0.0;
    if vibrato_base > 0.0 {
        let depth_start = vibrato_base * envelopes.start(AutomationTarget::VibratoDepth);
        let depth_end = vibrato_base * envelopes.end(AutomationTarget::VibratoDepth);
        let delay_ticks = instrument.vibrato.delay_parts * config::TICKS_PER_PART as f64;
        let ramp = |ticks: f64| {
            if delay_ticks <= 0.0 {
                1.0
            } else {
                ((ticks - delay_ticks) / delay_ticks.max(1.0)).clamp(0.0, 1.0)
            }
        };
        let lfo = |seconds: f64| {
            (seconds * std::f64::consts::TAU / instrument.vibrato.period_seconds).sin()
        };
        vibrato_start = depth_start * ramp(note_ticks_start) * lfo(tone.seconds_alive);
        vibrato_end =
            depth_end * ramp(note_ticks_end) * lfo(tone.seconds_alive + seconds_per_tick);
    }

    let total_interval_start = base_pitch
        + octave_offset
        + interval_start
        + pitch_shift_start
        + detune_start
        + vibrato_start
        + slide_interval_start;
    let total_interval_end = base_pitch
        + octave_offset
        + interval_end
        + pitch_shift_end
        + detune_end
        + vibrato_end
        + slide_interval_end;

    // --- Frequencies to phase deltas ---
    let unison = &instrument.unison;
    let unison_mult_start = envelopes.start(AutomationTarget::Unison);
    let unison_mult_end = envelopes.end(AutomationTarget::Unison);
    let voices = unison.voices.clamp(1, config::UNISON_VOICE_MAX);

    let noise_length = match instrument.kind {
        GeneratorKind::Noise { wave } => config.noise_waves[wave].samples.len() as f64,
        GeneratorKind::Spectrum => instrument
            .spectrum_wave
            .as_ref()
            .map(|wave| wave.samples.len() as f64)
            .unwrap_or(1.0),
        _ => 1.0,
    };
    let noise_base_pitch = match instrument.kind {
        GeneratorKind::Noise { wave } => config.noise_waves[wave].base_pitch as f64,
        _ => 69.0,
    };

    let freq_of = |interval: f64, spread: f64| -> f64 {
        if noise_pitched {
            // Entries per sample relative to the wave's base pitch,
            // normalized to table cycles.
            config::interval_to_ratio(interval + spread - noise_base_pitch) / noise_length
        } else {
            config::pitch_to_frequency(interval + spread, song.key) / sample_rate
        }
    };

    for voice in 0..voices {
        let spread_sign = if voice == 0 { 1.0 } else { -1.0 };
        let spread_start = (unison.offset + unison.spread * spread_sign) * unison_mult_start;
        let spread_end = (unison.offset + unison.spread * spread_sign) * unison_mult_end;
        let delta_start = freq_of(total_interval_start, spread_start);
        let delta_end = freq_of(total_interval_end, spread_end);
        tone.phase_deltas[voice] = delta_start;
        tone.phase_delta_scales[voice] = (delta_end / delta_start.max(1.0e-20)).powf(inv_samples);
    }

    // --- FM operators ---
    if let GeneratorKind::Fm = instrument.kind {
        let base_freq_start = config::pitch_to_frequency(total_interval_start, song.key);
        let base_freq_end = config::pitch_to_frequency(total_interval_end, song.key);
        for op in 0..config::OPERATOR_COUNT {
            let settings = &instrument.fm.operators[op];
            let frequency = config::OPERATOR_FREQUENCIES
                [settings.frequency.min(config::OPERATOR_FREQUENCIES.len() - 1)];
            let freq_env_start = envelopes.start(AutomationTarget::OperatorFrequency(op));
            let freq_env_end = envelopes.end(AutomationTarget::OperatorFrequency(op));
            let op_freq_start =
                (base_freq_start * frequency.mult + frequency.hz_offset) * freq_env_start;
            let op_freq_end = (base_freq_end * frequency.mult + frequency.hz_offset) * freq_env_end;
            let delta_start = op_freq_start / sample_rate;
            let delta_end = op_freq_end / sample_rate;
            tone.phase_deltas[op] = delta_start;
            tone.phase_delta_scales[op] = (delta_end / delta_start.max(1.0e-20)).powf(inv_samples);

            let amp_env_start = envelopes.start(AutomationTarget::OperatorAmplitude(op));
            let amp_env_end = envelopes.end(AutomationTarget::OperatorAmplitude(op));
            let expression_start =
                config::operator_amplitude_mult(settings.amplitude) * amp_env_start;
            let expression_end = config::operator_amplitude_mult(settings.amplitude) * amp_env_end;
            tone.operator_expressions[op] = expression_start;
            tone.operator_expression_deltas[op] = (expression_end - expression_start) * inv_samples;
        }
        let feedback_env_start = envelopes.start(AutomationTarget::FeedbackAmplitude);
        let feedback_env_end = envelopes.end(AutomationTarget::FeedbackAmplitude);
        let feedback_base = instrument.fm.feedback_amplitude / 15.0;
        tone.feedback_mult = feedback_base * feedback_env_start;
        tone.feedback_delta = (feedback_base * feedback_env_end - tone.feedback_mult) * inv_samples;
    }

    // --- Pulse width ---
    if let GeneratorKind::PulseWidth = instrument.kind {
        let (width_start, width_end) = mods.instrument_value_or(
            channel_index,
            instrument_index,
            InstrumentModSetting::PulseWidth,
            instrument.pulse_width,
        );
        let width_start = width_start * envelopes.start(AutomationTarget::PulseWidth);
        let width_end = width_end * envelopes.end(AutomationTarget::PulseWidth);
        tone.pulse_width = width_start.clamp(0.01, 0.99);
        tone.pulse_width_delta = (width_end.clamp(0.01, 0.99) - tone.pulse_width) * inv_samples;
    }

    // --- Picked-string sustain ---
    if let GeneratorKind::PickedString = instrument.kind {
        let (sustain_start, sustain_end) = mods.instrument_value_or(
            channel_index,
            instrument_index,
            InstrumentModSetting::StringSustain,
            instrument.string_sustain,
        );
        tone.string_sustain_start =
            (sustain_start * envelopes.start(AutomationTarget::StringSustain)).clamp(0.0, 1.0);
        tone.string_sustain_end =
            (sustain_end * envelopes.end(AutomationTarget::StringSustain)).clamp(0.0, 1.0);
    }

    // --- Expression (loudness trajectory) ---
    let generator_expression = match instrument.kind {
        GeneratorKind::Chip { wave } => config.chip_waves[wave].expression,
        GeneratorKind::CustomChip => CUSTOM_CHIP_EXPRESSION,
        GeneratorKind::Noise { wave } => config.noise_waves[wave].expression,
        GeneratorKind::Harmonics => HARMONICS_EXPRESSION,
        GeneratorKind::Spectrum => SPECTRUM_EXPRESSION,
        GeneratorKind::Fm => FM_EXPRESSION,
        GeneratorKind::PulseWidth => PULSE_EXPRESSION,
        GeneratorKind::PickedString => STRING_EXPRESSION,
        GeneratorKind::Mod => 0.0,
    };
    let unison_expression = if voices > 1 {
        unison.expression / voices as f64
    } else {
        unison.expression
    };

    let mut expression_start = config::note_size_to_volume_mult(pin_size_start)
        * chord_expression(tone.chord_size)
        * generator_expression
        * unison_expression
        * envelopes.start(AutomationTarget::NoteVolume);
    let mut expression_end = config::note_size_to_volume_mult(pin_size_end)
        * chord_expression(tone.chord_size)
        * generator_expression
        * unison_expression
        * envelopes.end(AutomationTarget::NoteVolume);

    // Fade-in, unless the tone carried over seamlessly.
    let fade_in_seconds = instrument.fade_in_seconds();
    if fade_in_seconds > 0.0 && !tone.force_continue_at_start && !tone.released {
        let fade = |seconds: f64| (seconds / fade_in_seconds).clamp(0.0, 1.0);
        expression_start *= fade(note_seconds_start);
        expression_end *= fade(note_seconds_end);
    }

    // Fade-out while released.
    if tone.released {
        let fade_ticks = instrument.fade_out_ticks().abs().max(1) as f64;
        let fade = |ticks: f64| (1.0 - ticks / fade_ticks).clamp(0.0, 1.0);
        expression_start *= fade(tone.ticks_since_released as f64);
        expression_end *= if tone.is_on_last_tick {
            0.0
        } else {
            fade(tone.ticks_since_released as f64 + 1.0)
        };
    }

    tone.expression = expression_start;
    tone.expression_delta = (expression_end - expression_start) * inv_samples;

    // --- Note filter gradients ---
    tone.note_filter_count = 0;
    if let Some(note_filter) = &instrument.note_filter {
        let mut points_start = Vec::new();
        let mut points_end = Vec::new();
        voice_state::build_effective_points(
            note_filter,
            &instrument.note_sub_filters,
            mods,
            channel_index,
            instrument_index,
            true,
            &mut points_start,
            &mut points_end,
        );
        let all_start = envelopes.start(AutomationTarget::NoteFilterAllFreqs);
        let all_end = envelopes.end(AutomationTarget::NoteFilterAllFreqs);
        let per_point_start: Vec<f64> = (0..points_start.len())
            .map(|i| envelopes.start(AutomationTarget::NoteFilterFreq(i)) * all_start)
            .collect();
        let per_point_end: Vec<f64> = (0..points_end.len())
            .map(|i| envelopes.end(AutomationTarget::NoteFilterFreq(i)) * all_end)
            .collect();
        tone.note_filter_count = voice_state::load_filter_gradients(
            sample_rate,
            &points_start,
            &points_end,
            &mut tone.note_filters,
            inv_samples,
            |i| (per_point_start[i], per_point_end[i]),
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::ModTarget;
    use crate::score::{Channel, Note, NotePin, Pattern};

    const SAMPLE_RATE: f64 = 44100.0;

    fn one_note_song(instrument: Instrument, note: Note) -> Song {
        let mut song = Song::new();
        let mut channel = Channel::new(ChannelKind::Pitch);
        channel.octave = 0;
        channel.instruments.push(instrument);
        channel.patterns.push(Pattern::new(vec![0], vec![note]));
        channel.bars = vec![1];
        song.channels.push(channel);
        song
    }

    fn render_whole_song(synth: &mut Synth, song: &Song, max_frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = Vec::new();
        let mut right = Vec::new();
        let chunk = 512;
        let mut buffer_l = vec![0.0_f32; chunk];
        let mut buffer_r = vec![0.0_f32; chunk];
        while !synth.song_ended() && left.len() < max_frames {
            synth
                .synthesize(song, &mut buffer_l, &mut buffer_r, chunk, true)
                .unwrap();
            left.extend_from_slice(&buffer_l);
            right.extend_from_slice(&buffer_r);
        }
        (left, right)
    }

    #[test]
    fn one_beat_note_produces_the_expected_run_of_samples() {
        // A triangle chip note at pitch 57 for exactly one beat at 120 BPM
        // and 44.1kHz: nonzero signal for samples_per_beat samples (plus
        // at most the release ramp), bounded by the base expression.
        let mut instrument = Instrument::chip(0);
        instrument.fade_in = 0;
        instrument.fade_out = config::FADE_OUT_NEUTRAL_INDEX;
        let note = Note::simple(vec![57], 0.0, config::PARTS_PER_BEAT as f64);
        let song = one_note_song(instrument, note);

        let config = SynthConfig::new(SAMPLE_RATE);
        let samples_per_tick = config.samples_per_tick(song.tempo);
        let samples_per_beat = SAMPLE_RATE * 60.0 / song.tempo;
        let mut synth = Synth::new(config);
        synth.set_loop_repeat_count(0);

        let (left, _right) = render_whole_song(&mut synth, &song, 400_000);

        let first_nonzero = left.iter().position(|s| s.abs() > 1e-6).unwrap();
        let last_nonzero = left.iter().rposition(|s| s.abs() > 1e-6).unwrap();
        assert!(first_nonzero < 4, "sound should start immediately");
        let sounding = (last_nonzero - first_nonzero + 1) as f64;
        assert!(
            sounding >= samples_per_beat - 2.0
                && sounding <= samples_per_beat + 3.0 * samples_per_tick,
            "expected about {} sounding samples, got {}",
            samples_per_beat,
            sounding
        );
        assert!(left.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn sustained_note_without_fades_holds_expression_at_one() {
        let mut instrument = Instrument::chip(0); // triangle: expression 1.0
        instrument.fade_in = 0;
        let note = Note::simple(vec![48], 0.0, 96.0);
        let song = one_note_song(instrument, note);

        let mut synth = Synth::new(SynthConfig::new(SAMPLE_RATE));
        let mut left = vec![0.0_f32; 2048];
        let mut right = vec![0.0_f32; 2048];
        synth.synthesize(&song, &mut left, &mut right, 2048, true).unwrap();

        let handle = synth.channel_states[0].voices[0].active[0];
        let tone = synth.pool.get(handle).unwrap();
        // All multipliers resolve to exactly 1.0 and stay there.
        assert!(
            (tone.expression - 1.0).abs() < 1e-9,
            "expression {}",
            tone.expression
        );
        assert!(tone.expression_delta.abs() < 1e-12);
    }

    #[test]
    fn released_tone_fades_to_zero_and_is_recycled() {
        let mut instrument = Instrument::chip(0);
        instrument.fade_out = 7; // 24 ticks
        let note = Note::simple(vec![48], 0.0, 24.0);
        let song = one_note_song(instrument, note);

        let config = SynthConfig::new(SAMPLE_RATE);
        let samples_per_tick = config.samples_per_tick(song.tempo);
        let mut synth = Synth::new(config);
        synth.set_loop_repeat_count(0);

        // Render through the note plus its full fade.
        let frames = ((24.0 * 2.0 + 30.0) * samples_per_tick) as usize;
        let mut left = vec![0.0_f32; frames];
        let mut right = vec![0.0_f32; frames];
        synth.synthesize(&song, &mut left, &mut right, frames, true).unwrap();

        let voices = &synth.channel_states[0].voices[0];
        assert!(voices.active.is_empty());
        assert!(voices.released.is_empty(), "fade complete: tone recycled");
        assert_eq!(synth.pool.live_slot_count(), 0);
    }

    #[test]
    fn tempo_modulation_changes_the_bar_length_in_samples() {
        // Tempo 90 for the first half of the bar, 120 after: the bar's
        // sample count must reflect the integral of the two tempos.
        let mut song = Song::new();
        song.tempo = 120.0;
        song.bar_count = 1;
        song.loop_length = 1;

        let mut pitch_channel = Channel::new(ChannelKind::Pitch);
        pitch_channel.instruments.push(Instrument::chip(0));
        pitch_channel
            .patterns
            .push(Pattern::new(vec![0], vec![Note::simple(vec![48], 0.0, 96.0)]));
        pitch_channel.bars = vec![1];
        song.channels.push(pitch_channel);

        let mut mod_channel = Channel::new(ChannelKind::Mod);
        mod_channel
            .instruments
            .push(Instrument::modulator(vec![ModTarget::Song(SongModSetting::Tempo)]));
        mod_channel.patterns.push(Pattern::new(
            vec![0],
            vec![Note {
                pitches: vec![0],
                start: 0.0,
                end: 48.0,
                pins: vec![NotePin::new(0.0, 0.0, 90.0), NotePin::new(48.0, 0.0, 90.0)],
                continues_last_pattern: false,
            }],
        ));
        mod_channel.bars = vec![1];
        song.channels.push(mod_channel);

        let config = SynthConfig::new(SAMPLE_RATE);
        let half_bar_ticks = (song.ticks_per_bar() / 2) as f64;
        let expected = half_bar_ticks * config.samples_per_tick(90.0)
            + half_bar_ticks * config.samples_per_tick(120.0);
        let constant_guess = 2.0 * half_bar_ticks * config.samples_per_tick(120.0);

        let mut synth = Synth::new(config);
        synth.set_loop_repeat_count(0);
        let (left, _) = render_whole_song(&mut synth, &song, 2_000_000);
        let rendered = left.len() as f64;

        // Rendering stops within a chunk of the bar's true end.
        assert!(
            (rendered - expected).abs() < 1024.0,
            "rendered {} vs variable-tempo integral {}",
            rendered,
            expected
        );
        assert!(
            (rendered - constant_guess).abs() > 4096.0,
            "must not match the constant-tempo approximation {}",
            constant_guess
        );
    }

    #[test]
    fn loop_repeats_the_configured_number_of_times() {
        let instrument = Instrument::chip(0);
        let note = Note::simple(vec![48], 0.0, 96.0);
        let mut song = one_note_song(instrument, note);
        song.bar_count = 1;
        song.loop_start = 0;
        song.loop_length = 1;

        let config = SynthConfig::new(SAMPLE_RATE);
        let bar_samples = config.samples_per_tick(song.tempo) * song.ticks_per_bar() as f64;
        let mut synth = Synth::new(config);
        synth.set_loop_repeat_count(2); // play 3 bars total

        let (left, _) = render_whole_song(&mut synth, &song, 2_000_000);
        let expected = bar_samples * 3.0;
        assert!(
            (left.len() as f64 - expected).abs() < 1024.0,
            "rendered {} vs expected {}",
            left.len(),
            expected
        );
    }

    #[test]
    fn live_input_sounds_without_playback() {
        let instrument = Instrument::chip(1);
        let song = one_note_song(instrument, Note::simple(vec![48], 0.0, 1.0));
        let mut synth = Synth::new(SynthConfig::new(SAMPLE_RATE));
        synth.set_live_input(Some(LiveInput {
            channel: 0,
            instrument: 0,
            pitches: vec![45],
        }));

        let mut left = vec![0.0_f32; 4096];
        let mut right = vec![0.0_f32; 4096];
        synth
            .synthesize(&song, &mut left, &mut right, 4096, false)
            .unwrap();
        let energy: f32 = left.iter().map(|s| s * s).sum();
        assert!(energy > 0.01, "live input should sound while paused");

        // Releasing the keys lets the voice fade out.
        synth.set_live_input(None);
        for _ in 0..40 {
            synth
                .synthesize(&song, &mut left, &mut right, 4096, false)
                .unwrap();
        }
        let energy: f32 = left.iter().map(|s| s * s).sum();
        assert!(
            energy < 1e-6,
            "released live voice should be silent, got {}",
            energy
        );
    }

    #[test]
    fn corrupt_score_reference_aborts_the_render_pass() {
        let instrument = Instrument::chip(0);
        let mut song = one_note_song(instrument, Note::simple(vec![48], 0.0, 24.0));
        song.channels[0].patterns[0].instruments = vec![9];

        let mut synth = Synth::new(SynthConfig::new(SAMPLE_RATE));
        let mut left = vec![0.0_f32; 256];
        let mut right = vec![0.0_f32; 256];
        assert!(synth
            .synthesize(&song, &mut left, &mut right, 256, true)
            .is_err());
    }

    #[test]
    fn output_stays_inside_unit_range_even_when_hot() {
        // A loud four-pitch chord through distortion: the limiter and
        // final clamp keep the host buffer in [-1, 1].
        let mut instrument = Instrument::chip(4); // sawtooth
        instrument.volume = 20.0;
        instrument.effects.distortion = Some(1.0);
        let note = Note::simple(vec![36, 43, 48, 55], 0.0, 96.0);
        let song = one_note_song(instrument, note);

        let mut synth = Synth::new(SynthConfig::new(SAMPLE_RATE));
        let mut left = vec![0.0_f32; 8192];
        let mut right = vec![0.0_f32; 8192];
        synth.synthesize(&song, &mut left, &mut right, 8192, true).unwrap();
        assert!(left.iter().chain(right.iter()).all(|s| s.abs() <= 1.0));
        let energy: f32 = left.iter().map(|s| s * s).sum();
        assert!(energy > 1.0);
    }

    #[test]
    fn seeking_resets_transport_and_state() {
        let instrument = Instrument::chip(0);
        let note = Note::simple(vec![48], 0.0, 96.0);
        let mut song = one_note_song(instrument, note);
        song.bar_count = 4;
        song.loop_length = 4;
        song.channels[0].bars = vec![1, 1, 1, 1];

        let mut synth = Synth::new(SynthConfig::new(SAMPLE_RATE));
        let mut left = vec![0.0_f32; 4096];
        let mut right = vec![0.0_f32; 4096];
        synth.synthesize(&song, &mut left, &mut right, 4096, true).unwrap();
        synth.seek_to_bar(2);
        assert_eq!(synth.current_bar(), 2);
        assert_eq!(synth.pool.live_slot_count(), 0, "seek releases all tones");
        synth.synthesize(&song, &mut left, &mut right, 4096, true).unwrap();
        let energy: f32 = left.iter().map(|s| s * s).sum();
        assert!(energy > 0.01, "playback resumes after seek");
    }

    #[test]
    fn arpeggio_cycles_through_chord_pitches() {
        let mut instrument = Instrument::chip(0);
        instrument.chord = ChordPolicy::Arpeggio;
        instrument.arpeggio_speed = 0.25;
        let note = Note::simple(vec![48, 60], 0.0, 96.0);
        let song = one_note_song(instrument, note);

        let config = SynthConfig::new(SAMPLE_RATE);
        let mut synth = Synth::new(config);
        // Watch the tone's phase delta across the bar: both chord pitches
        // should appear as the arpeggio clock advances.
        let mut left = vec![0.0_f32; 1024];
        let mut right = vec![0.0_f32; 1024];
        let mut deltas = std::collections::BTreeSet::new();
        for _ in 0..40 {
            synth.synthesize(&song, &mut left, &mut right, 1024, true).unwrap();
            if let Some(&handle) = synth.channel_states[0].voices[0].active.first() {
                if let Some(tone) = synth.pool.get(handle) {
                    deltas.insert((tone.phase_deltas[0] * 1e9) as i64);
                }
            }
        }
        assert!(
            deltas.len() >= 2,
            "arpeggio should alternate between pitches, saw {:?}",
            deltas
        );
    }
}
