// src/synth/voice_state.rs

//! Per-(channel, instrument) render state, recomputed once per tick.
//!
//! `compute_tick` resolves every effect's start/end parameters (preferring
//! live modulation overrides over static settings), converts them to
//! per-sample deltas for interpolation inside the effects loop, rebuilds
//! the EQ coefficient gradients, and manages the lazily grown delay rings.
//! When an instrument stops receiving tones, the state fades its delay
//! input over the estimated tail of its delay effects, then zeroes the
//! rings and goes dormant.

use crate::config::{self, SynthConfig, DENORMAL_EPSILON};
use crate::filtering::{DynamicBiquadFilter, FilterCoefficients};
use crate::instrument::{
    FilterControlPoint, FilterElement, FilterModTarget, FilterSettings, Instrument,
    InstrumentModSetting,
};
use crate::synth::modulation::ModValueTable;

// --- Effect constants ---

/// Maximum inter-channel delay used for panning.
pub const PAN_MAX_DELAY_SECONDS: f64 = 0.0013;

pub const CHORUS_DELAY_RANGE_SECONDS: f64 = 0.0034;
pub const CHORUS_DELAY_OFFSETS: [[f64; 3]; 2] = [[1.51, 2.10, 3.35], [1.47, 2.15, 3.25]];
pub const CHORUS_PHASE_OFFSETS: [[f64; 3]; 2] = [[0.0, 2.1, 4.2], [3.2, 5.3, 1.0]];
pub const CHORUS_PERIOD_SECONDS: f64 = 2.0;
pub const CHORUS_MAX_DELAY_SECONDS: f64 = (3.35 + 1.0) * CHORUS_DELAY_RANGE_SECONDS;
/// Tap polarity; the alternating sign gives the phase cancellation that
/// widens the image.
pub const CHORUS_TAP_SIGNS: [f64; 3] = [1.0, -1.0, 1.0];

/// Feedback-path damping corner for the echo.
pub const ECHO_SHELF_HZ: f64 = 3000.0;
pub const ECHO_SHELF_GAIN: f64 = 0.55;

/// The four reverb line lengths at 44.1kHz, mutually non-harmonic.
pub const REVERB_LINE_LENGTHS: [f64; 4] = [3041.0, 6426.0, 10907.0, 13413.0];
pub const REVERB_SHELF_HZ: f64 = 6000.0;
pub const REVERB_SHELF_GAIN: f64 = 0.6;

/// Residual-energy threshold for tail estimation.
const TAIL_FLOOR: f64 = 1.0e-4;
const MAX_TAIL_CIRCULATIONS: f64 = 60.0;

// --- Delay ring ---

/// A power-of-two float ring with a single write cursor, read by
/// fractional tap delays. Grown, never shrunk; growth preserves existing
/// content so an in-flight echo survives a resize.
#[derive(Clone, Debug, Default)]
pub struct DelayRing {
    buffer: Vec<f64>,
    mask: usize,
    pos: usize,
}

impl DelayRing {
    /// Grows the ring to hold at least `samples` of delay.
    pub fn ensure(&mut self, samples: usize) {
        let needed = (samples + 4).next_power_of_two();
        if self.buffer.len() >= needed {
            return;
        }
        let mut grown = vec![0.0; needed];
        if !self.buffer.is_empty() {
            // Oldest-to-newest copy keeps every existing tap delay valid.
            let old_len = self.buffer.len();
            for i in 0..old_len {
                grown[i] = self.buffer[(self.pos + i) & self.mask];
            }
            self.pos = old_len;
        }
        self.buffer = grown;
        self.mask = needed - 1;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
    }

    /// Linear-interpolated read `delay` samples behind the write cursor.
    #[inline(always)]
    pub fn read(&self, delay: f64) -> f64 {
        debug_assert!(!self.buffer.is_empty());
        let delay = delay.max(1.0);
        let position = self.pos as f64 + self.buffer.len() as f64 - delay;
        let index = position.floor() as usize;
        let fraction = position - position.floor();
        let sample0 = self.buffer[index & self.mask];
        let sample1 = self.buffer[(index + 1) & self.mask];
        sample0 + (sample1 - sample0) * fraction
    }

    /// Writes one sample and advances the cursor.
    #[inline(always)]
    pub fn write(&mut self, mut value: f64) {
        if value.abs() < DENORMAL_EPSILON {
            value = 0.0;
        }
        self.buffer[self.pos] = value;
        self.pos = (self.pos + 1) & self.mask;
    }

    pub fn energy(&self) -> f64 {
        self.buffer.iter().map(|s| s * s).sum()
    }
}

// --- Filter resolution helpers ---

/// Builds the effective control points for a filter at the start and end
/// of the tick, applying modulation overrides: a whole-filter swap selects
/// an alternate definition, a control-point edit mutates these private
/// copies so the instrument's own definition is never touched.
#[allow(clippy::too_many_arguments)]
pub fn build_effective_points(
    base: &FilterSettings,
    sub_filters: &[FilterSettings],
    table: &ModValueTable,
    channel: usize,
    instrument: usize,
    is_note_filter: bool,
    out_start: &mut Vec<FilterControlPoint>,
    out_end: &mut Vec<FilterControlPoint>,
) {
    let wrap = |target: FilterModTarget| {
        if is_note_filter {
            InstrumentModSetting::NoteFilter(target)
        } else {
            InstrumentModSetting::EqFilter(target)
        }
    };

    let mut source = base;
    if let Some(swap) = table.instrument_value(channel, instrument, wrap(FilterModTarget::WholeFilter))
    {
        let index = swap.start.max(0.0) as usize;
        if let Some(alternate) = sub_filters.get(index) {
            source = alternate;
        }
    }

    source.write_points(out_start);
    out_end.clear();
    out_end.extend_from_slice(out_start);

    for index in 0..out_start.len() {
        for element in [FilterElement::Frequency, FilterElement::Gain] {
            let setting = wrap(FilterModTarget::ControlPoint { index, element });
            if let Some(value) = table.instrument_value(channel, instrument, setting) {
                match element {
                    FilterElement::Frequency => {
                        out_start[index].freq = value.start;
                        out_end[index].freq = value.end;
                    }
                    FilterElement::Gain => {
                        out_start[index].gain = value.start;
                        out_end[index].gain = value.end;
                    }
                }
            }
        }
    }
}

/// Loads coefficient gradients for a cascade from start/end control
/// points. If the filter's shape differs between the boundaries (point
/// count or kind, not just parameters), the end shape is used for the
/// whole tick to keep the interpolation stable. `freq_mults` supplies
/// per-point envelope multipliers on the corner frequency.
pub fn load_filter_gradients(
    sample_rate: f64,
    start_points: &[FilterControlPoint],
    end_points: &[FilterControlPoint],
    filters: &mut [DynamicBiquadFilter],
    inv_samples: f64,
    mut freq_mults: impl FnMut(usize) -> (f64, f64),
) -> usize {
    let same_shape = start_points.len() == end_points.len()
        && start_points
            .iter()
            .zip(end_points.iter())
            .all(|(a, b)| a.kind == b.kind);
    let effective_start: &[FilterControlPoint] =
        if same_shape { start_points } else { end_points };

    let count = effective_start.len().min(filters.len());
    for i in 0..count {
        let (mult_start, mult_end) = freq_mults(i);
        let start_point = effective_start[i];
        let end_point = end_points[i];
        let start = crate::filtering::control_point_coefficients(
            start_point.kind,
            start_point.freq * mult_start,
            start_point.gain,
            sample_rate,
        );
        let end = crate::filtering::control_point_coefficients(
            end_point.kind,
            end_point.freq * mult_end,
            end_point.gain,
            sample_rate,
        );
        filters[i].load_gradient(start, end, inv_samples);
    }
    count
}

// --- The render state ---

pub struct InstrumentRenderState {
    pub awake: bool,
    /// Set by the scheduler whenever a tone will render this tick; cleared
    /// by `compute_tick`.
    pub tones_active_this_tick: bool,
    flushing: bool,
    flush_remaining_samples: f64,
    flush_total_samples: f64,

    /// Multiplier on everything written into delay lines, ramped to zero
    /// during idle shutdown so the tails fade without discontinuities.
    pub delay_input_mult: f64,
    pub delay_input_mult_delta: f64,

    pub mix_volume: f64,
    pub mix_volume_delta: f64,

    /// Arpeggio clock in steps, advanced per tick by the instrument's
    /// arpeggio speed, reset by the one-shot modulation setting.
    pub arpeggio_time: f64,

    pub distortion_enabled: bool,
    pub bitcrusher_enabled: bool,
    pub chorus_enabled: bool,
    pub echo_enabled: bool,
    pub reverb_enabled: bool,

    // EQ cascade.
    pub eq_filters: [DynamicBiquadFilter; config::FILTER_POINT_MAX],
    pub eq_filter_count: usize,
    pub eq_input1: f64,
    pub eq_input2: f64,

    // Distortion.
    pub distortion_drive: f64,
    pub distortion_drive_delta: f64,
    pub distortion_prev_input: f64,

    // Bitcrusher.
    pub bitcrusher_phase: f64,
    pub bitcrusher_rate: f64,
    pub bitcrusher_rate_delta: f64,
    pub bitcrusher_scale: f64,
    pub bitcrusher_scale_delta: f64,
    pub bitcrusher_held: f64,

    // Panning.
    pub pan_ring: DelayRing,
    pub pan_vol_l: f64,
    pub pan_vol_l_delta: f64,
    pub pan_vol_r: f64,
    pub pan_vol_r_delta: f64,
    pub pan_offset_l: f64,
    pub pan_offset_l_delta: f64,
    pub pan_offset_r: f64,
    pub pan_offset_r_delta: f64,

    // Chorus.
    pub chorus_ring_l: DelayRing,
    pub chorus_ring_r: DelayRing,
    pub chorus_wet: f64,
    pub chorus_wet_delta: f64,
    pub chorus_phase: f64,
    pub chorus_phase_delta: f64,

    // Echo.
    pub echo_ring_l: DelayRing,
    pub echo_ring_r: DelayRing,
    pub echo_feedback: f64,
    pub echo_feedback_delta: f64,
    pub echo_delay: f64,
    pub echo_delay_delta: f64,
    pub echo_shelf: FilterCoefficients,
    pub echo_shelf_input_l: f64,
    pub echo_shelf_input_r: f64,
    pub echo_shelf_output_l: f64,
    pub echo_shelf_output_r: f64,

    // Reverb.
    pub reverb_rings: [DelayRing; 4],
    pub reverb_line_lengths: [f64; 4],
    pub reverb_wet: f64,
    pub reverb_wet_delta: f64,
    pub reverb_feedback: f64,
    pub reverb_feedback_delta: f64,
    pub reverb_shelf: FilterCoefficients,
    pub reverb_shelf_inputs: [f64; 4],
    pub reverb_shelf_outputs: [f64; 4],

    // Scratch buffers for filter resolution, reused every tick.
    points_start: Vec<FilterControlPoint>,
    points_end: Vec<FilterControlPoint>,
}

impl Default for InstrumentRenderState {
    fn default() -> Self {
        Self {
            awake: false,
            tones_active_this_tick: false,
            flushing: false,
            flush_remaining_samples: 0.0,
            flush_total_samples: 0.0,
            delay_input_mult: 1.0,
            delay_input_mult_delta: 0.0,
            mix_volume: 1.0,
            mix_volume_delta: 0.0,
            arpeggio_time: 0.0,
            distortion_enabled: false,
            bitcrusher_enabled: false,
            chorus_enabled: false,
            echo_enabled: false,
            reverb_enabled: false,
            eq_filters: [DynamicBiquadFilter::default(); config::FILTER_POINT_MAX],
            eq_filter_count: 0,
            eq_input1: 0.0,
            eq_input2: 0.0,
            distortion_drive: 0.0,
            distortion_drive_delta: 0.0,
            distortion_prev_input: 0.0,
            bitcrusher_phase: 0.0,
            bitcrusher_rate: 1.0,
            bitcrusher_rate_delta: 0.0,
            bitcrusher_scale: 128.0,
            bitcrusher_scale_delta: 0.0,
            bitcrusher_held: 0.0,
            pan_ring: DelayRing::default(),
            pan_vol_l: 1.0,
            pan_vol_l_delta: 0.0,
            pan_vol_r: 1.0,
            pan_vol_r_delta: 0.0,
            pan_offset_l: 0.0,
            pan_offset_l_delta: 0.0,
            pan_offset_r: 0.0,
            pan_offset_r_delta: 0.0,
            chorus_ring_l: DelayRing::default(),
            chorus_ring_r: DelayRing::default(),
            chorus_wet: 0.0,
            chorus_wet_delta: 0.0,
            chorus_phase: 0.0,
            chorus_phase_delta: 0.0,
            echo_ring_l: DelayRing::default(),
            echo_ring_r: DelayRing::default(),
            echo_feedback: 0.0,
            echo_feedback_delta: 0.0,
            echo_delay: 1.0,
            echo_delay_delta: 0.0,
            echo_shelf: FilterCoefficients::default(),
            echo_shelf_input_l: 0.0,
            echo_shelf_input_r: 0.0,
            echo_shelf_output_l: 0.0,
            echo_shelf_output_r: 0.0,
            reverb_rings: Default::default(),
            reverb_line_lengths: [0.0; 4],
            reverb_wet: 0.0,
            reverb_wet_delta: 0.0,
            reverb_feedback: 0.0,
            reverb_feedback_delta: 0.0,
            reverb_shelf: FilterCoefficients::default(),
            reverb_shelf_inputs: [0.0; 4],
            reverb_shelf_outputs: [0.0; 4],
            points_start: Vec::new(),
            points_end: Vec::new(),
        }
    }
}

impl InstrumentRenderState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any work remains: a tone is sounding or delay tails are
    /// still audible.
    pub fn needs_rendering(&self) -> bool {
        self.awake || self.tones_active_this_tick
    }

    /// Resolves everything for the coming tick.
    pub fn compute_tick(
        &mut self,
        config: &SynthConfig,
        channel_index: usize,
        instrument_index: usize,
        instrument: &Instrument,
        mods: &ModValueTable,
        samples_per_tick: f64,
    ) {
        let inv_samples = 1.0 / samples_per_tick;
        let sample_rate = config.sample_rate;
        let samples_per_part = samples_per_tick * config::TICKS_PER_PART as f64;

        let tones_active = std::mem::take(&mut self.tones_active_this_tick);
        if tones_active {
            self.awake = true;
            self.flushing = false;
            self.flush_remaining_samples = 0.0;
            self.delay_input_mult_delta = (1.0 - self.delay_input_mult) * inv_samples;
        }

        self.distortion_enabled = instrument.effects.distortion.is_some();
        self.bitcrusher_enabled = instrument.effects.bitcrusher.is_some();
        self.chorus_enabled = instrument.effects.chorus.is_some();
        self.echo_enabled = instrument.effects.echo.is_some();
        self.reverb_enabled = instrument.effects.reverb.is_some();

        // --- Volume (mix) ---
        let (vol_start, vol_end) = mods.instrument_value_or(
            channel_index,
            instrument_index,
            InstrumentModSetting::Volume,
            instrument.volume,
        );
        let mix_start = config::instrument_volume_mult(vol_start);
        let mix_end = config::instrument_volume_mult(vol_end);
        self.mix_volume = mix_start;
        self.mix_volume_delta = (mix_end - mix_start) * inv_samples;

        // --- EQ filter gradients ---
        build_effective_points(
            &instrument.eq_filter,
            &instrument.eq_sub_filters,
            mods,
            channel_index,
            instrument_index,
            false,
            &mut self.points_start,
            &mut self.points_end,
        );
        let points_start = std::mem::take(&mut self.points_start);
        let points_end = std::mem::take(&mut self.points_end);
        self.eq_filter_count = load_filter_gradients(
            sample_rate,
            &points_start,
            &points_end,
            &mut self.eq_filters,
            inv_samples,
            |_| (1.0, 1.0),
        );
        self.points_start = points_start;
        self.points_end = points_end;

        // Contain any numerical blowup before it spreads.
        if self.eq_filters[..self.eq_filter_count]
            .iter()
            .any(|f| f.state_is_unstable())
            || !self.eq_input1.is_finite()
        {
            log::warn!("EQ filter state went non-finite; resetting cascade");
            crate::filtering::reset_filters(&mut self.eq_filters);
            self.eq_input1 = 0.0;
            self.eq_input2 = 0.0;
        }

        // --- Distortion ---
        if self.distortion_enabled {
            let base = instrument.effects.distortion.unwrap_or(0.0);
            let (start, end) = mods.instrument_value_or(
                channel_index,
                instrument_index,
                InstrumentModSetting::Distortion,
                base,
            );
            let drive_start = start.clamp(0.0, 1.0) * 14.0;
            let drive_end = end.clamp(0.0, 1.0) * 14.0;
            self.distortion_drive = drive_start;
            self.distortion_drive_delta = (drive_end - drive_start) * inv_samples;
        }

        // --- Bitcrusher ---
        if let Some(settings) = instrument.effects.bitcrusher {
            let (freq_start, freq_end) = mods.instrument_value_or(
                channel_index,
                instrument_index,
                InstrumentModSetting::BitcrusherFreq,
                settings.freq,
            );
            let rate_of = |slider: f64| {
                let hold_hz = sample_rate * 0.5 * 2.0_f64.powf(-9.0 * slider.clamp(0.0, 1.0));
                hold_hz / sample_rate
            };
            let rate_start = rate_of(freq_start);
            let rate_end = rate_of(freq_end);
            self.bitcrusher_rate = rate_start;
            self.bitcrusher_rate_delta = (rate_end - rate_start) * inv_samples;

            let (quant_start, quant_end) = mods.instrument_value_or(
                channel_index,
                instrument_index,
                InstrumentModSetting::BitcrusherQuantization,
                settings.quantization,
            );
            let scale_of =
                |slider: f64| 2.0_f64.powf((1.0 - slider.clamp(0.0, 1.0)) * 7.0);
            let scale_start = scale_of(quant_start);
            let scale_end = scale_of(quant_end);
            self.bitcrusher_scale = scale_start;
            self.bitcrusher_scale_delta = (scale_end - scale_start) * inv_samples;
        }

        // --- Panning ---
        {
            let (pan_start, pan_end) = mods.instrument_value_or(
                channel_index,
                instrument_index,
                InstrumentModSetting::Pan,
                instrument.pan,
            );
            let vol_l = |pan: f64| (1.0 - pan).min(1.0).max(0.0);
            let vol_r = |pan: f64| (1.0 + pan).min(1.0).max(0.0);
            self.pan_vol_l = vol_l(pan_start);
            self.pan_vol_l_delta = (vol_l(pan_end) - vol_l(pan_start)) * inv_samples;
            self.pan_vol_r = vol_r(pan_start);
            self.pan_vol_r_delta = (vol_r(pan_end) - vol_r(pan_start)) * inv_samples;

            let max_delay = PAN_MAX_DELAY_SECONDS * sample_rate * instrument.pan_delay;
            let off_l = |pan: f64| pan.max(0.0) * max_delay;
            let off_r = |pan: f64| (-pan).max(0.0) * max_delay;
            self.pan_offset_l = off_l(pan_start);
            self.pan_offset_l_delta = (off_l(pan_end) - off_l(pan_start)) * inv_samples;
            self.pan_offset_r = off_r(pan_start);
            self.pan_offset_r_delta = (off_r(pan_end) - off_r(pan_start)) * inv_samples;
            self.pan_ring
                .ensure((PAN_MAX_DELAY_SECONDS * sample_rate) as usize + 2);
        }

        // --- Chorus ---
        if self.chorus_enabled {
            let base = instrument.effects.chorus.unwrap_or(0.0);
            let (start, end) = mods.instrument_value_or(
                channel_index,
                instrument_index,
                InstrumentModSetting::ChorusAmount,
                base,
            );
            self.chorus_wet = start.clamp(0.0, 1.0);
            self.chorus_wet_delta = (end.clamp(0.0, 1.0) - self.chorus_wet) * inv_samples;
            self.chorus_phase_delta =
                std::f64::consts::TAU / (CHORUS_PERIOD_SECONDS * sample_rate);
            let max_delay = (CHORUS_MAX_DELAY_SECONDS * sample_rate) as usize + 2;
            self.chorus_ring_l.ensure(max_delay);
            self.chorus_ring_r.ensure(max_delay);
        }

        // --- Echo ---
        if let Some(settings) = instrument.effects.echo {
            let (sustain_start, sustain_end) = mods.instrument_value_or(
                channel_index,
                instrument_index,
                InstrumentModSetting::EchoSustain,
                settings.sustain,
            );
            let feedback_of = |sustain: f64| sustain.clamp(0.0, 1.0) * 0.9;
            self.echo_feedback = feedback_of(sustain_start);
            self.echo_feedback_delta =
                (feedback_of(sustain_end) - self.echo_feedback) * inv_samples;

            let delay_samples = (settings.delay_parts.max(0.5) * samples_per_part).max(2.0);
            // Glide toward a changed delay time instead of snapping, at a
            // bounded rate per sample.
            self.echo_delay_delta =
                ((delay_samples - self.echo_delay) * inv_samples).clamp(-0.25, 0.25);
            // On the first tick (or after a reset) jump straight there.
            if self.echo_delay <= 1.0 {
                self.echo_delay = delay_samples;
                self.echo_delay_delta = 0.0;
            }
            let capacity = delay_samples.ceil() as usize + 2;
            self.echo_ring_l.ensure(capacity);
            self.echo_ring_r.ensure(capacity);
            self.echo_shelf = FilterCoefficients::high_shelf_1st_order(
                std::f64::consts::TAU * ECHO_SHELF_HZ / sample_rate,
                ECHO_SHELF_GAIN,
            );
        }

        // --- Reverb ---
        if self.reverb_enabled {
            let base = instrument.effects.reverb.unwrap_or(0.0);
            let (start, end) = mods.instrument_value_or(
                channel_index,
                instrument_index,
                InstrumentModSetting::ReverbAmount,
                base,
            );
            let wet_of = |amount: f64| amount.clamp(0.0, 1.0) * 0.5;
            let feedback_of = |amount: f64| 0.5 + amount.clamp(0.0, 1.0) * 0.45;
            self.reverb_wet = wet_of(start);
            self.reverb_wet_delta = (wet_of(end) - self.reverb_wet) * inv_samples;
            self.reverb_feedback = feedback_of(start);
            self.reverb_feedback_delta =
                (feedback_of(end) - self.reverb_feedback) * inv_samples;

            let scale = sample_rate / 44100.0;
            for (i, ring) in self.reverb_rings.iter_mut().enumerate() {
                let length = REVERB_LINE_LENGTHS[i] * scale;
                self.reverb_line_lengths[i] = length;
                ring.ensure(length.ceil() as usize + 2);
            }
            self.reverb_shelf = FilterCoefficients::high_shelf_1st_order(
                std::f64::consts::TAU * REVERB_SHELF_HZ / sample_rate,
                REVERB_SHELF_GAIN,
            );
        }

        // --- Idle fade & dormancy ---
        if !tones_active && self.awake {
            if !self.flushing {
                self.flushing = true;
                self.flush_total_samples = self.estimate_tail_samples(samples_per_tick);
                self.flush_remaining_samples = self.flush_total_samples;
            }
            // Ramp the delay input toward silence across the whole tail.
            let ramp = if self.flush_total_samples > 0.0 {
                self.delay_input_mult / (self.flush_remaining_samples.max(1.0))
            } else {
                self.delay_input_mult
            };
            self.delay_input_mult_delta = -ramp;
            self.flush_remaining_samples -= samples_per_tick;
            if self.flush_remaining_samples <= 0.0 {
                self.go_dormant();
            }
        }
    }

    /// Upper bound on how long the delay effects stay audible after input
    /// stops, from each enabled effect's attenuation half-life.
    fn estimate_tail_samples(&self, samples_per_tick: f64) -> f64 {
        let mut tail = samples_per_tick * 4.0;
        tail = tail.max(self.pan_offset_l.max(self.pan_offset_r) + 64.0);
        if self.chorus_enabled {
            tail = tail.max(self.chorus_ring_l.len() as f64);
        }
        if self.echo_enabled {
            let feedback = self.echo_feedback.clamp(0.0, 0.999);
            let circulations = if feedback <= 0.0 {
                1.0
            } else {
                (TAIL_FLOOR.ln() / feedback.ln()).min(MAX_TAIL_CIRCULATIONS)
            };
            tail = tail.max(self.echo_delay * circulations.max(1.0));
        }
        if self.reverb_enabled {
            let feedback = self.reverb_feedback.clamp(0.1, 0.999);
            let circulations = (TAIL_FLOOR.ln() / feedback.ln()).min(MAX_TAIL_CIRCULATIONS);
            let longest = self
                .reverb_line_lengths
                .iter()
                .fold(0.0_f64, |a, &b| a.max(b));
            tail = tail.max(longest * circulations.max(1.0));
        }
        tail
    }

    /// Zeroes every delay line and filter memory and marks the instrument
    /// dormant.
    fn go_dormant(&mut self) {
        self.awake = false;
        self.flushing = false;
        self.delay_input_mult = 1.0;
        self.delay_input_mult_delta = 0.0;
        self.pan_ring.clear();
        self.chorus_ring_l.clear();
        self.chorus_ring_r.clear();
        self.echo_ring_l.clear();
        self.echo_ring_r.clear();
        for ring in &mut self.reverb_rings {
            ring.clear();
        }
        crate::filtering::reset_filters(&mut self.eq_filters);
        self.eq_input1 = 0.0;
        self.eq_input2 = 0.0;
        self.echo_shelf_input_l = 0.0;
        self.echo_shelf_input_r = 0.0;
        self.echo_shelf_output_l = 0.0;
        self.echo_shelf_output_r = 0.0;
        self.reverb_shelf_inputs = [0.0; 4];
        self.reverb_shelf_outputs = [0.0; 4];
        self.echo_delay = 1.0;
        self.bitcrusher_held = 0.0;
        self.bitcrusher_phase = 0.0;
        self.distortion_prev_input = 0.0;
    }

    /// Forced full reset, used on seek.
    pub fn reset(&mut self) {
        self.go_dormant();
        self.arpeggio_time = 0.0;
        self.mix_volume = 1.0;
        self.mix_volume_delta = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{EchoSettings, FilterKind};

    const TEMPO: f64 = 120.0;

    #[test]
    fn delay_ring_reads_what_was_written() {
        let mut ring = DelayRing::default();
        ring.ensure(64);
        for i in 0..100 {
            ring.write(i as f64);
        }
        // The sample written 10 writes ago was 90.
        assert!((ring.read(10.0) - 90.0).abs() < 1e-9);
        // Fractional reads interpolate between neighbors.
        assert!((ring.read(10.5) - 89.5).abs() < 1e-9);
    }

    #[test]
    fn delay_ring_growth_preserves_content() {
        let mut ring = DelayRing::default();
        ring.ensure(8);
        for i in 0..12 {
            ring.write(i as f64);
        }
        let before = ring.read(3.0);
        ring.ensure(1000);
        assert!((ring.read(3.0) - before).abs() < 1e-9);
    }

    #[test]
    fn compute_tick_resolves_echo_and_allocates_rings() {
        let config = SynthConfig::new(44100.0);
        let mut instrument = Instrument::chip(0);
        instrument.effects.echo = Some(EchoSettings {
            sustain: 0.5,
            delay_parts: 6.0,
        });
        let mut state = InstrumentRenderState::new();
        state.tones_active_this_tick = true;
        let mods = ModValueTable::new();
        let samples_per_tick = config.samples_per_tick(TEMPO);
        state.compute_tick(&config, 0, 0, &instrument, &mods, samples_per_tick);
        assert!(state.echo_enabled);
        assert!(state.echo_ring_l.len() > 0);
        assert!((state.echo_feedback - 0.45).abs() < 1e-9);
        let expected_delay = 6.0 * samples_per_tick * config::TICKS_PER_PART as f64;
        assert!((state.echo_delay - expected_delay).abs() < 1.0);
    }

    #[test]
    fn idle_instrument_eventually_goes_dormant_and_clears_rings() {
        let config = SynthConfig::new(44100.0);
        let instrument = Instrument::chip(0);
        let mut state = InstrumentRenderState::new();
        let mods = ModValueTable::new();
        let samples_per_tick = config.samples_per_tick(TEMPO);

        state.tones_active_this_tick = true;
        state.compute_tick(&config, 0, 0, &instrument, &mods, samples_per_tick);
        assert!(state.awake);
        state.pan_ring.ensure(16);
        state.pan_ring.write(0.5);

        // No delay effects are enabled, so the tail is short.
        for _ in 0..64 {
            state.compute_tick(&config, 0, 0, &instrument, &mods, samples_per_tick);
            if !state.awake {
                break;
            }
        }
        assert!(!state.awake, "instrument should go dormant");
        assert_eq!(state.pan_ring.energy(), 0.0);
        assert_eq!(state.delay_input_mult, 1.0);
    }

    #[test]
    fn echo_extends_the_idle_tail() {
        let config = SynthConfig::new(44100.0);
        let mut instrument = Instrument::chip(0);
        instrument.effects.echo = Some(EchoSettings {
            sustain: 0.9,
            delay_parts: 12.0,
        });
        let mods = ModValueTable::new();
        let samples_per_tick = config.samples_per_tick(TEMPO);

        let mut state = InstrumentRenderState::new();
        state.tones_active_this_tick = true;
        state.compute_tick(&config, 0, 0, &instrument, &mods, samples_per_tick);
        // One idle tick starts the flush without finishing it.
        state.compute_tick(&config, 0, 0, &instrument, &mods, samples_per_tick);
        assert!(state.awake, "long echo tail must keep the instrument awake");
        assert!(state.delay_input_mult_delta < 0.0);
    }

    #[test]
    fn eq_filter_gradient_resolution_counts_points() {
        let config = SynthConfig::new(48000.0);
        let mut instrument = Instrument::chip(0);
        instrument.eq_filter = FilterSettings::from_points(vec![
            FilterControlPoint::new(FilterKind::HighPass, 100.0, 0.7),
            FilterControlPoint::new(FilterKind::Peak, 2000.0, 1.5),
        ]);
        let mut state = InstrumentRenderState::new();
        state.tones_active_this_tick = true;
        let mods = ModValueTable::new();
        state.compute_tick(&config, 0, 0, &instrument, &mods, 512.0);
        assert_eq!(state.eq_filter_count, 2);
    }

    #[test]
    fn shape_change_falls_back_to_end_shape() {
        let start = [FilterControlPoint::new(FilterKind::LowPass, 1000.0, 1.0)];
        let end = [FilterControlPoint::new(FilterKind::HighPass, 1000.0, 1.0)];
        let mut filters = [DynamicBiquadFilter::default(); 2];
        let count =
            load_filter_gradients(44100.0, &start, &end, &mut filters, 1.0 / 128.0, |_| (1.0, 1.0));
        assert_eq!(count, 1);
        // With the end shape used for both boundaries the gradient is flat.
        assert!(filters[0].b0_delta.abs() < 1e-12);
    }
}
