// src/config.rs

//! Immutable engine configuration.
//!
//! Everything the renderer needs to know that is not part of a particular
//! song lives here: transport granularity, pitch math, the base chip and
//! noise wavetables (with their running integrals), the FM routing tables
//! and the shared sine lookup table. A `SynthConfig` is constructed once by
//! the host and passed by reference into every component; there is no
//! process-wide mutable state.

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// --- Transport granularity ---

/// Score time is measured in "parts"; a beat is subdivided into this many.
pub const PARTS_PER_BEAT: usize = 24;
/// Envelopes and automation are evaluated on a finer "tick" grid.
pub const TICKS_PER_PART: usize = 2;
/// Ticks per beat, the rate at which all per-tick state is recomputed.
pub const TICKS_PER_BEAT: usize = PARTS_PER_BEAT * TICKS_PER_PART;

// --- Pitch space ---

pub const PITCHES_PER_OCTAVE: i32 = 12;
/// Highest addressable pitch in a pitched channel.
pub const MAX_PITCH: i32 = 84;
/// Noise channels address a single octave of playback rates.
pub const NOISE_PITCH_COUNT: i32 = 12;
/// Frequency of pitch 0 (C1).
pub const BASE_PITCH_FREQUENCY: f64 = 32.703195662574764;

/// Note pin sizes range over `0..=NOTE_SIZE_MAX`.
pub const NOTE_SIZE_MAX: f64 = 3.0;

/// The most simultaneous pitches one note may carry.
pub const MAX_CHORD_SIZE: usize = 4;
/// Unison rendering uses at most this many phase-offset voices.
pub const UNISON_VOICE_MAX: usize = 2;

pub const OPERATOR_COUNT: usize = 4;
/// A filter definition may carry up to this many control points.
pub const FILTER_POINT_MAX: usize = 8;
/// Modulation instruments expose this many target slots.
pub const MOD_SLOT_COUNT: usize = 6;

/// Values with magnitude below this are flushed to zero in delay lines and
/// filter memory to avoid denormal slowdowns.
pub const DENORMAL_EPSILON: f64 = 1e-24;

// --- Lookup tables ---

const LUT_SIZE: usize = 4096;

/// A generic lookup table for expensive functions, read with linear
/// interpolation.
pub struct Lut {
    table: [f64; LUT_SIZE],
    min_input: f64,
    max_input: f64,
    input_range: f64,
}

impl Lut {
    fn new<F>(min_input: f64, max_input: f64, f: F) -> Self
    where
        F: Fn(f64) -> f64,
    {
        let mut table = [0.0; LUT_SIZE];
        let input_range = max_input - min_input;
        for (i, slot) in table.iter_mut().enumerate() {
            let phase = i as f64 / (LUT_SIZE - 1) as f64;
            *slot = f(min_input + phase * input_range);
        }
        Self {
            table,
            min_input,
            max_input,
            input_range,
        }
    }

    #[inline(always)]
    pub fn get_interpolated(&self, input: f64) -> f64 {
        let clamped = input.clamp(self.min_input, self.max_input);
        let scaled = (clamped - self.min_input) / self.input_range * (LUT_SIZE - 1) as f64;
        let idx = scaled.floor() as usize;
        if idx >= LUT_SIZE - 1 {
            return self.table[LUT_SIZE - 1];
        }
        let frac = scaled.fract();
        self.table[idx] + frac * (self.table[idx + 1] - self.table[idx])
    }
}

/// 2^(x/12) over +/- 5 octaves, for converting semitone intervals to
/// frequency ratios during tick computation.
pub static INTERVAL_RATIO_LUT: Lazy<Lut> =
    Lazy::new(|| Lut::new(-60.0, 60.0, |x| 2.0_f64.powf(x / 12.0)));

pub const SINE_WAVE_LENGTH: usize = 1 << 13;
pub const SINE_WAVE_MASK: usize = SINE_WAVE_LENGTH - 1;

/// Shared sine table for the FM operators; one guard sample past the end so
/// interpolating reads never need a second wrap.
pub static SINE_WAVE: Lazy<Vec<f64>> = Lazy::new(|| {
    (0..=SINE_WAVE_LENGTH)
        .map(|i| (i as f64 * std::f64::consts::TAU / SINE_WAVE_LENGTH as f64).sin())
        .collect()
});

/// Converts a semitone interval to a frequency ratio via the shared LUT.
#[inline(always)]
pub fn interval_to_ratio(interval: f64) -> f64 {
    INTERVAL_RATIO_LUT.get_interpolated(interval)
}

/// Frequency in Hz of a score pitch, after the song key transposition.
#[inline]
pub fn pitch_to_frequency(pitch: f64, key: i32) -> f64 {
    BASE_PITCH_FREQUENCY * 2.0_f64.powf((pitch + key as f64) / PITCHES_PER_OCTAVE as f64)
}

// --- Setting-to-value mappings ---

/// Instrument volume slider range, in slider units (not dB).
pub const VOLUME_RANGE: f64 = 25.0;

/// Slider units to linear gain; the bottom of the range is full mute.
#[inline]
pub fn instrument_volume_mult(volume: f64) -> f64 {
    if volume <= -VOLUME_RANGE {
        0.0
    } else {
        2.0_f64.powf(volume / 10.0)
    }
}

/// Note pin size to expression multiplier. Size at the maximum maps to
/// exactly 1.0.
#[inline]
pub fn note_size_to_volume_mult(size: f64) -> f64 {
    (size.clamp(0.0, NOTE_SIZE_MAX) / NOTE_SIZE_MAX).powf(1.5)
}

/// Fade-in setting (0..=9) to seconds of attack.
pub fn fade_in_seconds(setting: usize) -> f64 {
    const TABLE: [f64; 10] = [0.0, 0.01, 0.02, 0.04, 0.06, 0.08, 0.11, 0.15, 0.2, 0.25];
    TABLE[setting.min(TABLE.len() - 1)]
}

/// Fade-out settings, in ticks. Negative entries cross-fade into the next
/// note: the tone keeps sounding that many ticks past its note's end.
pub const FADE_OUT_TICKS: [i32; 11] = [-24, -12, -6, -3, -1, 6, 12, 24, 48, 72, 96];

/// Index of the neutral fade-out (one tick, effectively none).
pub const FADE_OUT_NEUTRAL_INDEX: usize = 4;

pub fn fade_out_ticks(setting: usize) -> i32 {
    FADE_OUT_TICKS[setting.min(FADE_OUT_TICKS.len() - 1)]
}

/// FM operator amplitude setting (0..=15) to linear expression.
#[inline]
pub fn operator_amplitude_mult(amplitude: f64) -> f64 {
    (16.0_f64.powf(amplitude.clamp(0.0, 15.0) / 15.0) - 1.0) / 15.0
}

// --- FM routing tables ---

/// Which operators modulate which, for one algorithm. Operator indices are
/// zero-based; the first `carrier_count` operators are carriers, the rest
/// are modulators.
pub struct FmAlgorithm {
    pub name: &'static str,
    pub carrier_count: usize,
    pub modulated_by: [&'static [usize]; OPERATOR_COUNT],
}

pub static FM_ALGORITHMS: [FmAlgorithm; 13] = [
    FmAlgorithm { name: "1<-(2 3 4)", carrier_count: 1, modulated_by: [&[1, 2, 3], &[], &[], &[]] },
    FmAlgorithm { name: "1<-(2 3<-4)", carrier_count: 1, modulated_by: [&[1, 2], &[], &[3], &[]] },
    FmAlgorithm { name: "1<-2<-(3 4)", carrier_count: 1, modulated_by: [&[1], &[2, 3], &[], &[]] },
    FmAlgorithm { name: "1<-(2 3)<-4", carrier_count: 1, modulated_by: [&[1, 2], &[3], &[3], &[]] },
    FmAlgorithm { name: "1<-2<-3<-4", carrier_count: 1, modulated_by: [&[1], &[2], &[3], &[]] },
    FmAlgorithm { name: "1<-3 2<-4", carrier_count: 2, modulated_by: [&[2], &[3], &[], &[]] },
    FmAlgorithm { name: "1 2<-(3 4)", carrier_count: 2, modulated_by: [&[], &[2, 3], &[], &[]] },
    FmAlgorithm { name: "1 2<-3<-4", carrier_count: 2, modulated_by: [&[], &[2], &[3], &[]] },
    FmAlgorithm { name: "(1 2)<-3<-4", carrier_count: 2, modulated_by: [&[2], &[2], &[3], &[]] },
    FmAlgorithm { name: "(1 2)<-(3 4)", carrier_count: 2, modulated_by: [&[2, 3], &[2, 3], &[], &[]] },
    FmAlgorithm { name: "(1 2 3)<-4", carrier_count: 3, modulated_by: [&[3], &[3], &[3], &[]] },
    FmAlgorithm { name: "1 2 3<-4", carrier_count: 3, modulated_by: [&[], &[], &[3], &[]] },
    FmAlgorithm { name: "1 2 3 4", carrier_count: 4, modulated_by: [&[], &[], &[], &[]] },
];

/// Feedback routing: `targets[i]` lists the operators whose previous output
/// is mixed into operator `i`'s phase.
pub struct FmFeedback {
    pub name: &'static str,
    pub targets: [&'static [usize]; OPERATOR_COUNT],
}

pub static FM_FEEDBACKS: [FmFeedback; 8] = [
    FmFeedback { name: "1->1", targets: [&[0], &[], &[], &[]] },
    FmFeedback { name: "2->2", targets: [&[], &[1], &[], &[]] },
    FmFeedback { name: "3->3", targets: [&[], &[], &[2], &[]] },
    FmFeedback { name: "4->4", targets: [&[], &[], &[], &[3]] },
    FmFeedback { name: "1->2", targets: [&[], &[0], &[], &[]] },
    FmFeedback { name: "1->3", targets: [&[], &[], &[0], &[]] },
    FmFeedback { name: "1->4", targets: [&[], &[], &[], &[0]] },
    FmFeedback { name: "all->all", targets: [&[0], &[1], &[2], &[3]] },
];

/// Operator frequency ratios relative to the tone's fundamental. The Hz
/// offset detunes an operator by a constant amount regardless of pitch,
/// which keeps the beating rate stable across the keyboard.
#[derive(Clone, Copy)]
pub struct OperatorFrequency {
    pub name: &'static str,
    pub mult: f64,
    pub hz_offset: f64,
}

pub static OPERATOR_FREQUENCIES: [OperatorFrequency; 12] = [
    OperatorFrequency { name: "0.5x", mult: 0.5, hz_offset: 0.0 },
    OperatorFrequency { name: "1x", mult: 1.0, hz_offset: 0.0 },
    OperatorFrequency { name: "~1x", mult: 1.0, hz_offset: 1.5 },
    OperatorFrequency { name: "2x", mult: 2.0, hz_offset: 0.0 },
    OperatorFrequency { name: "~2x", mult: 2.0, hz_offset: -1.3 },
    OperatorFrequency { name: "3x", mult: 3.0, hz_offset: 0.0 },
    OperatorFrequency { name: "4x", mult: 4.0, hz_offset: 0.0 },
    OperatorFrequency { name: "5x", mult: 5.0, hz_offset: 0.0 },
    OperatorFrequency { name: "6x", mult: 6.0, hz_offset: 0.0 },
    OperatorFrequency { name: "8x", mult: 8.0, hz_offset: 0.0 },
    OperatorFrequency { name: "11x", mult: 11.0, hz_offset: 0.0 },
    OperatorFrequency { name: "16x", mult: 16.0, hz_offset: 0.0 },
];

// --- Wavetables ---

/// A single-cycle chip waveform plus its running integral. Kernels read the
/// integral and difference two lookups per sample, which band-limits the
/// raw stepped waveform without oversampling.
pub struct ChipWave {
    pub name: &'static str,
    /// Loudness compensation so all waves sit at a comparable level.
    pub expression: f64,
    pub samples: Vec<f64>,
    /// `samples.len() + 1` entries; entry `i` is the sum of samples `0..i`
    /// after mean removal.
    pub integral: Vec<f64>,
}

/// A long aperiodic table played back at a pitch-dependent rate.
pub struct NoiseWave {
    pub name: &'static str,
    pub expression: f64,
    /// Pitch at which the table advances one entry per output sample.
    pub base_pitch: i32,
    pub samples: Vec<f64>,
}

const CHIP_WAVE_LENGTH: usize = 64;
const NOISE_WAVE_LENGTH: usize = 1 << 15;

/// Removes the mean and produces the running integral used by the
/// antiderivative oscillators.
pub fn perform_integral(samples: &[f64]) -> Vec<f64> {
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let mut integral = Vec::with_capacity(samples.len() + 1);
    let mut sum = 0.0;
    integral.push(0.0);
    for &sample in samples {
        sum += sample - mean;
        integral.push(sum);
    }
    integral
}

fn chip_wave(name: &'static str, expression: f64, f: impl Fn(f64) -> f64) -> ChipWave {
    let samples: Vec<f64> = (0..CHIP_WAVE_LENGTH)
        .map(|i| f(i as f64 / CHIP_WAVE_LENGTH as f64))
        .collect();
    let integral = perform_integral(&samples);
    ChipWave {
        name,
        expression,
        samples,
        integral,
    }
}

fn build_chip_waves() -> Vec<ChipWave> {
    vec![
        chip_wave("triangle", 1.0, |p| (2.0 * p - 1.0).abs() * 2.0 - 1.0),
        chip_wave("square", 0.5, |p| if p < 0.5 { 1.0 } else { -1.0 }),
        chip_wave("pulse wide", 0.5, |p| if p < 0.25 { 1.0 } else { -1.0 }),
        chip_wave("pulse narrow", 0.5, |p| if p < 0.125 { 1.0 } else { -1.0 }),
        chip_wave("sawtooth", 0.65, |p| 2.0 * (p - (p + 0.5).floor())),
        chip_wave("double saw", 0.5, |p| {
            (2.0 * (p - (p + 0.5).floor())) * 0.5 + (2.0 * (2.0 * p % 1.0) - 1.0) * 0.5
        }),
        chip_wave("spiky", 0.4, |p| {
            let q = (p * 8.0).floor() as i32;
            if q % 2 == 0 { 1.0 } else { -1.0 }
        }),
        chip_wave("rounded", 0.94, |p| {
            // Square approximated by its first few odd harmonics.
            let x = p * std::f64::consts::TAU;
            (x.sin() + (3.0 * x).sin() / 3.0 + (5.0 * x).sin() / 5.0 + (7.0 * x).sin() / 7.0)
                * (4.0 / std::f64::consts::PI)
                * 0.6
        }),
        chip_wave("sine", 0.88, |p| (p * std::f64::consts::TAU).sin()),
    ]
}

fn build_noise_waves() -> Vec<NoiseWave> {
    let mut waves = Vec::new();

    // 1-bit shift-register noise, the classic chip drum source.
    {
        let mut lfsr: u32 = 0x7FFF;
        let samples: Vec<f64> = (0..NOISE_WAVE_LENGTH)
            .map(|_| {
                let bit = ((lfsr >> 14) ^ (lfsr >> 13)) & 1;
                lfsr = ((lfsr << 1) | bit) & 0x7FFF;
                if lfsr & 1 == 1 { 1.0 } else { -1.0 }
            })
            .collect();
        waves.push(NoiseWave {
            name: "retro",
            expression: 0.25,
            base_pitch: 69,
            samples,
        });
    }

    // Uniform white noise. The fixed seed keeps playback deterministic.
    {
        let mut rng = StdRng::seed_from_u64(0x6368_6970);
        let samples: Vec<f64> = (0..NOISE_WAVE_LENGTH)
            .map(|_| rng.gen::<f64>() * 2.0 - 1.0)
            .collect();
        waves.push(NoiseWave {
            name: "white",
            expression: 0.6,
            base_pitch: 69,
            samples,
        });
    }

    // A short shift register repeated across the table gives a pitched,
    // metallic buzz.
    {
        let mut lfsr: u32 = 0x3F;
        let period: Vec<f64> = (0..127)
            .map(|_| {
                let bit = ((lfsr >> 6) ^ (lfsr >> 5)) & 1;
                lfsr = ((lfsr << 1) | bit) & 0x7F;
                if lfsr & 1 == 1 { 1.0 } else { -1.0 }
            })
            .collect();
        let samples: Vec<f64> = (0..NOISE_WAVE_LENGTH)
            .map(|i| period[i % period.len()])
            .collect();
        waves.push(NoiseWave {
            name: "metallic",
            expression: 0.25,
            base_pitch: 69,
            samples,
        });
    }

    waves
}

// --- The configuration structure ---

pub struct SynthConfig {
    pub sample_rate: f64,
    pub chip_waves: Vec<ChipWave>,
    pub noise_waves: Vec<NoiseWave>,
}

impl SynthConfig {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            chip_waves: build_chip_waves(),
            noise_waves: build_noise_waves(),
        }
    }

    /// Samples in one envelope tick at the given tempo.
    #[inline]
    pub fn samples_per_tick(&self, tempo: f64) -> f64 {
        self.sample_rate * 60.0 / (tempo * TICKS_PER_BEAT as f64)
    }

    /// Seconds in one envelope tick at the given tempo.
    #[inline]
    pub fn seconds_per_tick(&self, tempo: f64) -> f64 {
        60.0 / (tempo * TICKS_PER_BEAT as f64)
    }
}
