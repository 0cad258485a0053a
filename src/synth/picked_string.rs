// src/synth/picked_string.rs

//! Karplus-Strong delay-line state for the plucked-string generator.
//!
//! Each unison voice owns one string: a power-of-two delay ring, a one-pole
//! damping shelf and a first-order dispersion all-pass in the feedback
//! path. Coefficients and the delay length interpolate linearly across a
//! tick; a pitch or sustain discontinuity re-plucks the line with a
//! windowed impulse shaped by the instrument's wavetable.

use crate::config::DENORMAL_EPSILON;
use crate::filtering::FilterCoefficients;

#[derive(Clone, Debug, Default)]
pub struct PickedString {
    delay_line: Vec<f64>,
    mask: usize,
    write_index: usize,

    pub delay_length: f64,
    pub delay_length_delta: f64,
    /// Delay length at the end of the previous tick, to detect re-pluck
    /// discontinuities.
    pub prev_delay_length: f64,

    /// Loop gain per circulation, interpolated across the tick.
    pub sustain_gain: f64,
    pub sustain_gain_delta: f64,

    // Dispersion all-pass: y = c*x + x1 - c*y1.
    all_pass_coeff: f64,
    all_pass_coeff_delta: f64,
    all_pass_input1: f64,
    all_pass_output1: f64,

    // Damping shelf: y = b0*x + b1*x1 - a1*y1.
    shelf_a1: f64,
    shelf_b0: f64,
    shelf_b1: f64,
    shelf_a1_delta: f64,
    shelf_b0_delta: f64,
    shelf_b1_delta: f64,
    shelf_input1: f64,
    shelf_output1: f64,

    plucked: bool,
}

impl PickedString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.delay_line.fill(0.0);
        self.write_index = 0;
        self.delay_length = 0.0;
        self.delay_length_delta = 0.0;
        self.prev_delay_length = 0.0;
        self.sustain_gain = 0.0;
        self.sustain_gain_delta = 0.0;
        self.all_pass_coeff = 0.0;
        self.all_pass_coeff_delta = 0.0;
        self.all_pass_input1 = 0.0;
        self.all_pass_output1 = 0.0;
        self.shelf_a1 = 0.0;
        self.shelf_b0 = 0.0;
        self.shelf_b1 = 0.0;
        self.shelf_a1_delta = 0.0;
        self.shelf_b0_delta = 0.0;
        self.shelf_b1_delta = 0.0;
        self.shelf_input1 = 0.0;
        self.shelf_output1 = 0.0;
        self.plucked = false;
    }

    /// Grows the ring (power-of-two, mask-indexed) so it can hold
    /// `samples` of delay. Existing content is discarded; callers only
    /// resize on a re-pluck.
    fn ensure_capacity(&mut self, samples: usize) {
        let needed = (samples + 4).next_power_of_two();
        if self.delay_line.len() < needed {
            self.delay_line = vec![0.0; needed];
            self.mask = needed - 1;
            self.write_index = 0;
        }
    }

    /// Loads this tick's targets. `delay_*` are in samples, `sustain_*`
    /// are loop gains in 0..1, dispersion/damping are coefficient sets
    /// derived by the caller from the tone's frequency.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_tick(
        &mut self,
        delay_start: f64,
        delay_end: f64,
        sustain_start: f64,
        sustain_end: f64,
        dispersion_start: FilterCoefficients,
        dispersion_end: FilterCoefficients,
        shelf_start: FilterCoefficients,
        shelf_end: FilterCoefficients,
        inv_samples: f64,
    ) {
        self.delay_length = delay_start;
        self.delay_length_delta = (delay_end - delay_start) * inv_samples;
        self.sustain_gain = sustain_start;
        self.sustain_gain_delta = (sustain_end - sustain_start) * inv_samples;
        self.all_pass_coeff = dispersion_start.a1;
        self.all_pass_coeff_delta = (dispersion_end.a1 - dispersion_start.a1) * inv_samples;
        self.shelf_a1 = shelf_start.a1;
        self.shelf_b0 = shelf_start.b0;
        self.shelf_b1 = shelf_start.b1;
        self.shelf_a1_delta = (shelf_end.a1 - shelf_start.a1) * inv_samples;
        self.shelf_b0_delta = (shelf_end.b0 - shelf_start.b0) * inv_samples;
        self.shelf_b1_delta = (shelf_end.b1 - shelf_start.b1) * inv_samples;
    }

    /// Whether the coming tick's pitch jump warrants a re-pluck rather
    /// than a glide.
    pub fn needs_pluck(&self, delay_start: f64) -> bool {
        !self.plucked || (self.prev_delay_length - delay_start).abs() > self.prev_delay_length * 0.02
    }

    /// Excites the string: writes one cycle of `wave`, shaped by a raised
    /// cosine window, into the section of the line about to be read.
    pub fn pluck(&mut self, wave: &[f64], delay_length: f64, amplitude: f64) {
        let length = delay_length.max(2.0);
        self.ensure_capacity(length.ceil() as usize);
        let steps = length.floor() as usize;
        for i in 0..steps {
            let position = i as f64 / steps as f64;
            let window = 0.5 - 0.5 * (position * std::f64::consts::TAU).cos();
            let wave_phase = position * wave.len() as f64;
            let wave_index = (wave_phase as usize).min(wave.len() - 1);
            let sample = wave[wave_index];
            let index = (self.write_index + self.mask + 1 - steps + i) & self.mask;
            self.delay_line[index] = sample * window * amplitude;
        }
        self.all_pass_input1 = 0.0;
        self.all_pass_output1 = 0.0;
        self.shelf_input1 = 0.0;
        self.shelf_output1 = 0.0;
        self.plucked = true;
    }

    /// Called at the end of a tick so the next tick can detect pitch
    /// discontinuities.
    pub fn finish_tick(&mut self) {
        self.prev_delay_length = self.delay_length;
    }

    /// One sample of string circulation; the return value is the string's
    /// output.
    #[inline(always)]
    pub fn process(&mut self) -> f64 {
        if self.delay_line.is_empty() {
            return 0.0;
        }
        self.delay_length += self.delay_length_delta;
        self.sustain_gain += self.sustain_gain_delta;
        self.all_pass_coeff += self.all_pass_coeff_delta;
        self.shelf_a1 += self.shelf_a1_delta;
        self.shelf_b0 += self.shelf_b0_delta;
        self.shelf_b1 += self.shelf_b1_delta;

        // Fractional read behind the write cursor.
        let read_position =
            self.write_index as f64 + self.delay_line.len() as f64 - self.delay_length;
        let read_index = read_position.floor() as usize;
        let fraction = read_position - read_position.floor();
        let sample0 = self.delay_line[read_index & self.mask];
        let sample1 = self.delay_line[(read_index + 1) & self.mask];
        let raw = sample0 + (sample1 - sample0) * fraction;

        // Dispersion all-pass.
        let c = self.all_pass_coeff;
        let dispersed = c * raw + self.all_pass_input1 - c * self.all_pass_output1;
        self.all_pass_input1 = raw;
        self.all_pass_output1 = dispersed;

        // Damping shelf.
        let mut damped =
            self.shelf_b0 * dispersed + self.shelf_b1 * self.shelf_input1
                - self.shelf_a1 * self.shelf_output1;
        if damped.abs() < DENORMAL_EPSILON {
            damped = 0.0;
        }
        self.shelf_input1 = dispersed;
        self.shelf_output1 = damped;

        let circulated = damped * self.sustain_gain;
        self.delay_line[self.write_index] = circulated;
        self.write_index = (self.write_index + 1) & self.mask;
        circulated
    }

    /// Total energy left on the string, for idle detection in tests.
    pub fn energy(&self) -> f64 {
        self.delay_line.iter().map(|s| s * s).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::FilterCoefficients;

    fn prepare(string: &mut PickedString, delay: f64, sustain: f64) {
        let dispersion = FilterCoefficients::all_pass_1st_order(1.0);
        let shelf = FilterCoefficients::high_shelf_1st_order(2.5, 0.5);
        string.prepare_tick(
            delay, delay, sustain, sustain, dispersion, dispersion, shelf, shelf, 0.0,
        );
    }

    #[test]
    fn pluck_then_circulation_produces_pitched_sound() {
        let mut string = PickedString::new();
        let wave: Vec<f64> = (0..64)
            .map(|i| (i as f64 / 64.0 * std::f64::consts::TAU).sin())
            .collect();
        let delay = 100.0; // 441 Hz at 44.1kHz
        prepare(&mut string, delay, 0.98);
        string.pluck(&wave, delay, 1.0);

        let output: Vec<f64> = (0..4410).map(|_| string.process()).collect();
        let rms = (output.iter().map(|s| s * s).sum::<f64>() / output.len() as f64).sqrt();
        assert!(rms > 0.001, "expected audible string, rms {}", rms);

        // Count zero crossings over the settled portion: should be near
        // the fundamental implied by the delay length.
        let settled = &output[441..4410];
        let mut crossings = 0;
        for pair in settled.windows(2) {
            if (pair[0] < 0.0 && pair[1] >= 0.0) || (pair[0] > 0.0 && pair[1] <= 0.0) {
                crossings += 1;
            }
        }
        let duration = settled.len() as f64 / 44100.0;
        let measured = crossings as f64 / (2.0 * duration);
        let expected = 44100.0 / delay;
        assert!(
            (measured - expected).abs() < expected * 0.5,
            "measured {} Hz, expected near {}",
            measured,
            expected
        );
    }

    #[test]
    fn low_sustain_decays_faster_than_high_sustain() {
        let wave: Vec<f64> = (0..64)
            .map(|i| (i as f64 / 64.0 * std::f64::consts::TAU).sin())
            .collect();
        let mut energies = Vec::new();
        for sustain in [0.5, 0.995] {
            let mut string = PickedString::new();
            prepare(&mut string, 64.0, sustain);
            string.pluck(&wave, 64.0, 1.0);
            for _ in 0..8192 {
                string.process();
            }
            energies.push(string.energy());
        }
        assert!(
            energies[0] < energies[1] * 0.1,
            "damped string {} should hold far less energy than sustained {}",
            energies[0],
            energies[1]
        );
    }

    #[test]
    fn needs_pluck_on_first_use_and_large_pitch_jump() {
        let mut string = PickedString::new();
        assert!(string.needs_pluck(100.0));
        let wave = vec![0.0; 8];
        prepare(&mut string, 100.0, 0.9);
        string.pluck(&wave, 100.0, 1.0);
        string.finish_tick();
        assert!(!string.needs_pluck(100.5), "tiny drift should glide");
        assert!(string.needs_pluck(50.0), "octave jump should re-pluck");
    }

    #[test]
    fn reset_silences_the_string() {
        let mut string = PickedString::new();
        let wave = vec![1.0; 16];
        prepare(&mut string, 32.0, 0.9);
        string.pluck(&wave, 32.0, 1.0);
        assert!(string.energy() > 0.0);
        string.reset();
        assert_eq!(string.energy(), 0.0);
        assert_eq!(string.process(), 0.0);
    }
}
