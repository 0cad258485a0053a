// src/filtering.rs

//! Filter math: stateless biquad coefficient derivation and the per-sample
//! cascaded evaluator with linear coefficient interpolation across a tick.
//!
//! Sign convention throughout:
//! `y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]`.

use crate::instrument::FilterKind;

/// Transfer-function coefficients for one first- or second-order section.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FilterCoefficients {
    pub a1: f64,
    pub a2: f64,
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub order: usize,
}

impl FilterCoefficients {
    /// One-pole low-pass via the bilinear transform.
    pub fn low_pass_1st_order(corner_radians_per_sample: f64) -> Self {
        let g = (0.5 * corner_radians_per_sample).tan();
        let b = g / (1.0 + g);
        Self {
            a1: (g - 1.0) / (1.0 + g),
            a2: 0.0,
            b0: b,
            b1: b,
            b2: 0.0,
            order: 1,
        }
    }

    /// One-pole high-pass via the bilinear transform.
    pub fn high_pass_1st_order(corner_radians_per_sample: f64) -> Self {
        let g = (0.5 * corner_radians_per_sample).tan();
        let b = 1.0 / (1.0 + g);
        Self {
            a1: (g - 1.0) / (1.0 + g),
            a2: 0.0,
            b0: b,
            b1: -b,
            b2: 0.0,
            order: 1,
        }
    }

    /// First-order high shelf: unity below the corner, `linear_gain` above.
    pub fn high_shelf_1st_order(corner_radians_per_sample: f64, linear_gain: f64) -> Self {
        let g = linear_gain.max(1e-6);
        let k = (0.5 * corner_radians_per_sample).tan();
        let norm = 1.0 / (1.0 + k);
        Self {
            a1: (k - 1.0) * norm,
            a2: 0.0,
            b0: (g + k) * norm,
            b1: (k - g) * norm,
            b2: 0.0,
            order: 1,
        }
    }

    /// First-order all-pass tuned as a fractional delay of `delay` samples
    /// (0..=1). Used by the pan taps and the string dispersion filters.
    pub fn all_pass_1st_order_fractional_delay(delay: f64) -> Self {
        let d = delay.clamp(0.0, 1.0);
        let c = (1.0 - d) / (1.0 + d);
        Self {
            a1: c,
            a2: 0.0,
            b0: c,
            b1: 1.0,
            b2: 0.0,
            order: 1,
        }
    }

    /// First-order all-pass that inverts phase above the corner, used as a
    /// dispersion element.
    pub fn all_pass_1st_order(corner_radians_per_sample: f64) -> Self {
        let k = (0.5 * corner_radians_per_sample).tan();
        let c = (k - 1.0) / (k + 1.0);
        Self {
            a1: c,
            a2: 0.0,
            b0: c,
            b1: 1.0,
            b2: 0.0,
            order: 1,
        }
    }

    /// Resonant second-order low-pass; `peak_linear_gain` sets the
    /// resonance (1.0 is a gentle Butterworth-like response).
    pub fn low_pass_2nd_order(corner_radians_per_sample: f64, peak_linear_gain: f64) -> Self {
        let w = corner_radians_per_sample.clamp(1e-5, std::f64::consts::PI - 1e-4);
        let q = peak_linear_gain.max(0.2);
        let alpha = w.sin() / (2.0 * q);
        let cos_w = w.cos();
        let a0 = 1.0 + alpha;
        Self {
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
            b0: ((1.0 - cos_w) / 2.0) / a0,
            b1: (1.0 - cos_w) / a0,
            b2: ((1.0 - cos_w) / 2.0) / a0,
            order: 2,
        }
    }

    /// Resonant second-order high-pass.
    pub fn high_pass_2nd_order(corner_radians_per_sample: f64, peak_linear_gain: f64) -> Self {
        let w = corner_radians_per_sample.clamp(1e-5, std::f64::consts::PI - 1e-4);
        let q = peak_linear_gain.max(0.2);
        let alpha = w.sin() / (2.0 * q);
        let cos_w = w.cos();
        let a0 = 1.0 + alpha;
        Self {
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
            b0: ((1.0 + cos_w) / 2.0) / a0,
            b1: (-(1.0 + cos_w)) / a0,
            b2: ((1.0 + cos_w) / 2.0) / a0,
            order: 2,
        }
    }

    /// Second-order peaking section: unity away from the corner,
    /// `linear_gain` at it.
    pub fn peak_2nd_order(corner_radians_per_sample: f64, linear_gain: f64, q: f64) -> Self {
        let w = corner_radians_per_sample.clamp(1e-5, std::f64::consts::PI - 1e-4);
        let a = linear_gain.max(1e-6).sqrt();
        let alpha = w.sin() / (2.0 * q.max(0.1));
        let cos_w = w.cos();
        let a0 = 1.0 + alpha / a;
        Self {
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha / a) / a0,
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_w) / a0,
            b2: (1.0 - alpha * a) / a0,
            order: 2,
        }
    }
}

/// Derives the section for one filter control point at a given sample rate.
pub fn control_point_coefficients(
    kind: FilterKind,
    freq_hz: f64,
    gain: f64,
    sample_rate: f64,
) -> FilterCoefficients {
    let nyquist = sample_rate * 0.5;
    let corner = std::f64::consts::TAU * freq_hz.clamp(10.0, nyquist * 0.96) / sample_rate;
    match kind {
        FilterKind::LowPass => FilterCoefficients::low_pass_2nd_order(corner, gain),
        FilterKind::HighPass => FilterCoefficients::high_pass_2nd_order(corner, gain),
        FilterKind::Peak => FilterCoefficients::peak_2nd_order(corner, gain, 1.0),
    }
}

/// A biquad with per-sample coefficient deltas (the "gradient") and two
/// samples of output memory. Input memory is threaded through the cascade
/// by `apply_filters`, so it lives with the owner, not here.
#[derive(Clone, Copy, Debug, Default)]
pub struct DynamicBiquadFilter {
    pub a1: f64,
    pub a2: f64,
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1_delta: f64,
    pub a2_delta: f64,
    pub b0_delta: f64,
    pub b1_delta: f64,
    pub b2_delta: f64,
    pub output1: f64,
    pub output2: f64,
}

impl DynamicBiquadFilter {
    /// Loads start-of-tick coefficients and the per-sample deltas that
    /// reach the end-of-tick coefficients after `1.0 / inv_samples` steps.
    pub fn load_gradient(
        &mut self,
        start: FilterCoefficients,
        end: FilterCoefficients,
        inv_samples: f64,
    ) {
        self.a1 = start.a1;
        self.a2 = start.a2;
        self.b0 = start.b0;
        self.b1 = start.b1;
        self.b2 = start.b2;
        self.a1_delta = (end.a1 - start.a1) * inv_samples;
        self.a2_delta = (end.a2 - start.a2) * inv_samples;
        self.b0_delta = (end.b0 - start.b0) * inv_samples;
        self.b1_delta = (end.b1 - start.b1) * inv_samples;
        self.b2_delta = (end.b2 - start.b2) * inv_samples;
    }

    pub fn reset_output(&mut self) {
        self.output1 = 0.0;
        self.output2 = 0.0;
    }

    /// True when the feedback memory has gone non-finite or absurd and the
    /// whole cascade should be zeroed.
    #[inline]
    pub fn state_is_unstable(&self) -> bool {
        !(self.output1.is_finite() && self.output2.is_finite())
            || self.output1.abs() > 1.0e12
            || self.output2.abs() > 1.0e12
    }
}

/// Runs `sample` through a cascade of dynamic biquads, advancing each
/// filter's coefficient gradient by one step. `input1`/`input2` are the
/// previous two *raw* inputs to the cascade; each later stage uses the
/// prior stage's output history as its input history.
#[inline(always)]
pub fn apply_filters(
    filters: &mut [DynamicBiquadFilter],
    mut sample: f64,
    mut input1: f64,
    mut input2: f64,
) -> f64 {
    for filter in filters.iter_mut() {
        let output1 = filter.output1;
        let output2 = filter.output2;
        filter.a1 += filter.a1_delta;
        filter.a2 += filter.a2_delta;
        filter.b0 += filter.b0_delta;
        filter.b1 += filter.b1_delta;
        filter.b2 += filter.b2_delta;
        let output = filter.b0 * sample + filter.b1 * input1 + filter.b2 * input2
            - filter.a1 * output1
            - filter.a2 * output2;
        filter.output2 = output1;
        filter.output1 = output;
        input2 = output2;
        input1 = output1;
        sample = output;
    }
    sample
}

/// Zeroes the feedback memory of every filter in the cascade.
pub fn reset_filters(filters: &mut [DynamicBiquadFilter]) {
    for filter in filters.iter_mut() {
        filter.reset_output();
    }
}
