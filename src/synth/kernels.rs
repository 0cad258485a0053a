// src/synth/kernels.rs

//! Synthesis kernels: one render routine per generator family.
//!
//! Each kernel is a function of (tone, instrument, sample count) that adds
//! mono samples into the instrument's scratch buffer. Band-limited
//! oscillators read the *antiderivative* of their wavetable and difference
//! two lookups per sample; the pulse kernel instead applies polynomial
//! corrections at its discontinuities. Every kernel runs the tone's note
//! filter cascade per sample and advances the tone's interpolated
//! parameters (phase deltas, expression, operator levels) by their
//! per-sample deltas.

use crate::config::{self, SynthConfig, SINE_WAVE, SINE_WAVE_LENGTH, SINE_WAVE_MASK};
use crate::filtering::apply_filters;
use crate::instrument::{GeneratorKind, Instrument};
use crate::synth::picked_string::PickedString;
use crate::synth::tone::Tone;

/// Phase-deviation scale for FM modulators, in carrier cycles per unit of
/// modulator output.
const FM_MOD_DEPTH: f64 = 0.4;
/// Phase-deviation scale for FM feedback.
const FM_FEEDBACK_DEPTH: f64 = 0.3;

/// Dispatches on the generator family once per run.
pub fn render_tone(
    config: &SynthConfig,
    instrument: &Instrument,
    tone: &mut Tone,
    scratch: &mut [f64],
) {
    match instrument.kind {
        GeneratorKind::Chip { wave } => {
            let integral = &config.chip_waves[wave].integral;
            render_integral_wave(instrument, tone, integral, scratch);
        }
        GeneratorKind::CustomChip => {
            if let Some(wave) = &instrument.custom_wave {
                render_integral_wave(instrument, tone, &wave.integral, scratch);
            }
        }
        GeneratorKind::Harmonics => {
            if let Some(wave) = &instrument.harmonics_wave {
                render_integral_wave(instrument, tone, &wave.integral, scratch);
            }
        }
        GeneratorKind::Noise { wave } => {
            let samples = &config.noise_waves[wave].samples;
            render_table_playback(tone, samples, scratch);
        }
        GeneratorKind::Spectrum => {
            if let Some(wave) = &instrument.spectrum_wave {
                render_table_playback(tone, &wave.samples, scratch);
            }
        }
        GeneratorKind::PulseWidth => render_pulse(tone, scratch),
        GeneratorKind::PickedString => render_picked_string(config, instrument, tone, scratch),
        GeneratorKind::Fm => render_fm(instrument, tone, scratch),
        GeneratorKind::Mod => {}
    }

    contain_filter_faults(tone);
}

/// Resets the tone's filter cascade if its state went non-finite, keeping
/// the fault local to this voice.
fn contain_filter_faults(tone: &mut Tone) {
    let unstable = tone.note_filters[..tone.note_filter_count]
        .iter()
        .any(|f| f.state_is_unstable())
        || !tone.initial_filter_input1.is_finite()
        || !tone.initial_filter_input2.is_finite();
    if unstable {
        log::warn!("note filter state went non-finite; resetting voice filters");
        crate::filtering::reset_filters(&mut tone.note_filters);
        tone.initial_filter_input1 = 0.0;
        tone.initial_filter_input2 = 0.0;
    }
}

#[inline(always)]
fn integral_lookup(integral: &[f64], phase: f64, length: f64) -> f64 {
    let position = phase.rem_euclid(1.0) * length;
    let index = position as usize;
    let fraction = position - index as f64;
    integral[index] + (integral[index + 1] - integral[index]) * fraction
}

/// Antiderivative wavetable oscillator with up to two unison voices.
fn render_integral_wave(
    instrument: &Instrument,
    tone: &mut Tone,
    integral: &[f64],
    scratch: &mut [f64],
) {
    let length = (integral.len() - 1) as f64;
    let voices = instrument.unison.voices.clamp(1, config::UNISON_VOICE_MAX);
    let sign_b = instrument.unison.sign;

    let mut phase_a = tone.phases[0];
    let mut phase_b = tone.phases[1];
    let mut delta_a = tone.phase_deltas[0];
    let mut delta_b = tone.phase_deltas[1];
    let scale_a = tone.phase_delta_scales[0];
    let scale_b = tone.phase_delta_scales[1];
    let mut expression = tone.expression;
    let expression_delta = tone.expression_delta;
    let mut input1 = tone.initial_filter_input1;
    let mut input2 = tone.initial_filter_input2;
    let filter_count = tone.note_filter_count;

    let mut prev_integral_a = integral_lookup(integral, phase_a, length);
    let mut prev_integral_b = integral_lookup(integral, phase_b, length);

    for out in scratch.iter_mut() {
        phase_a += delta_a;
        let next_integral_a = integral_lookup(integral, phase_a, length);
        let mut sample = (next_integral_a - prev_integral_a) / (delta_a * length);
        prev_integral_a = next_integral_a;
        delta_a *= scale_a;

        if voices > 1 {
            phase_b += delta_b;
            let next_integral_b = integral_lookup(integral, phase_b, length);
            sample += sign_b * (next_integral_b - prev_integral_b) / (delta_b * length);
            prev_integral_b = next_integral_b;
            delta_b *= scale_b;
        }

        let filtered = apply_filters(
            &mut tone.note_filters[..filter_count],
            sample,
            input1,
            input2,
        );
        input2 = input1;
        input1 = sample;

        *out += filtered * expression;
        expression += expression_delta;
    }

    tone.phases[0] = phase_a.rem_euclid(1.0);
    tone.phases[1] = phase_b.rem_euclid(1.0);
    tone.phase_deltas[0] = delta_a;
    tone.phase_deltas[1] = delta_b;
    tone.expression = expression;
    tone.initial_filter_input1 = input1;
    tone.initial_filter_input2 = input2;
}

/// Pitched playback of a long aperiodic table (noise, spectrum drums).
fn render_table_playback(tone: &mut Tone, table: &[f64], scratch: &mut [f64]) {
    debug_assert!(table.len().is_power_of_two());
    let mask = table.len() - 1;
    let length = table.len() as f64;

    let mut phase = tone.phases[0] * length;
    let mut delta = tone.phase_deltas[0] * length;
    let scale = tone.phase_delta_scales[0];
    let mut expression = tone.expression;
    let expression_delta = tone.expression_delta;
    let mut input1 = tone.initial_filter_input1;
    let mut input2 = tone.initial_filter_input2;
    let filter_count = tone.note_filter_count;

    for out in scratch.iter_mut() {
        phase += delta;
        delta *= scale;
        let index = phase as usize;
        let fraction = phase - index as f64;
        let sample0 = table[index & mask];
        let sample1 = table[(index + 1) & mask];
        let sample = sample0 + (sample1 - sample0) * fraction;

        let filtered = apply_filters(
            &mut tone.note_filters[..filter_count],
            sample,
            input1,
            input2,
        );
        input2 = input1;
        input1 = sample;

        *out += filtered * expression;
        expression += expression_delta;
    }

    tone.phases[0] = (phase / length).rem_euclid(1.0);
    tone.phase_deltas[0] = delta / length;
    tone.expression = expression;
    tone.initial_filter_input1 = input1;
    tone.initial_filter_input2 = input2;
}

/// Polynomial band-limiting correction for a step discontinuity at
/// normalized phase `t` (0..1) with per-sample phase step `dt`.
#[inline(always)]
fn poly_blep(t: f64, dt: f64) -> f64 {
    if t < dt {
        let t = t / dt;
        t + t - t * t - 1.0
    } else if t > 1.0 - dt {
        let t = (t - 1.0) / dt;
        t * t + t + t + 1.0
    } else {
        0.0
    }
}

/// Variable-duty pulse with analytic corrections at both edges.
fn render_pulse(tone: &mut Tone, scratch: &mut [f64]) {
    let mut phase = tone.phases[0].rem_euclid(1.0);
    let mut delta = tone.phase_deltas[0];
    let scale = tone.phase_delta_scales[0];
    let mut width = tone.pulse_width;
    let width_delta = tone.pulse_width_delta;
    let mut expression = tone.expression;
    let expression_delta = tone.expression_delta;
    let mut input1 = tone.initial_filter_input1;
    let mut input2 = tone.initial_filter_input2;
    let filter_count = tone.note_filter_count;

    for out in scratch.iter_mut() {
        phase += delta;
        if phase >= 1.0 {
            phase -= 1.0;
        }
        delta *= scale;
        width = (width + width_delta).clamp(0.01, 0.99);

        let raw = if phase < width { 1.0 } else { -1.0 };
        let falling = (phase - width).rem_euclid(1.0);
        let sample = raw + poly_blep(phase, delta) - poly_blep(falling, delta);

        let filtered = apply_filters(
            &mut tone.note_filters[..filter_count],
            sample,
            input1,
            input2,
        );
        input2 = input1;
        input1 = sample;

        *out += filtered * expression;
        expression += expression_delta;
    }

    tone.phases[0] = phase;
    tone.phase_deltas[0] = delta;
    tone.pulse_width = width;
    tone.expression = expression;
    tone.initial_filter_input1 = input1;
    tone.initial_filter_input2 = input2;
}

/// Maps the string-sustain setting to a per-circulation loop gain.
fn string_loop_gain(sustain: f64) -> f64 {
    0.98 + 0.0199 * sustain.clamp(0.0, 1.0)
}

/// Karplus-Strong: one string per unison voice, coefficients interpolated
/// across the run, re-plucked on pitch or sustain discontinuities.
fn render_picked_string(
    config: &SynthConfig,
    instrument: &Instrument,
    tone: &mut Tone,
    scratch: &mut [f64],
) {
    let voices = instrument.unison.voices.clamp(1, config::UNISON_VOICE_MAX);
    while tone.picked_strings.len() < voices {
        tone.picked_strings.push(PickedString::new());
    }

    let run_len = scratch.len().max(1) as f64;
    let inv_samples = 1.0 / run_len;
    let sample_rate = config.sample_rate;

    // The pluck impulse carries the instrument's wavetable shape.
    let pluck_wave: &[f64] = match (&instrument.custom_wave, &instrument.harmonics_wave) {
        (Some(wave), _) => &wave.samples,
        (_, Some(wave)) => &wave.samples,
        _ => &config.chip_waves[0].samples,
    };

    let sustain_start = tone.string_sustain_start;
    let sustain_end = tone.string_sustain_end;

    for voice in 0..voices {
        let delta_start = tone.phase_deltas[voice].max(1.0e-6);
        let delta_end = delta_start * tone.phase_delta_scales[voice].powf(run_len);
        let delay_start = (1.0 / delta_start).min(sample_rate);
        let delay_end = (1.0 / delta_end).min(sample_rate);

        let freq_start = delta_start * sample_rate;
        let dispersion_corner = |freq: f64| {
            std::f64::consts::TAU * (freq * 8.0).clamp(500.0, sample_rate * 0.4) / sample_rate
        };
        let shelf_corner = std::f64::consts::TAU * 4000.0 / sample_rate;
        let shelf_gain = |sustain: f64| 0.25 + 0.7 * sustain.clamp(0.0, 1.0);

        let dispersion_start =
            crate::filtering::FilterCoefficients::all_pass_1st_order(dispersion_corner(freq_start));
        let dispersion_end = crate::filtering::FilterCoefficients::all_pass_1st_order(
            dispersion_corner(delta_end * sample_rate),
        );
        let shelf_start = crate::filtering::FilterCoefficients::high_shelf_1st_order(
            shelf_corner,
            shelf_gain(sustain_start),
        );
        let shelf_end = crate::filtering::FilterCoefficients::high_shelf_1st_order(
            shelf_corner,
            shelf_gain(sustain_end),
        );

        let string = &mut tone.picked_strings[voice];
        let needs_pluck = string.needs_pluck(delay_start);
        string.prepare_tick(
            delay_start,
            delay_end,
            string_loop_gain(sustain_start),
            string_loop_gain(sustain_end),
            dispersion_start,
            dispersion_end,
            shelf_start,
            shelf_end,
            inv_samples,
        );
        if needs_pluck {
            string.pluck(pluck_wave, delay_start, 1.0);
        }
    }

    let mut expression = tone.expression;
    let expression_delta = tone.expression_delta;
    let mut input1 = tone.initial_filter_input1;
    let mut input2 = tone.initial_filter_input2;
    let filter_count = tone.note_filter_count;
    let sign_b = instrument.unison.sign;

    for out in scratch.iter_mut() {
        let mut sample = tone.picked_strings[0].process();
        if voices > 1 {
            sample += sign_b * tone.picked_strings[1].process();
        }

        let filtered = apply_filters(
            &mut tone.note_filters[..filter_count],
            sample,
            input1,
            input2,
        );
        input2 = input1;
        input1 = sample;

        *out += filtered * expression;
        expression += expression_delta;
    }

    for voice in 0..voices {
        tone.picked_strings[voice].finish_tick();
        // Keep the per-voice phase delta in step with the glide for the
        // next tick's discontinuity check.
        tone.phase_deltas[voice] *= tone.phase_delta_scales[voice].powf(run_len);
    }
    tone.expression = expression;
    tone.initial_filter_input1 = input1;
    tone.initial_filter_input2 = input2;
}

#[inline(always)]
fn sine_lookup(phase_cycles: f64) -> f64 {
    let position = phase_cycles.rem_euclid(1.0) * SINE_WAVE_LENGTH as f64;
    let index = position as usize & SINE_WAVE_MASK;
    let fraction = position - position.floor();
    SINE_WAVE[index] + (SINE_WAVE[index + 1] - SINE_WAVE[index]) * fraction
}

/// Four-operator phase modulation. The routing is interpreted from the
/// algorithm/feedback tables resolved once per tick; operators are
/// evaluated from the highest index down so every modulator's output for
/// this sample is ready before its carrier reads it.
fn render_fm(instrument: &Instrument, tone: &mut Tone, scratch: &mut [f64]) {
    let algorithm = &config::FM_ALGORITHMS[instrument.fm.algorithm];
    let feedback = &config::FM_FEEDBACKS[instrument.fm.feedback_type];
    let carrier_count = algorithm.carrier_count;

    let mut phases = tone.phases;
    let mut deltas = tone.phase_deltas;
    let scales = tone.phase_delta_scales;
    let mut op_expressions = tone.operator_expressions;
    let op_expression_deltas = tone.operator_expression_deltas;
    let mut feedback_mult = tone.feedback_mult;
    let feedback_delta = tone.feedback_delta;
    let mut feedback_outputs = tone.feedback_outputs;
    let mut expression = tone.expression;
    let expression_delta = tone.expression_delta;
    let mut input1 = tone.initial_filter_input1;
    let mut input2 = tone.initial_filter_input2;
    let filter_count = tone.note_filter_count;

    let mut outputs = [0.0_f64; config::OPERATOR_COUNT];

    for out in scratch.iter_mut() {
        for op in (0..config::OPERATOR_COUNT).rev() {
            phases[op] += deltas[op];
            deltas[op] *= scales[op];

            let mut phase = phases[op];
            for &modulator in algorithm.modulated_by[op] {
                phase += outputs[modulator] * FM_MOD_DEPTH;
            }
            for &source in feedback.targets[op] {
                phase += feedback_outputs[source] * feedback_mult * FM_FEEDBACK_DEPTH;
            }
            outputs[op] = sine_lookup(phase) * op_expressions[op];
            op_expressions[op] += op_expression_deltas[op];
        }
        feedback_outputs = outputs;
        feedback_mult += feedback_delta;

        let mut sample = 0.0;
        for carrier in 0..carrier_count {
            sample += outputs[carrier];
        }

        let filtered = apply_filters(
            &mut tone.note_filters[..filter_count],
            sample,
            input1,
            input2,
        );
        input2 = input1;
        input1 = sample;

        *out += filtered * expression;
        expression += expression_delta;
    }

    for op in 0..config::OPERATOR_COUNT {
        phases[op] = phases[op].rem_euclid(1.0);
    }
    tone.phases = phases;
    tone.phase_deltas = deltas;
    tone.operator_expressions = op_expressions;
    tone.feedback_mult = feedback_mult;
    tone.feedback_outputs = feedback_outputs;
    tone.expression = expression;
    tone.initial_filter_input1 = input1;
    tone.initial_filter_input2 = input2;
}
