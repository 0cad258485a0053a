// src/synth/effects.rs

//! The post-processing pipeline.
//!
//! Operates on one instrument's mono scratch buffer and adds stereo output
//! into the master buffers: distortion -> bitcrusher -> EQ cascade ->
//! panning -> chorus -> echo -> reverb. The stage list is interpreted
//! straight-line from the flags resolved in `voice_state`; every parameter
//! advances by its per-sample delta so a tick's start/end values
//! interpolate without zipper noise. Each delay line's input is scaled by
//! the shared delay-input multiplier so idle shutdown fades tails without
//! discontinuities.

use crate::filtering::apply_filters;
use crate::synth::voice_state::{
    InstrumentRenderState, CHORUS_DELAY_OFFSETS, CHORUS_DELAY_RANGE_SECONDS,
    CHORUS_PHASE_OFFSETS, CHORUS_TAP_SIGNS,
};

/// Soft clipper used by the distortion stage; identity at zero drive.
#[inline(always)]
fn soft_clip(sample: f64, drive: f64) -> f64 {
    (1.0 + drive) * sample / (1.0 + drive * sample.abs())
}

/// Reflects `sample` into [-level, level] with a triangular fold.
#[inline(always)]
fn triangle_fold(sample: f64, level: f64) -> f64 {
    let period = 4.0 * level;
    let wrapped = (sample + level).rem_euclid(period);
    (wrapped - 2.0 * level).abs() - level
}

/// Runs the enabled stages over `scratch` and mixes the stereo result into
/// `out_left`/`out_right`. `sample_rate` is only needed by the chorus tap
/// math.
pub fn process_effects(
    state: &mut InstrumentRenderState,
    scratch: &[f64],
    out_left: &mut [f64],
    out_right: &mut [f64],
    sample_rate: f64,
) {
    let len = scratch.len();
    debug_assert!(out_left.len() >= len && out_right.len() >= len);

    let chorus_tap_scale = CHORUS_DELAY_RANGE_SECONDS * sample_rate;

    for i in 0..len {
        state.delay_input_mult =
            (state.delay_input_mult + state.delay_input_mult_delta).clamp(0.0, 1.0);
        let delay_input_mult = state.delay_input_mult;

        let mut sample = scratch[i];

        // --- Distortion: soft clip with 4x fractional-delay oversampling ---
        if state.distortion_enabled {
            state.distortion_drive += state.distortion_drive_delta;
            let drive = state.distortion_drive;
            let prev = state.distortion_prev_input;
            let mut shaped = 0.0;
            for step in 1..=4 {
                let fractional = prev + (sample - prev) * (step as f64 * 0.25);
                shaped += soft_clip(fractional, drive);
            }
            state.distortion_prev_input = sample;
            sample = shaped * 0.25;
        }

        // --- Bitcrusher: sample-and-hold with triangular folding ---
        if state.bitcrusher_enabled {
            state.bitcrusher_rate += state.bitcrusher_rate_delta;
            state.bitcrusher_scale += state.bitcrusher_scale_delta;
            state.bitcrusher_phase += state.bitcrusher_rate;
            if state.bitcrusher_phase >= 1.0 {
                state.bitcrusher_phase -= state.bitcrusher_phase.floor();
                let folded = triangle_fold(sample, 1.0);
                let scale = state.bitcrusher_scale.max(1.0);
                state.bitcrusher_held = (folded * scale).round() / scale;
            }
            sample = state.bitcrusher_held;
        }

        // --- EQ cascade ---
        if state.eq_filter_count > 0 {
            let raw = sample;
            sample = apply_filters(
                &mut state.eq_filters[..state.eq_filter_count],
                raw,
                state.eq_input1,
                state.eq_input2,
            );
            state.eq_input2 = state.eq_input1;
            state.eq_input1 = raw;
        }

        state.mix_volume += state.mix_volume_delta;
        sample *= state.mix_volume;

        // --- Panning: two independent fractional-delay taps ---
        state.pan_vol_l += state.pan_vol_l_delta;
        state.pan_vol_r += state.pan_vol_r_delta;
        state.pan_offset_l += state.pan_offset_l_delta;
        state.pan_offset_r += state.pan_offset_r_delta;
        state.pan_ring.write(sample * delay_input_mult);
        let mut left = state.pan_ring.read(state.pan_offset_l + 1.0) * state.pan_vol_l;
        let mut right = state.pan_ring.read(state.pan_offset_r + 1.0) * state.pan_vol_r;

        // --- Chorus: three LFO-offset taps per side ---
        if state.chorus_enabled {
            state.chorus_wet += state.chorus_wet_delta;
            state.chorus_phase += state.chorus_phase_delta;
            if state.chorus_phase >= std::f64::consts::TAU {
                state.chorus_phase -= std::f64::consts::TAU;
            }
            let wet = state.chorus_wet;
            state.chorus_ring_l.write(left * delay_input_mult);
            state.chorus_ring_r.write(right * delay_input_mult);
            let mut wet_l = 0.0;
            let mut wet_r = 0.0;
            for tap in 0..3 {
                let delay_l = chorus_tap_scale
                    * (CHORUS_DELAY_OFFSETS[0][tap]
                        + (state.chorus_phase + CHORUS_PHASE_OFFSETS[0][tap]).sin());
                let delay_r = chorus_tap_scale
                    * (CHORUS_DELAY_OFFSETS[1][tap]
                        + (state.chorus_phase + CHORUS_PHASE_OFFSETS[1][tap]).sin());
                wet_l += CHORUS_TAP_SIGNS[tap] * state.chorus_ring_l.read(delay_l);
                wet_r += CHORUS_TAP_SIGNS[tap] * state.chorus_ring_r.read(delay_r);
            }
            left += (wet_l * 0.577 - left) * wet;
            right += (wet_r * 0.577 - right) * wet;
        }

        // --- Echo: feedback delay with a damping shelf in the loop ---
        if state.echo_enabled {
            state.echo_feedback += state.echo_feedback_delta;
            state.echo_delay += state.echo_delay_delta;
            let delay = state.echo_delay;
            let shelf = state.echo_shelf;

            let tap_l = state.echo_ring_l.read(delay);
            let damped_l = shelf.b0 * tap_l + shelf.b1 * state.echo_shelf_input_l
                - shelf.a1 * state.echo_shelf_output_l;
            state.echo_shelf_input_l = tap_l;
            state.echo_shelf_output_l = damped_l;
            state
                .echo_ring_l
                .write(left * delay_input_mult + damped_l * state.echo_feedback);
            left += tap_l;

            let tap_r = state.echo_ring_r.read(delay);
            let damped_r = shelf.b0 * tap_r + shelf.b1 * state.echo_shelf_input_r
                - shelf.a1 * state.echo_shelf_output_r;
            state.echo_shelf_input_r = tap_r;
            state.echo_shelf_output_r = damped_r;
            state
                .echo_ring_r
                .write(right * delay_input_mult + damped_r * state.echo_feedback);
            right += tap_r;
        }

        // --- Reverb: 4-line FDN with a butterfly mix, per-line damping ---
        if state.reverb_enabled {
            state.reverb_wet += state.reverb_wet_delta;
            state.reverb_feedback += state.reverb_feedback_delta;
            let feedback = state.reverb_feedback;
            let shelf = state.reverb_shelf;

            let tap0 = state.reverb_rings[0].read(state.reverb_line_lengths[0]);
            let tap1 = state.reverb_rings[1].read(state.reverb_line_lengths[1]);
            let tap2 = state.reverb_rings[2].read(state.reverb_line_lengths[2]);
            let tap3 = state.reverb_rings[3].read(state.reverb_line_lengths[3]);

            // Orthogonal butterfly keeps the loop gain exactly `feedback`.
            let mixed = [
                (tap0 + tap1 + tap2 + tap3) * 0.5,
                (tap0 - tap1 + tap2 - tap3) * 0.5,
                (tap0 + tap1 - tap2 - tap3) * 0.5,
                (tap0 - tap1 - tap2 + tap3) * 0.5,
            ];
            let inputs = [
                left * delay_input_mult,
                right * delay_input_mult,
                0.0,
                0.0,
            ];
            for line in 0..4 {
                let circulated = mixed[line] * feedback;
                let damped = shelf.b0 * circulated
                    + shelf.b1 * state.reverb_shelf_inputs[line]
                    - shelf.a1 * state.reverb_shelf_outputs[line];
                state.reverb_shelf_inputs[line] = circulated;
                state.reverb_shelf_outputs[line] = damped;
                state.reverb_rings[line].write(damped + inputs[line]);
            }
            left += (tap0 + tap2) * state.reverb_wet;
            right += (tap1 + tap3) * state.reverb_wet;
        }

        out_left[i] += left;
        out_right[i] += right;
    }
}
