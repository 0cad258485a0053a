// src/envelope.rs

//! Per-voice, per-tick envelope evaluation.
//!
//! Every automatable target gets a start-of-tick and end-of-tick multiplier
//! each tick. Values are accumulated multiplicatively into one table, and
//! the table must be explicitly neutralized after use so unrelated voices
//! rendered in the same tick are unaffected.

use crate::config;
use serde::{Deserialize, Serialize};

// --- Curves ---

/// The envelope curve families. `seconds` and `ticks` age with the note;
/// `beats` is the song position, so periodic curves stay in sync across
/// voices.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum EnvelopeCurve {
    Constant,
    /// Tracks the note's pin size.
    NoteSize,
    /// Fast initial spike settling to 1.
    Punch,
    /// Quick ramp up, then a slow decay.
    Flare { speed: f64 },
    /// Hyperbolic decay from 1.
    Twang { speed: f64 },
    /// Inverse of twang: rises from 0 toward 1.
    Swell { speed: f64 },
    /// Full-depth periodic wobble.
    Tremolo { speed: f64 },
    /// Shallow periodic wobble.
    Tremolo2 { speed: f64 },
    /// Exponential decay, halving every `1/speed` seconds.
    Decay { speed: f64 },
    /// Clamped linear ramp from 0 to 1 over a fixed tick count.
    Rise { ticks: f64 },
    /// Clamped linear ramp from 1 to 0 over a fixed tick count.
    Fall { ticks: f64 },
}

/// Evaluates a curve at one instant of a note's life. Non-negative and
/// finite for any age >= 0.
pub fn compute_envelope(
    curve: EnvelopeCurve,
    seconds: f64,
    beats: f64,
    ticks: f64,
    note_size: f64,
) -> f64 {
    match curve {
        EnvelopeCurve::Constant => 1.0,
        EnvelopeCurve::NoteSize => config::note_size_to_volume_mult(note_size),
        EnvelopeCurve::Punch => (2.0 - seconds * 10.0).clamp(1.0, 2.0),
        EnvelopeCurve::Flare { speed } => {
            let speed = speed.max(1e-3);
            let attack = 0.25 / speed.sqrt();
            if seconds < attack {
                seconds / attack
            } else {
                1.0 / (1.0 + (seconds - attack) * speed)
            }
        }
        EnvelopeCurve::Twang { speed } => 1.0 / (1.0 + seconds * speed.max(0.0)),
        EnvelopeCurve::Swell { speed } => 1.0 - 1.0 / (1.0 + seconds * speed.max(0.0)),
        EnvelopeCurve::Tremolo { speed } => {
            0.5 + (beats * std::f64::consts::TAU * speed).cos() * 0.5
        }
        EnvelopeCurve::Tremolo2 { speed } => {
            0.75 + (beats * std::f64::consts::TAU * speed).cos() * 0.25
        }
        EnvelopeCurve::Decay { speed } => 2.0_f64.powf(-speed.max(0.0) * seconds),
        EnvelopeCurve::Rise { ticks: length } => (ticks / length.max(1e-9)).clamp(0.0, 1.0),
        EnvelopeCurve::Fall { ticks: length } => {
            (1.0 - ticks / length.max(1e-9)).clamp(0.0, 1.0)
        }
    }
}

// --- Automation targets ---

/// Everything an envelope (or note pin blending) can scale. Each target
/// owns one slot in the multiplier table.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AutomationTarget {
    NoteVolume,
    PulseWidth,
    StringSustain,
    Unison,
    PitchShift,
    Detune,
    VibratoDepth,
    FeedbackAmplitude,
    OperatorFrequency(usize),
    OperatorAmplitude(usize),
    NoteFilterAllFreqs,
    NoteFilterFreq(usize),
}

pub const AUTOMATION_SLOT_COUNT: usize =
    8 + config::OPERATOR_COUNT * 2 + 1 + config::FILTER_POINT_MAX;

impl AutomationTarget {
    /// Flat index into the multiplier table.
    pub fn slot(&self) -> usize {
        match *self {
            AutomationTarget::NoteVolume => 0,
            AutomationTarget::PulseWidth => 1,
            AutomationTarget::StringSustain => 2,
            AutomationTarget::Unison => 3,
            AutomationTarget::PitchShift => 4,
            AutomationTarget::Detune => 5,
            AutomationTarget::VibratoDepth => 6,
            AutomationTarget::FeedbackAmplitude => 7,
            AutomationTarget::OperatorFrequency(op) => 8 + op.min(config::OPERATOR_COUNT - 1),
            AutomationTarget::OperatorAmplitude(op) => {
                8 + config::OPERATOR_COUNT + op.min(config::OPERATOR_COUNT - 1)
            }
            AutomationTarget::NoteFilterAllFreqs => 8 + config::OPERATOR_COUNT * 2,
            AutomationTarget::NoteFilterFreq(point) => {
                8 + config::OPERATOR_COUNT * 2 + 1 + point.min(config::FILTER_POINT_MAX - 1)
            }
        }
    }
}

/// One envelope routed to one target.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct EnvelopeAssignment {
    pub target: AutomationTarget,
    pub curve: EnvelopeCurve,
}

// --- Per-tick computation ---

/// A tone's age at the start and end of the current tick, measured against
/// one particular note.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvelopeTiming {
    pub seconds_start: f64,
    pub seconds_end: f64,
    pub ticks_start: f64,
    pub ticks_end: f64,
    pub beats_start: f64,
    pub beats_end: f64,
    pub note_size_start: f64,
    pub note_size_end: f64,
}

/// Portamento blending: how much of the tick's envelope values come from
/// the adjacent note instead of the current one.
#[derive(Clone, Copy, Debug)]
pub struct SlideBlend {
    /// Weight of the other note at tick start, 0..=1.
    pub start_ratio: f64,
    /// Weight of the other note at tick end.
    pub end_ratio: f64,
    /// The tone's age measured against the other note.
    pub other: EnvelopeTiming,
}

/// The per-voice multiplier table. Owned by a tone; `neutralize` must be
/// called after the tick's values have been consumed.
#[derive(Clone, Debug)]
pub struct EnvelopeComputer {
    starts: [f64; AUTOMATION_SLOT_COUNT],
    ends: [f64; AUTOMATION_SLOT_COUNT],
}

impl Default for EnvelopeComputer {
    fn default() -> Self {
        Self {
            starts: [1.0; AUTOMATION_SLOT_COUNT],
            ends: [1.0; AUTOMATION_SLOT_COUNT],
        }
    }
}

impl EnvelopeComputer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn start(&self, target: AutomationTarget) -> f64 {
        self.starts[target.slot()]
    }

    #[inline]
    pub fn end(&self, target: AutomationTarget) -> f64 {
        self.ends[target.slot()]
    }

    /// Resets every slot to the multiplicative identity. Required after
    /// each tick so stale factors never leak into other voices.
    pub fn neutralize(&mut self) {
        self.starts = [1.0; AUTOMATION_SLOT_COUNT];
        self.ends = [1.0; AUTOMATION_SLOT_COUNT];
    }

    /// Evaluates every assigned envelope for this tick and multiplies the
    /// results into the table, blending against adjacent notes when the
    /// instrument slides.
    pub fn compute_tick(
        &mut self,
        assignments: &[EnvelopeAssignment],
        timing: &EnvelopeTiming,
        slide_in: Option<&SlideBlend>,
        slide_out: Option<&SlideBlend>,
    ) {
        for assignment in assignments {
            let mut value_start = compute_envelope(
                assignment.curve,
                timing.seconds_start,
                timing.beats_start,
                timing.ticks_start,
                timing.note_size_start,
            );
            let mut value_end = compute_envelope(
                assignment.curve,
                timing.seconds_end,
                timing.beats_end,
                timing.ticks_end,
                timing.note_size_end,
            );

            for blend in [slide_in, slide_out].into_iter().flatten() {
                if blend.start_ratio > 0.0 || blend.end_ratio > 0.0 {
                    let other_start = compute_envelope(
                        assignment.curve,
                        blend.other.seconds_start,
                        blend.other.beats_start,
                        blend.other.ticks_start,
                        blend.other.note_size_start,
                    );
                    let other_end = compute_envelope(
                        assignment.curve,
                        blend.other.seconds_end,
                        blend.other.beats_end,
                        blend.other.ticks_end,
                        blend.other.note_size_end,
                    );
                    value_start += (other_start - value_start) * blend.start_ratio;
                    value_end += (other_end - value_end) * blend.end_ratio;
                }
            }

            let slot = assignment.target.slot();
            self.starts[slot] *= value_start;
            self.ends[slot] *= value_end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CURVES: [EnvelopeCurve; 11] = [
        EnvelopeCurve::Constant,
        EnvelopeCurve::NoteSize,
        EnvelopeCurve::Punch,
        EnvelopeCurve::Flare { speed: 4.0 },
        EnvelopeCurve::Twang { speed: 8.0 },
        EnvelopeCurve::Swell { speed: 2.0 },
        EnvelopeCurve::Tremolo { speed: 1.5 },
        EnvelopeCurve::Tremolo2 { speed: 6.0 },
        EnvelopeCurve::Decay { speed: 3.0 },
        EnvelopeCurve::Rise { ticks: 12.0 },
        EnvelopeCurve::Fall { ticks: 24.0 },
    ];

    #[test]
    fn all_curves_non_negative_and_finite_for_any_age() {
        for curve in ALL_CURVES {
            for &seconds in &[0.0, 1e-6, 0.01, 0.5, 3.0, 100.0, 1e6] {
                let ticks = seconds * 48.0 * 2.0;
                let beats = seconds * 2.0;
                for &size in &[0.0, 1.0, config::NOTE_SIZE_MAX] {
                    let value = compute_envelope(curve, seconds, beats, ticks, size);
                    assert!(
                        value.is_finite() && value >= 0.0,
                        "{:?} at {}s gave {}",
                        curve,
                        seconds,
                        value
                    );
                }
            }
        }
    }

    #[test]
    fn constant_curve_is_exactly_one() {
        for &seconds in &[0.0, 0.3, 42.0] {
            assert_eq!(
                compute_envelope(EnvelopeCurve::Constant, seconds, seconds, seconds, 1.0),
                1.0
            );
        }
    }

    #[test]
    fn swell_starts_silent_and_approaches_one() {
        let at_zero = compute_envelope(EnvelopeCurve::Swell { speed: 4.0 }, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(at_zero, 0.0);
        let late = compute_envelope(EnvelopeCurve::Swell { speed: 4.0 }, 100.0, 0.0, 0.0, 1.0);
        assert!(late > 0.99 && late < 1.0);
    }

    #[test]
    fn punch_spikes_then_settles_to_one() {
        let at_zero = compute_envelope(EnvelopeCurve::Punch, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(at_zero, 2.0);
        let settled = compute_envelope(EnvelopeCurve::Punch, 0.2, 0.0, 0.0, 1.0);
        assert_eq!(settled, 1.0);
    }

    #[test]
    fn ramps_clamp_at_their_endpoints() {
        let rise = EnvelopeCurve::Rise { ticks: 10.0 };
        assert_eq!(compute_envelope(rise, 0.0, 0.0, 0.0, 1.0), 0.0);
        assert_eq!(compute_envelope(rise, 0.0, 0.0, 5.0, 1.0), 0.5);
        assert_eq!(compute_envelope(rise, 0.0, 0.0, 50.0, 1.0), 1.0);
        let fall = EnvelopeCurve::Fall { ticks: 10.0 };
        assert_eq!(compute_envelope(fall, 0.0, 0.0, 0.0, 1.0), 1.0);
        assert_eq!(compute_envelope(fall, 0.0, 0.0, 50.0, 1.0), 0.0);
    }

    #[test]
    fn automation_slots_are_unique_and_in_range() {
        let mut targets = vec![
            AutomationTarget::NoteVolume,
            AutomationTarget::PulseWidth,
            AutomationTarget::StringSustain,
            AutomationTarget::Unison,
            AutomationTarget::PitchShift,
            AutomationTarget::Detune,
            AutomationTarget::VibratoDepth,
            AutomationTarget::FeedbackAmplitude,
            AutomationTarget::NoteFilterAllFreqs,
        ];
        for op in 0..config::OPERATOR_COUNT {
            targets.push(AutomationTarget::OperatorFrequency(op));
            targets.push(AutomationTarget::OperatorAmplitude(op));
        }
        for point in 0..config::FILTER_POINT_MAX {
            targets.push(AutomationTarget::NoteFilterFreq(point));
        }
        let mut seen = std::collections::HashSet::new();
        for target in targets {
            let slot = target.slot();
            assert!(slot < AUTOMATION_SLOT_COUNT);
            assert!(seen.insert(slot), "duplicate slot for {:?}", target);
        }
    }

    #[test]
    fn compute_tick_multiplies_into_slots_and_neutralize_clears() {
        let mut computer = EnvelopeComputer::new();
        let assignments = [
            EnvelopeAssignment {
                target: AutomationTarget::NoteVolume,
                curve: EnvelopeCurve::Twang { speed: 1.0 },
            },
            EnvelopeAssignment {
                target: AutomationTarget::NoteVolume,
                curve: EnvelopeCurve::Twang { speed: 1.0 },
            },
        ];
        let timing = EnvelopeTiming {
            seconds_start: 1.0,
            seconds_end: 1.0,
            note_size_start: config::NOTE_SIZE_MAX,
            note_size_end: config::NOTE_SIZE_MAX,
            ..EnvelopeTiming::default()
        };
        computer.compute_tick(&assignments, &timing, None, None);
        // Two twang envelopes at age 1s each contribute 0.5.
        assert!((computer.start(AutomationTarget::NoteVolume) - 0.25).abs() < 1e-12);
        // Unrelated slots stay neutral.
        assert_eq!(computer.start(AutomationTarget::PulseWidth), 1.0);
        computer.neutralize();
        assert_eq!(computer.start(AutomationTarget::NoteVolume), 1.0);
    }

    #[test]
    fn slide_blend_interpolates_toward_other_note() {
        let mut computer = EnvelopeComputer::new();
        let assignments = [EnvelopeAssignment {
            target: AutomationTarget::NoteVolume,
            curve: EnvelopeCurve::Twang { speed: 1.0 },
        }];
        // Current note is brand new (value 1.0); the previous note is one
        // second old (value 0.5); at a 50% blend the result is 0.75.
        let timing = EnvelopeTiming {
            note_size_start: config::NOTE_SIZE_MAX,
            note_size_end: config::NOTE_SIZE_MAX,
            ..EnvelopeTiming::default()
        };
        let blend = SlideBlend {
            start_ratio: 0.5,
            end_ratio: 0.5,
            other: EnvelopeTiming {
                seconds_start: 1.0,
                seconds_end: 1.0,
                note_size_start: config::NOTE_SIZE_MAX,
                note_size_end: config::NOTE_SIZE_MAX,
                ..EnvelopeTiming::default()
            },
        };
        computer.compute_tick(&assignments, &timing, Some(&blend), None);
        assert!((computer.start(AutomationTarget::NoteVolume) - 0.75).abs() < 1e-12);
    }
}
