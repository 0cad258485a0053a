// src/synth/tone.rs

//! The ephemeral per-voice unit and its pool.
//!
//! A `Tone` is owned by exactly one (instrument, voice-slot) pair at a
//! time. Tones live in an arena (`TonePool`): flat storage, a free list of
//! indices, and a generation counter per slot so a stale handle can never
//! reach a recycled tone.

use crate::config;
use crate::envelope::EnvelopeComputer;
use crate::filtering::DynamicBiquadFilter;
use crate::score::Note;
use crate::synth::picked_string::PickedString;

/// Phase accumulators cover both unison voices and FM operators.
pub const TONE_PHASE_COUNT: usize = config::OPERATOR_COUNT;

/// Filter slots: one per control point plus one reserved for the
/// note-filter volume-compensation stage.
pub const TONE_FILTER_CAP: usize = config::FILTER_POINT_MAX + 1;

#[derive(Clone, Debug)]
pub struct Tone {
    pub pitches: [i32; config::MAX_CHORD_SIZE],
    pub pitch_count: usize,
    /// Pitch count of the owning note, for chord loudness compensation
    /// (differs from `pitch_count` for arpeggios and custom intervals).
    pub chord_size: usize,
    pub instrument_index: usize,

    /// The note being rendered; `None` for freshly allocated live tones
    /// until the scheduler assigns one.
    pub note: Option<Note>,
    pub prev_note: Option<Note>,
    pub next_note: Option<Note>,
    /// Bar the note belongs to, for age math against the transport.
    pub note_bar: usize,

    // Age bookkeeping. `*_alive` accumulate since the tone first sounded;
    // the offsets mark where the current/previous note began so slides can
    // measure age against either note.
    pub seconds_alive: f64,
    pub ticks_alive: f64,
    pub note_age_offset_seconds: f64,
    pub note_age_offset_ticks: f64,
    pub prev_note_age_offset_seconds: f64,
    pub prev_note_age_offset_ticks: f64,

    pub phases: [f64; TONE_PHASE_COUNT],
    pub phase_deltas: [f64; TONE_PHASE_COUNT],
    /// Per-sample multiplicative scale on each phase delta (geometric
    /// interpolation of frequency across the tick).
    pub phase_delta_scales: [f64; TONE_PHASE_COUNT],

    pub expression: f64,
    pub expression_delta: f64,
    pub operator_expressions: [f64; config::OPERATOR_COUNT],
    pub operator_expression_deltas: [f64; config::OPERATOR_COUNT],
    pub feedback_mult: f64,
    pub feedback_delta: f64,
    /// Previous output of each FM operator, for feedback routing.
    pub feedback_outputs: [f64; config::OPERATOR_COUNT],

    pub pulse_width: f64,
    pub pulse_width_delta: f64,
    /// Picked-string sustain at the tick boundaries, resolved with its
    /// envelope.
    pub string_sustain_start: f64,
    pub string_sustain_end: f64,

    pub note_filters: [DynamicBiquadFilter; TONE_FILTER_CAP],
    pub note_filter_count: usize,
    /// Previous two raw inputs to the note-filter cascade.
    pub initial_filter_input1: f64,
    pub initial_filter_input2: f64,

    pub picked_strings: Vec<PickedString>,
    pub envelope_computer: EnvelopeComputer,

    /// True until the first render after (re)allocation; phases and filter
    /// history start from zero.
    pub is_fresh: bool,
    pub live_input: bool,
    /// Suppress the attack because a compatible tone carried over.
    pub force_continue_at_start: bool,
    /// Suppress the release because the next note will take over.
    pub force_continue_at_end: bool,
    /// Set once released; the tone keeps fading until its fade-out ticks
    /// elapse.
    pub released: bool,
    pub ticks_since_released: i32,
    pub is_on_last_tick: bool,
}

impl Default for Tone {
    fn default() -> Self {
        Self {
            pitches: [0; config::MAX_CHORD_SIZE],
            pitch_count: 0,
            chord_size: 1,
            instrument_index: 0,
            note: None,
            prev_note: None,
            next_note: None,
            note_bar: 0,
            seconds_alive: 0.0,
            ticks_alive: 0.0,
            note_age_offset_seconds: 0.0,
            note_age_offset_ticks: 0.0,
            prev_note_age_offset_seconds: 0.0,
            prev_note_age_offset_ticks: 0.0,
            phases: [0.0; TONE_PHASE_COUNT],
            phase_deltas: [0.0; TONE_PHASE_COUNT],
            phase_delta_scales: [1.0; TONE_PHASE_COUNT],
            expression: 0.0,
            expression_delta: 0.0,
            operator_expressions: [0.0; config::OPERATOR_COUNT],
            operator_expression_deltas: [0.0; config::OPERATOR_COUNT],
            feedback_mult: 0.0,
            feedback_delta: 0.0,
            feedback_outputs: [0.0; config::OPERATOR_COUNT],
            pulse_width: 0.5,
            pulse_width_delta: 0.0,
            string_sustain_start: 0.7,
            string_sustain_end: 0.7,
            note_filters: [DynamicBiquadFilter::default(); TONE_FILTER_CAP],
            note_filter_count: 0,
            initial_filter_input1: 0.0,
            initial_filter_input2: 0.0,
            picked_strings: Vec::new(),
            envelope_computer: EnvelopeComputer::new(),
            is_fresh: true,
            live_input: false,
            force_continue_at_start: false,
            force_continue_at_end: false,
            released: false,
            ticks_since_released: 0,
            is_on_last_tick: false,
        }
    }
}

impl Tone {
    /// Zeroes all transient state so a recycled tone cannot leak phase or
    /// filter history from an unrelated note. Buffers keep their capacity.
    pub fn reset(&mut self) {
        let picked_strings = std::mem::take(&mut self.picked_strings);
        *self = Tone {
            picked_strings,
            ..Tone::default()
        };
        for string in &mut self.picked_strings {
            string.reset();
        }
        self.envelope_computer.neutralize();
    }

    pub fn note_seconds(&self) -> f64 {
        self.seconds_alive - self.note_age_offset_seconds
    }

    pub fn note_ticks(&self) -> f64 {
        self.ticks_alive - self.note_age_offset_ticks
    }

    pub fn prev_note_seconds(&self) -> f64 {
        self.seconds_alive - self.prev_note_age_offset_seconds
    }

    pub fn prev_note_ticks(&self) -> f64 {
        self.ticks_alive - self.prev_note_age_offset_ticks
    }

    /// Marks a seamless handoff to `note`: ages keep accumulating, but the
    /// note-relative clock restarts and the old note becomes the slide
    /// predecessor.
    pub fn advance_to_note(&mut self, note: Note) {
        self.prev_note = self.note.take();
        self.prev_note_age_offset_seconds = self.note_age_offset_seconds;
        self.prev_note_age_offset_ticks = self.note_age_offset_ticks;
        self.note_age_offset_seconds = self.seconds_alive;
        self.note_age_offset_ticks = self.ticks_alive;
        self.note = Some(note);
    }
}

/// A validated reference to a pooled tone. Stale handles (older
/// generation) resolve to `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ToneHandle {
    pub index: u32,
    pub generation: u32,
}

struct ToneSlot {
    generation: u32,
    in_use: bool,
    tone: Tone,
}

/// Arena of recycled tones. Nothing here allocates in the steady state:
/// slots are created on demand, then reused forever.
#[derive(Default)]
pub struct TonePool {
    slots: Vec<ToneSlot>,
    free: Vec<u32>,
}

impl TonePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a reset tone from the free list, growing the arena only when
    /// every slot is busy.
    pub fn allocate(&mut self) -> ToneHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(!slot.in_use);
            slot.in_use = true;
            slot.tone.reset();
            return ToneHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(ToneSlot {
            generation: 0,
            in_use: true,
            tone: Tone::default(),
        });
        ToneHandle {
            index,
            generation: 0,
        }
    }

    /// Returns a tone to the free list and bumps its generation so old
    /// handles die.
    pub fn free(&mut self, handle: ToneHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index as usize) {
            if slot.in_use && slot.generation == handle.generation {
                slot.in_use = false;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(handle.index);
            }
        }
    }

    pub fn get(&self, handle: ToneHandle) -> Option<&Tone> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.in_use && slot.generation == handle.generation)
            .map(|slot| &slot.tone)
    }

    pub fn get_mut(&mut self, handle: ToneHandle) -> Option<&mut Tone> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.in_use && slot.generation == handle.generation)
            .map(|slot| &mut slot.tone)
    }

    pub fn live_slot_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_slots_without_growing() {
        let mut pool = TonePool::new();
        let a = pool.allocate();
        pool.free(a);
        let b = pool.allocate();
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert_eq!(pool.live_slot_count(), 1);
    }

    #[test]
    fn stale_handles_resolve_to_none() {
        let mut pool = TonePool::new();
        let a = pool.allocate();
        pool.free(a);
        assert!(pool.get(a).is_none());
        let b = pool.allocate();
        assert!(pool.get(b).is_some());
        assert!(pool.get(a).is_none(), "old generation must stay dead");
    }

    #[test]
    fn double_free_is_harmless() {
        let mut pool = TonePool::new();
        let a = pool.allocate();
        pool.free(a);
        pool.free(a);
        let b = pool.allocate();
        let c = pool.allocate();
        assert_ne!(b.index, c.index, "double free must not duplicate slots");
    }

    #[test]
    fn reset_clears_transient_state() {
        let mut pool = TonePool::new();
        let handle = pool.allocate();
        {
            let tone = pool.get_mut(handle).unwrap();
            tone.phases[0] = 0.7;
            tone.expression = 0.5;
            tone.released = true;
            tone.ticks_since_released = 9;
            tone.note_filters[0].output1 = 3.0;
        }
        pool.free(handle);
        let handle = pool.allocate();
        let tone = pool.get(handle).unwrap();
        assert_eq!(tone.phases[0], 0.0);
        assert_eq!(tone.expression, 0.0);
        assert!(!tone.released);
        assert_eq!(tone.ticks_since_released, 0);
        assert_eq!(tone.note_filters[0].output1, 0.0);
        assert!(tone.is_fresh);
    }

    #[test]
    fn advance_to_note_keeps_ages_for_slides() {
        let mut tone = Tone::default();
        tone.note = Some(Note::simple(vec![40], 0.0, 12.0));
        tone.seconds_alive = 2.0;
        tone.ticks_alive = 96.0;
        tone.advance_to_note(Note::simple(vec![42], 12.0, 24.0));
        assert_eq!(tone.note_seconds(), 0.0);
        assert_eq!(tone.prev_note_seconds(), 2.0);
        assert!(tone.prev_note.is_some());
    }
}
