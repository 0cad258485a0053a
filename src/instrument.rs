// src/instrument.rs

//! Static instrument settings.
//!
//! An `Instrument` is the per-channel sound definition the renderer reads
//! every tick: which generator produces the raw waveform, how notes
//! transition and chord, which effects run and with what parameters, and
//! which envelopes automate which targets. The renderer never mutates an
//! instrument; the modulation bus overrides values through its own table
//! (and private filter clones) instead.

use crate::config::{self, FADE_OUT_NEUTRAL_INDEX};
use crate::envelope::EnvelopeAssignment;
use serde::{Deserialize, Serialize};

// --- Generator families ---

/// The closed set of synthesis generators. Dispatch happens once per tick,
/// never per sample.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneratorKind {
    /// Band-limited playback of a built-in single-cycle chip wave.
    Chip { wave: usize },
    /// Like `Chip`, but the cycle comes from the instrument's own table.
    CustomChip,
    /// Pitched playback of a built-in aperiodic noise table.
    Noise { wave: usize },
    /// Additive wave precomputed from harmonic amplitudes by the host.
    Harmonics,
    /// Band-limited variable-duty pulse.
    PulseWidth,
    /// Karplus-Strong plucked string.
    PickedString,
    /// Drum-style playback of a precomputed spectrum table.
    Spectrum,
    /// Four-operator phase modulation.
    Fm,
    /// Carries automation values only; renders no audio.
    Mod,
}

impl GeneratorKind {
    pub fn is_noise_pitched(&self) -> bool {
        matches!(self, GeneratorKind::Noise { .. } | GeneratorKind::Spectrum)
    }
}

// --- Note transitions and chords ---

/// Continuity policy across note boundaries.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Hard restart; any sounding tone is cut immediately.
    Interrupt,
    /// Fade out / fade in per the instrument's fade settings.
    Normal,
    /// Adjacent notes glide: pitch and expression interpolate across the
    /// boundary.
    Slide,
    /// A tone persists across the boundary (and across bars when the pitch
    /// sets match exactly).
    Continue,
}

impl Transition {
    /// Whether a tone carries over to an adjacent note instead of being
    /// released and re-attacked.
    pub fn is_seamless(&self) -> bool {
        matches!(self, Transition::Slide | Transition::Continue)
    }

    pub fn slides(&self) -> bool {
        matches!(self, Transition::Slide)
    }
}

/// How multiple pitches in one note map to tones.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChordPolicy {
    /// One tone per pitch, loudness-compensated.
    Simultaneous,
    /// One tone per pitch with staggered onsets.
    Strum,
    /// A single tone cycling through the pitches on the arpeggio clock.
    Arpeggio,
    /// A single tone rendered at the base pitch plus one interval-shifted
    /// companion.
    CustomInterval,
}

impl ChordPolicy {
    pub const ALL: [ChordPolicy; 4] = [
        ChordPolicy::Simultaneous,
        ChordPolicy::Strum,
        ChordPolicy::Arpeggio,
        ChordPolicy::CustomInterval,
    ];

    /// Tones needed for a note with `pitch_count` pitches.
    pub fn tone_count(&self, pitch_count: usize) -> usize {
        match self {
            ChordPolicy::Simultaneous | ChordPolicy::Strum => pitch_count,
            ChordPolicy::Arpeggio => 1,
            ChordPolicy::CustomInterval => pitch_count.min(2),
        }
    }
}

/// Loudness compensation applied to each tone of an `n`-pitch chord.
#[inline]
pub fn chord_expression(n: usize) -> f64 {
    1.0 / ((n.saturating_sub(1)) as f64 * 0.25 + 1.0)
}

// --- Unison & vibrato ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct UnisonSettings {
    /// 1 or 2 phase-independent voices.
    pub voices: usize,
    /// Semitone detune between the voices.
    pub spread: f64,
    /// Semitone offset applied to both voices.
    pub offset: f64,
    /// Per-voice gain.
    pub expression: f64,
    /// Sign of the second voice (-1 inverts it for a hollow sound).
    pub sign: f64,
}

impl Default for UnisonSettings {
    fn default() -> Self {
        Self {
            voices: 1,
            spread: 0.0,
            offset: 0.0,
            expression: 1.0,
            sign: 1.0,
        }
    }
}

impl UnisonSettings {
    pub fn honky_tonk() -> Self {
        Self {
            voices: 2,
            spread: 0.09,
            offset: 0.0,
            expression: 1.0,
            sign: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct VibratoSettings {
    /// Peak pitch deviation in semitones.
    pub amplitude: f64,
    /// One full cycle takes this many seconds.
    pub period_seconds: f64,
    /// Parts of silence before the vibrato ramps in.
    pub delay_parts: f64,
}

impl Default for VibratoSettings {
    fn default() -> Self {
        Self {
            amplitude: 0.0,
            period_seconds: 0.14,
            delay_parts: 0.0,
        }
    }
}

// --- Filters ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    LowPass,
    HighPass,
    Peak,
}

/// One control point of an EQ or note filter: a second-order section at
/// `freq` Hz with linear `gain` (peak/shelf amount, or resonance for the
/// pass kinds).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FilterControlPoint {
    pub kind: FilterKind,
    pub freq: f64,
    pub gain: f64,
}

impl FilterControlPoint {
    pub fn new(kind: FilterKind, freq: f64, gain: f64) -> Self {
        Self { kind, freq, gain }
    }
}

/// The simplified two-slider filter surface: both sliders in 0..=1.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SimpleFilter {
    pub cutoff: f64,
    pub peak: f64,
}

impl SimpleFilter {
    /// The sliders resolve to a single resonant low-pass control point.
    pub fn to_control_point(&self) -> FilterControlPoint {
        let freq = 20.0 * (20000.0_f64 / 20.0).powf(self.cutoff.clamp(0.0, 1.0));
        let gain = 0.5 * 8.0_f64.powf(self.peak.clamp(0.0, 1.0));
        FilterControlPoint::new(FilterKind::LowPass, freq, gain)
    }
}

/// A filter definition: either the simplified sliders or an explicit
/// control-point list. When `simple` is set it wins.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FilterSettings {
    pub simple: Option<SimpleFilter>,
    pub control_points: Vec<FilterControlPoint>,
}

impl FilterSettings {
    pub fn from_points(points: Vec<FilterControlPoint>) -> Self {
        Self {
            simple: None,
            control_points: points,
        }
    }

    pub fn from_simple(cutoff: f64, peak: f64) -> Self {
        Self {
            simple: Some(SimpleFilter { cutoff, peak }),
            control_points: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.simple.is_none() && self.control_points.is_empty()
    }

    /// Writes the effective control points into a caller-owned scratch
    /// buffer (no allocation in the steady state).
    pub fn write_points(&self, out: &mut Vec<FilterControlPoint>) {
        out.clear();
        if let Some(simple) = &self.simple {
            out.push(simple.to_control_point());
        } else {
            out.extend(
                self.control_points
                    .iter()
                    .take(config::FILTER_POINT_MAX)
                    .copied(),
            );
        }
    }
}

// --- Effects ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct BitcrusherSettings {
    /// Sample-and-hold rate slider, 0..=1 (higher holds longer).
    pub freq: f64,
    /// Quantization depth slider, 0..=1.
    pub quantization: f64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct EchoSettings {
    /// Feedback amount, 0..=1.
    pub sustain: f64,
    /// Delay time in parts.
    pub delay_parts: f64,
}

/// Which post-processing stages run for this instrument. `None` disables a
/// stage entirely; a disabled stage's delay lines are never allocated.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EffectSettings {
    pub distortion: Option<f64>,
    pub bitcrusher: Option<BitcrusherSettings>,
    pub chorus: Option<f64>,
    pub echo: Option<EchoSettings>,
    pub reverb: Option<f64>,
}

// --- FM operators ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct OperatorSettings {
    /// Index into `config::OPERATOR_FREQUENCIES`.
    pub frequency: usize,
    /// Amplitude setting, 0..=15.
    pub amplitude: f64,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            frequency: 1,
            amplitude: 0.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FmSettings {
    /// Index into `config::FM_ALGORITHMS`.
    pub algorithm: usize,
    /// Index into `config::FM_FEEDBACKS`.
    pub feedback_type: usize,
    /// Feedback amplitude setting, 0..=15.
    pub feedback_amplitude: f64,
    pub operators: [OperatorSettings; config::OPERATOR_COUNT],
}

impl Default for FmSettings {
    fn default() -> Self {
        Self {
            algorithm: 0,
            feedback_type: 0,
            feedback_amplitude: 0.0,
            operators: [
                OperatorSettings { frequency: 1, amplitude: 15.0 },
                OperatorSettings::default(),
                OperatorSettings::default(),
                OperatorSettings::default(),
            ],
        }
    }
}

// --- Precomputed waveform tables ---

/// A host-precomputed single-cycle table (harmonics/custom) or long table
/// (spectrum), carried with its running integral for the band-limited
/// oscillators.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PrecomputedWave {
    pub samples: Vec<f64>,
    pub integral: Vec<f64>,
}

impl PrecomputedWave {
    pub fn new(samples: Vec<f64>) -> Self {
        let integral = config::perform_integral(&samples);
        Self { samples, integral }
    }
}

// --- Modulation targets (settings of a mod-channel instrument) ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterElement {
    Frequency,
    Gain,
}

/// What part of a filter a modulation slot edits: swap the whole
/// definition for a numbered alternate, or nudge one element of one
/// control point on a private clone.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterModTarget {
    WholeFilter,
    ControlPoint { index: usize, element: FilterElement },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SongModSetting {
    Tempo,
    MasterGain,
    /// One-shot: jump to the next bar at the next tick boundary.
    NextBar,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstrumentModSetting {
    Volume,
    Pan,
    PulseWidth,
    Distortion,
    BitcrusherFreq,
    BitcrusherQuantization,
    ChorusAmount,
    EchoSustain,
    ReverbAmount,
    Detune,
    VibratoDepth,
    StringSustain,
    EqFilter(FilterModTarget),
    NoteFilter(FilterModTarget),
    /// One-shot: restart the arpeggio clock of the targeted instrument.
    ResetArpeggio,
}

/// One slot of a mod-channel instrument. Slot `i` is driven by mod notes
/// whose pitch is `i`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModTarget {
    None,
    Song(SongModSetting),
    Instrument {
        channel: usize,
        instrument: usize,
        setting: InstrumentModSetting,
    },
}

impl Default for ModTarget {
    fn default() -> Self {
        ModTarget::None
    }
}

// --- The instrument itself ---

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Instrument {
    pub name: String,
    pub kind: GeneratorKind,
    /// Volume slider in `-VOLUME_RANGE..=VOLUME_RANGE`, 0 neutral.
    pub volume: f64,
    /// Stereo position, -1 (left) to 1 (right).
    pub pan: f64,
    /// How much of the pan is expressed as inter-channel delay, 0..=1.
    pub pan_delay: f64,
    /// Fade-in setting, see `config::fade_in_seconds`.
    pub fade_in: usize,
    /// Fade-out setting, see `config::fade_out_ticks`.
    pub fade_out: usize,
    pub transition: Transition,
    pub chord: ChordPolicy,
    /// Arpeggio steps per tick multiplier; 1.0 advances once per tick.
    pub arpeggio_speed: f64,
    /// Two-pitch arpeggios alternate twice as fast.
    pub fast_two_note_arp: bool,
    /// Onset stagger between strummed chord pitches, in parts.
    pub strum_parts: f64,
    pub unison: UnisonSettings,
    pub vibrato: VibratoSettings,
    /// Post-effects EQ, always applied.
    pub eq_filter: FilterSettings,
    /// Per-voice filter applied inside the synthesis kernels.
    pub note_filter: Option<FilterSettings>,
    /// Alternate definitions the modulation bus may swap in (index 1..).
    pub eq_sub_filters: Vec<FilterSettings>,
    pub note_sub_filters: Vec<FilterSettings>,
    pub effects: EffectSettings,
    pub envelopes: Vec<EnvelopeAssignment>,
    pub fm: FmSettings,
    /// Pulse duty cycle, 0..=1.
    pub pulse_width: f64,
    /// Picked-string sustain, 0..=1.
    pub string_sustain: f64,
    /// Semitone offset applied to every note, automatable.
    pub pitch_shift: f64,
    /// Fine detune in cents/100 (semitones), automatable.
    pub detune: f64,
    pub custom_wave: Option<PrecomputedWave>,
    pub harmonics_wave: Option<PrecomputedWave>,
    pub spectrum_wave: Option<PrecomputedWave>,
    /// Only meaningful when `kind == Mod`.
    pub mod_targets: Vec<ModTarget>,
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: GeneratorKind::Chip { wave: 0 },
            volume: 0.0,
            pan: 0.0,
            pan_delay: 0.5,
            fade_in: 0,
            fade_out: FADE_OUT_NEUTRAL_INDEX,
            transition: Transition::Normal,
            chord: ChordPolicy::Simultaneous,
            arpeggio_speed: 1.0,
            fast_two_note_arp: false,
            strum_parts: 1.0,
            unison: UnisonSettings::default(),
            vibrato: VibratoSettings::default(),
            eq_filter: FilterSettings::default(),
            note_filter: None,
            eq_sub_filters: Vec::new(),
            note_sub_filters: Vec::new(),
            effects: EffectSettings::default(),
            envelopes: Vec::new(),
            fm: FmSettings::default(),
            pulse_width: 0.5,
            string_sustain: 0.7,
            pitch_shift: 0.0,
            detune: 0.0,
            custom_wave: None,
            harmonics_wave: None,
            spectrum_wave: None,
            mod_targets: Vec::new(),
        }
    }
}

impl Instrument {
    pub fn chip(wave: usize) -> Self {
        Self {
            kind: GeneratorKind::Chip { wave },
            ..Self::default()
        }
    }

    pub fn noise(wave: usize) -> Self {
        Self {
            kind: GeneratorKind::Noise { wave },
            ..Self::default()
        }
    }

    pub fn fm(algorithm: usize) -> Self {
        Self {
            kind: GeneratorKind::Fm,
            fm: FmSettings {
                algorithm,
                ..FmSettings::default()
            },
            ..Self::default()
        }
    }

    pub fn picked_string() -> Self {
        Self {
            kind: GeneratorKind::PickedString,
            ..Self::default()
        }
    }

    pub fn modulator(targets: Vec<ModTarget>) -> Self {
        Self {
            kind: GeneratorKind::Mod,
            mod_targets: targets,
            ..Self::default()
        }
    }

    /// Fade-out duration in ticks; negative values overlap the next note.
    pub fn fade_out_ticks(&self) -> i32 {
        config::fade_out_ticks(self.fade_out)
    }

    pub fn fade_in_seconds(&self) -> f64 {
        config::fade_in_seconds(self.fade_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chord_expression_compensates_larger_chords() {
        assert_eq!(chord_expression(1), 1.0);
        assert!((chord_expression(2) - 1.0 / 1.25).abs() < 1e-12);
        assert!(chord_expression(4) < chord_expression(2));
    }

    #[test]
    fn chord_tone_counts() {
        assert_eq!(ChordPolicy::Simultaneous.tone_count(3), 3);
        assert_eq!(ChordPolicy::Strum.tone_count(4), 4);
        assert_eq!(ChordPolicy::Arpeggio.tone_count(4), 1);
        assert_eq!(ChordPolicy::CustomInterval.tone_count(3), 2);
        assert_eq!(ChordPolicy::CustomInterval.tone_count(1), 1);
    }

    #[test]
    fn simple_filter_resolves_to_audible_lowpass() {
        let point = SimpleFilter { cutoff: 1.0, peak: 0.0 }.to_control_point();
        assert_eq!(point.kind, FilterKind::LowPass);
        assert!((point.freq - 20000.0).abs() < 1.0);
        let low = SimpleFilter { cutoff: 0.0, peak: 0.0 }.to_control_point();
        assert!((low.freq - 20.0).abs() < 1e-9);
    }

    #[test]
    fn write_points_prefers_simple_sliders() {
        let mut settings = FilterSettings::from_points(vec![FilterControlPoint::new(
            FilterKind::HighPass,
            100.0,
            1.0,
        )]);
        settings.simple = Some(SimpleFilter { cutoff: 0.5, peak: 0.5 });
        let mut scratch = Vec::new();
        settings.write_points(&mut scratch);
        assert_eq!(scratch.len(), 1);
        assert_eq!(scratch[0].kind, FilterKind::LowPass);
    }

    #[test]
    fn instrument_settings_round_trip_through_json() {
        let mut instrument = Instrument::fm(4);
        instrument.effects.echo = Some(EchoSettings { sustain: 0.5, delay_parts: 12.0 });
        instrument.mod_targets = vec![ModTarget::Instrument {
            channel: 0,
            instrument: 0,
            setting: InstrumentModSetting::EqFilter(FilterModTarget::ControlPoint {
                index: 1,
                element: FilterElement::Frequency,
            }),
        }];
        let json = serde_json::to_string(&instrument).unwrap();
        let back: Instrument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, GeneratorKind::Fm);
        assert_eq!(back.fm.algorithm, 4);
        assert_eq!(back.mod_targets, instrument.mod_targets);
    }
}
