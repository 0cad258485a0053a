// src/lib.rs

//! chipsynth: the real-time rendering core of a sound-chip music
//! synthesizer.
//!
//! The crate turns an in-memory score (channels of instruments, each
//! holding notes expressed as pitch/volume pin envelopes) into a
//! continuous stereo PCM stream, synchronized to a musical transport
//! (bar, beat, part, tick, sample). The host owns the score model and the
//! audio device; this crate owns voice scheduling, per-tick envelope and
//! automation evaluation, the per-voice synthesis kernels, the
//! post-processing effects chain and the cross-instrument modulation bus.
//!
//! Typical use:
//!
//! ```
//! use chipsynth::config::SynthConfig;
//! use chipsynth::instrument::Instrument;
//! use chipsynth::score::{Channel, ChannelKind, Note, Pattern, Song};
//! use chipsynth::Synth;
//!
//! let mut song = Song::new();
//! let mut channel = Channel::new(ChannelKind::Pitch);
//! channel.instruments.push(Instrument::chip(0));
//! channel.patterns.push(Pattern::new(vec![0], vec![Note::simple(vec![48], 0.0, 24.0)]));
//! channel.bars = vec![1];
//! song.channels.push(channel);
//!
//! let mut synth = Synth::new(SynthConfig::new(44100.0));
//! let mut left = vec![0.0_f32; 512];
//! let mut right = vec![0.0_f32; 512];
//! synth.synthesize(&song, &mut left, &mut right, 512, true).unwrap();
//! ```

pub mod config;
pub mod envelope;
pub mod filtering;
pub mod instrument;
pub mod score;
pub mod synth;

pub use crate::synth::scheduler::LiveInput;
pub use crate::synth::Synth;
