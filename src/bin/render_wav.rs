// src/bin/render_wav.rs

//! Offline demo renderer: builds a small three-channel score and writes it
//! to a stereo WAV file.
//!
//! Usage: `render-wav [output.wav]`

use anyhow::Result;
use chipsynth::config::{self, SynthConfig};
use chipsynth::instrument::{ChordPolicy, EchoSettings, Instrument, Transition};
use chipsynth::score::{Channel, ChannelKind, Note, Pattern, Song};
use chipsynth::Synth;
use std::path::Path;

const SAMPLE_RATE: f64 = 44100.0;

fn build_demo_song() -> Song {
    let mut song = Song::new();
    song.tempo = 150.0;
    song.bar_count = 2;
    song.loop_length = 2;
    song.key = 0;

    let beat = config::PARTS_PER_BEAT as f64;

    // Lead: square chip with echo and a slide between the last two notes.
    let mut lead_channel = Channel::new(ChannelKind::Pitch);
    let mut lead = Instrument::chip(1);
    lead.name = "lead".into();
    lead.effects.echo = Some(EchoSettings {
        sustain: 0.45,
        delay_parts: 12.0,
    });
    lead.transition = Transition::Slide;
    lead.fade_in = 1;
    lead_channel.instruments.push(lead);
    lead_channel.octave = 2;
    lead_channel.patterns.push(Pattern::new(
        vec![0],
        vec![
            Note::simple(vec![48], 0.0, beat),
            Note::simple(vec![52], beat, beat * 2.0),
            Note::simple(vec![55], beat * 2.0, beat * 3.0),
            Note::simple(vec![60], beat * 3.0, beat * 4.0),
        ],
    ));
    lead_channel.patterns.push(Pattern::new(
        vec![0],
        vec![
            Note::simple(vec![60, 64, 67], 0.0, beat * 2.0),
            Note::simple(vec![55], beat * 2.0, beat * 4.0),
        ],
    ));
    lead_channel.bars = vec![1, 2];
    song.channels.push(lead_channel);

    // Bass: FM with a serial modulator chain, arpeggiating.
    let mut bass_channel = Channel::new(ChannelKind::Pitch);
    let mut bass = Instrument::fm(4);
    bass.name = "bass".into();
    bass.fm.operators[1].amplitude = 9.0;
    bass.chord = ChordPolicy::Arpeggio;
    bass.arpeggio_speed = 0.5;
    bass_channel.instruments.push(bass);
    bass_channel.octave = 1;
    bass_channel.patterns.push(Pattern::new(
        vec![0],
        vec![Note::simple(vec![24, 31], 0.0, beat * 4.0)],
    ));
    bass_channel.bars = vec![1, 1];
    song.channels.push(bass_channel);

    // Drums: retro noise hits on every beat.
    let mut drum_channel = Channel::new(ChannelKind::Noise);
    let mut drums = Instrument::noise(0);
    drums.name = "drums".into();
    drum_channel.instruments.push(drums);
    let hits: Vec<Note> = (0..4)
        .map(|i| Note::simple(vec![60 + (i % 2) * 7], i as f64 * beat, i as f64 * beat + 6.0))
        .collect();
    drum_channel.patterns.push(Pattern::new(vec![0], hits));
    drum_channel.bars = vec![1, 1];
    song.channels.push(drum_channel);

    song
}

fn write_wav(path: &Path, left: &[f32], right: &[f32], sample_rate: f64) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: sample_rate as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    let amplitude = i16::MAX as f32;
    for (l, r) in left.iter().zip(right.iter()) {
        writer.write_sample((l * amplitude) as i16)?;
        writer.write_sample((r * amplitude) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let output = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "out.wav".to_string());

    let song = build_demo_song();
    let mut synth = Synth::new(SynthConfig::new(SAMPLE_RATE));
    synth.set_loop_repeat_count(1); // play the two bars twice

    let chunk = 2048;
    let mut buffer_left = vec![0.0_f32; chunk];
    let mut buffer_right = vec![0.0_f32; chunk];
    let mut left = Vec::new();
    let mut right = Vec::new();

    while !synth.song_ended() {
        synth.synthesize(&song, &mut buffer_left, &mut buffer_right, chunk, true)?;
        left.extend_from_slice(&buffer_left);
        right.extend_from_slice(&buffer_right);
    }
    // Let the echo tail ring out.
    for _ in 0..((SAMPLE_RATE as usize) / chunk) {
        synth.synthesize(&song, &mut buffer_left, &mut buffer_right, chunk, false)?;
        left.extend_from_slice(&buffer_left);
        right.extend_from_slice(&buffer_right);
    }

    write_wav(Path::new(&output), &left, &right, SAMPLE_RATE)?;
    log::info!(
        "wrote {} ({:.1}s at {} Hz)",
        output,
        left.len() as f64 / SAMPLE_RATE,
        SAMPLE_RATE
    );
    println!("wrote {}", output);
    Ok(())
}
