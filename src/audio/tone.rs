//! Minimal polyphonic oscillator engine
//!
//! Stands in for a plugin host so voices can run headless. The waveform and
//! envelope follow the category of the loaded preset.

use std::f32::consts::TAU;

use crate::audio::buffer::AudioBlock;
use crate::audio::engine::AudioEngine;
use crate::error::EngineError;
use crate::midi::{MidiMessage, ScheduledEvent};
use crate::presets::{Preset, PresetCategory};

const MAX_VOICES: usize = 16;
const OUTPUT_GAIN: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Waveform {
    Sine,
    Saw,
    Square,
    Triangle,
}

#[derive(Debug, Clone, Copy)]
struct Shape {
    waveform: Waveform,
    attack_s: f32,
    /// Time for a released note to fall by 60 dB
    release_s: f32,
    /// Per-second decay while held, 0 for sustained sounds
    decay_per_s: f32,
}

impl Shape {
    fn for_category(category: PresetCategory) -> Self {
        match category {
            PresetCategory::Bass => Shape { waveform: Waveform::Square, attack_s: 0.005, release_s: 0.08, decay_per_s: 0.0 },
            PresetCategory::Lead => Shape { waveform: Waveform::Saw, attack_s: 0.01, release_s: 0.15, decay_per_s: 0.0 },
            PresetCategory::Pad => Shape { waveform: Waveform::Sine, attack_s: 0.4, release_s: 1.2, decay_per_s: 0.0 },
            PresetCategory::Pluck => Shape { waveform: Waveform::Triangle, attack_s: 0.002, release_s: 0.1, decay_per_s: 4.0 },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    note: u8,
    phase: f32,
    increment: f32,
    velocity: f32,
    level: f32,
    released: bool,
}

impl Voice {
    fn sample(&self, waveform: Waveform) -> f32 {
        match waveform {
            Waveform::Sine => (self.phase * TAU).sin(),
            Waveform::Saw => 2.0 * self.phase - 1.0,
            Waveform::Square => if self.phase < 0.5 { 1.0 } else { -1.0 },
            Waveform::Triangle => 1.0 - 4.0 * (self.phase - 0.5).abs(),
        }
    }
}

/// Oscillator engine implementing [`AudioEngine`]
pub struct ToneEngine {
    sample_rate: f32,
    shape: Shape,
    voices: Vec<Voice>,
    initialized: bool,
}

impl ToneEngine {
    /// Silent engine; call `initialize` before processing
    pub fn new() -> Self {
        Self {
            sample_rate: 0.0,
            shape: Shape::for_category(PresetCategory::Lead),
            voices: Vec::with_capacity(MAX_VOICES),
            initialized: false,
        }
    }

    /// Notes currently sounding, including releasing ones
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    fn handle(&mut self, message: MidiMessage) {
        match message {
            MidiMessage::NoteOn { note, velocity, .. } => {
                if self.voices.len() == MAX_VOICES {
                    // steal the oldest
                    self.voices.remove(0);
                }
                let freq = 440.0 * 2f32.powf((note as f32 - 69.0) / 12.0);
                self.voices.push(Voice {
                    note,
                    phase: 0.0,
                    increment: freq / self.sample_rate,
                    velocity: velocity as f32 / 127.0,
                    level: 0.0,
                    released: false,
                });
            }
            MidiMessage::NoteOff { note, .. } => {
                for voice in self.voices.iter_mut().filter(|v| v.note == note) {
                    voice.released = true;
                }
            }
        }
    }
}

impl Default for ToneEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEngine for ToneEngine {
    fn initialize(&mut self, sample_rate: u32, _block_size: usize, channels: u16)
        -> Result<(), EngineError> {
        if sample_rate == 0 {
            return Err(EngineError::InitFailed("sample rate must be non-zero".into()));
        }
        if channels == 0 || channels > 8 {
            return Err(EngineError::UnsupportedChannels(channels));
        }
        self.sample_rate = sample_rate as f32;
        self.initialized = true;
        Ok(())
    }

    fn set_preset(&mut self, preset: &Preset) -> Result<(), EngineError> {
        self.shape = Shape::for_category(preset.category);
        self.voices.clear();
        Ok(())
    }

    fn process(&mut self, block: &mut AudioBlock, events: &[ScheduledEvent]) {
        if !self.initialized {
            return;
        }
        let shape = self.shape;
        let attack_step = 1.0 / (shape.attack_s * self.sample_rate).max(1.0);
        // exp(ln(0.001) / samples) reaches -60 dB after release_s
        let release_mul = (-6.9078 / (shape.release_s * self.sample_rate)).exp();
        let decay_mul = (-shape.decay_per_s / self.sample_rate).exp();

        let mut next_event = 0;
        for frame in 0..block.num_frames() {
            while next_event < events.len() && events[next_event].offset <= frame {
                self.handle(events[next_event].message);
                next_event += 1;
            }

            let mut mix = 0.0;
            for voice in &mut self.voices {
                if voice.released {
                    voice.level *= release_mul;
                } else if voice.level < 1.0 {
                    voice.level = (voice.level + attack_step).min(1.0);
                } else {
                    voice.level *= decay_mul;
                }
                mix += voice.sample(shape.waveform) * voice.level * voice.velocity;
                voice.phase = (voice.phase + voice.increment).fract();
            }
            let out = mix * OUTPUT_GAIN;
            for ch in 0..block.num_channels() {
                block.channel_mut(ch)[frame] = out;
            }
            self.voices.retain(|v| !(v.released && v.level < 1e-4));
        }
        // events past the end of the block still apply
        for event in &events[next_event..] {
            self.handle(event.message);
        }
    }

    fn release(&mut self) {
        self.voices.clear();
        self.initialized = false;
    }

    fn name(&self) -> &str {
        "tone"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(message: MidiMessage, offset: usize) -> ScheduledEvent {
        ScheduledEvent { message, offset }
    }

    #[test]
    fn test_silent_until_note_offset() {
        let mut engine = ToneEngine::new();
        engine.initialize(48000, 64, 2).unwrap();
        let mut block = AudioBlock::new(2, 64);
        engine.process(&mut block, &[event(MidiMessage::note_on(0, 69, 127), 32)]);

        assert!(block.channel(0)[..32].iter().all(|&s| s == 0.0));
        assert!(block.channel(0)[33..].iter().any(|&s| s != 0.0));
        assert_eq!(block.channel(0), block.channel(1));
    }

    #[test]
    fn test_note_off_releases_voice() {
        let mut engine = ToneEngine::new();
        engine.initialize(48000, 512, 1).unwrap();
        let mut block = AudioBlock::new(1, 512);
        engine.process(&mut block, &[event(MidiMessage::note_on(0, 60, 100), 0)]);
        assert_eq!(engine.active_voices(), 1);

        engine.process(&mut block, &[event(MidiMessage::note_off(0, 60), 0)]);
        for _ in 0..200 {
            block.clear();
            engine.process(&mut block, &[]);
        }
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_rejects_zero_sample_rate() {
        let mut engine = ToneEngine::new();
        assert!(engine.initialize(0, 512, 2).is_err());
        assert!(matches!(
            engine.initialize(48000, 512, 0),
            Err(EngineError::UnsupportedChannels(0))
        ));
    }
}
