//! Bounded ring buffer for interleaved audio samples
//!
//! This is the single handoff point between a voice's render side and its
//! network send thread. Writers never stall: when the buffer is full the
//! oldest frame is discarded to make room. Readers never stall either:
//! missing samples are returned as silence.
//!
//! Both sides take one short `parking_lot` critical section per call and do
//! no I/O or allocation while holding it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Planar block of audio produced by an engine for one render tick
#[derive(Debug, Clone)]
pub struct AudioBlock {
    channels: Vec<Vec<f32>>,
    frames: usize,
}

impl AudioBlock {
    /// Zeroed block of `channels` × `frames`
    pub fn new(channels: u16, frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; channels as usize],
            frames,
        }
    }

    /// Number of channels
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel
    pub fn num_frames(&self) -> usize {
        self.frames
    }

    /// Samples of channel `ch`
    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.channels[ch]
    }

    /// Mutable samples of channel `ch`
    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        &mut self.channels[ch]
    }

    /// Zero every sample
    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }

    /// Copy out as interleaved samples (frame-major)
    pub fn interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.frames * self.channels.len());
        for frame in 0..self.frames {
            for channel in &self.channels {
                out.push(channel[frame]);
            }
        }
        out
    }
}

struct Storage {
    data: Vec<f32>,
    write_pos: usize,
    read_pos: usize,
    /// Unread samples; disambiguates full from empty when the cursors meet
    available: usize,
}

/// Fixed-capacity interleaved sample store
pub struct RingBuffer {
    channels: usize,
    storage: Mutex<Storage>,
    /// Frames discarded because the writer overtook the reader
    overrun_frames: AtomicUsize,
    /// Reads that had to be padded with silence
    underrun_count: AtomicUsize,
}

impl RingBuffer {
    /// Create a buffer holding `capacity_frames` frames of `channels` samples.
    pub fn new(channels: u16, capacity_frames: usize) -> Self {
        let channels = (channels as usize).max(1);
        let total = capacity_frames.max(1) * channels;
        Self {
            channels,
            storage: Mutex::new(Storage {
                data: vec![0.0; total],
                write_pos: 0,
                read_pos: 0,
                available: 0,
            }),
            overrun_frames: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Append a planar block, interleaving it.
    ///
    /// Channels beyond the buffer's channel count are ignored; channels the
    /// block lacks are written as silence so frames stay aligned.
    pub fn write(&self, block: &AudioBlock) {
        let present = block.num_channels().min(self.channels);
        let mut dropped = 0;
        {
            let mut s = self.storage.lock();
            let total = s.data.len();
            for frame in 0..block.num_frames() {
                if s.available + self.channels > total {
                    s.read_pos = (s.read_pos + self.channels) % total;
                    s.available -= self.channels;
                    dropped += 1;
                }
                for ch in 0..self.channels {
                    let sample = if ch < present {
                        block.channel(ch)[frame]
                    } else {
                        0.0
                    };
                    let pos = s.write_pos;
                    s.data[pos] = sample;
                    s.write_pos = (pos + 1) % total;
                }
                s.available += self.channels;
            }
        }
        if dropped > 0 {
            self.overrun_frames.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    /// Append already-interleaved samples. A trailing partial frame is dropped.
    pub fn write_interleaved(&self, samples: &[f32]) {
        let mut dropped = 0;
        {
            let mut s = self.storage.lock();
            let total = s.data.len();
            for frame in samples.chunks_exact(self.channels) {
                if s.available + self.channels > total {
                    s.read_pos = (s.read_pos + self.channels) % total;
                    s.available -= self.channels;
                    dropped += 1;
                }
                for &sample in frame {
                    let pos = s.write_pos;
                    s.data[pos] = sample;
                    s.write_pos = (pos + 1) % total;
                }
                s.available += self.channels;
            }
        }
        if dropped > 0 {
            self.overrun_frames.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    /// Fill `destination` completely, padding any shortfall with zeros.
    ///
    /// Returns how many samples came from the buffer.
    pub fn read_into(&self, destination: &mut [f32]) -> usize {
        let got = {
            let mut s = self.storage.lock();
            let total = s.data.len();
            let got = destination.len().min(s.available);
            for slot in destination.iter_mut().take(got) {
                *slot = s.data[s.read_pos];
                s.read_pos = (s.read_pos + 1) % total;
            }
            s.available -= got;
            got
        };
        destination[got..].fill(0.0);
        if got < destination.len() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        got
    }

    /// Read exactly `count` samples; the shortfall is silence.
    pub fn read(&self, count: usize) -> Vec<f32> {
        let mut out = vec![0.0; count];
        self.read_into(&mut out);
        out
    }

    /// Unread samples currently held
    pub fn len(&self) -> usize {
        self.storage.lock().available
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity in samples (frames × channels)
    pub fn capacity(&self) -> usize {
        self.storage.lock().data.len()
    }

    /// Samples per frame
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        let s = self.storage.lock();
        s.available as f32 / s.data.len() as f32
    }

    /// Current fill level and the overrun and underrun counters
    pub fn stats(&self) -> RingBufferStats {
        RingBufferStats {
            fill_level: self.fill_level(),
            overrun_frames: self.overrun_frames.load(Ordering::Relaxed),
            underruns: self.underrun_count.load(Ordering::Relaxed),
        }
    }
}

/// Ring buffer counters
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RingBufferStats {
    pub fill_level: f32,
    pub overrun_frames: usize,
    pub underruns: usize,
}
