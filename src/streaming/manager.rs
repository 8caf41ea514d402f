//! One voice: engine, ring buffer, MIDI scheduler and paced network sender
//!
//! Two dedicated threads per voice, both paced with an additive deadline
//! (`next_tick += interval`) so successive sleeps never accumulate drift:
//!
//! - the render thread drains the scheduler, runs the engine for one block
//!   and writes the result into the ring buffer (skipped when an external
//!   real-time callback calls [`StreamManager::render_block`] instead);
//! - the send thread reads one fixed-size packet from the ring buffer per
//!   interval and hands it to the transport.
//!
//! The control plane only touches the scheduler, the pending preset slot and
//! atomics, so every public method is safe to call from any thread.

use bytes::BytesMut;
use crossbeam_channel::{bounded, SendError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio::buffer::{AudioBlock, RingBuffer, RingBufferStats};
use crate::audio::engine::AudioEngine;
use crate::config::AudioConfig;
use crate::error::StreamError;
use crate::midi::{MidiEventScheduler, MidiMessage, ScheduledEvent};
use crate::network::AudioTransport;
use crate::presets::{Preset, PresetCategory};
use crate::protocol::{encode_packet, packet_len, Role};

/// Render-side working set, locked only by whoever renders
struct Renderer {
    engine: Box<dyn AudioEngine>,
    block: AudioBlock,
    events: Vec<ScheduledEvent>,
    initialized: bool,
}

/// State shared between the manager and its threads
struct Voice {
    role: Role,
    block_size: usize,
    ring: RingBuffer,
    scheduler: Arc<MidiEventScheduler>,
    /// Preset waiting to be applied before the next block
    pending_preset: Mutex<Option<Preset>>,
    renderer: Mutex<Renderer>,
    packets_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl Voice {
    fn render_block(&self) {
        let mut renderer = self.renderer.lock();
        let Renderer { engine, block, events, initialized } = &mut *renderer;
        if !*initialized {
            return;
        }

        if let Some(preset) = self.pending_preset.lock().take() {
            match engine.set_preset(&preset) {
                Ok(()) => debug!(role = %self.role, preset = %preset.key, "Preset applied"),
                Err(e) => warn!(role = %self.role, preset = %preset.key, "Preset load failed: {}", e),
            }
        }

        events.clear();
        self.scheduler.drain_into(self.block_size, events);
        block.clear();
        engine.process(block, events);
        self.ring.write(block);
    }
}

/// Point-in-time view of a voice, for status reporting
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamStatus {
    pub role: Role,
    pub streaming: bool,
    pub engine: String,
    pub preset: Option<String>,
    pub category: Option<PresetCategory>,
    pub transport: String,
    pub packets_sent: u64,
    pub send_errors: u64,
    pub pending_midi: usize,
    pub ring: RingBufferStats,
}

/// Owns the lifecycle of one voice
pub struct StreamManager {
    voice: Arc<Voice>,
    sample_rate: u32,
    channels: u16,
    frames_per_packet: usize,
    internal_render: bool,
    transport_name: String,
    /// Parked here while stopped; owned by the send thread while streaming
    transport: Mutex<Option<Box<dyn AudioTransport>>>,
    current_preset: RwLock<Option<Preset>>,
    running: Arc<AtomicBool>,
    /// Serializes `start` and `stop`
    lifecycle: Mutex<()>,
    render_thread: Mutex<Option<JoinHandle<()>>>,
    send_thread: Mutex<Option<JoinHandle<Option<Box<dyn AudioTransport>>>>>,
}

impl StreamManager {
    /// Create a voice and initialize its engine.
    ///
    /// Fails if the engine cannot be initialized; a voice never exists
    /// without a working engine.
    pub fn new(
        role: Role,
        config: &AudioConfig,
        mut engine: Box<dyn AudioEngine>,
        transport: Box<dyn AudioTransport>,
    ) -> Result<Self, StreamError> {
        if !role.is_voice() {
            return Err(StreamError::NotAVoice(role));
        }
        config.validate()?;
        engine
            .initialize(config.sample_rate, config.block_size, config.channels)
            .map_err(|source| StreamError::Engine { role, source })?;
        info!(
            role = %role,
            engine = engine.name(),
            "Engine initialized: {}Hz, {} frames/block, {} channels",
            config.sample_rate,
            config.block_size,
            config.channels
        );

        let voice = Voice {
            role,
            block_size: config.block_size,
            ring: RingBuffer::new(config.channels, config.ring_capacity()),
            scheduler: Arc::new(MidiEventScheduler::new()),
            pending_preset: Mutex::new(None),
            renderer: Mutex::new(Renderer {
                engine,
                block: AudioBlock::new(config.channels, config.block_size),
                events: Vec::with_capacity(64),
                initialized: true,
            }),
            packets_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        };

        Ok(Self {
            voice: Arc::new(voice),
            sample_rate: config.sample_rate,
            channels: config.channels,
            frames_per_packet: config.frames_per_packet,
            internal_render: config.internal_render,
            transport_name: transport.describe(),
            transport: Mutex::new(Some(transport)),
            current_preset: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(()),
            render_thread: Mutex::new(None),
            send_thread: Mutex::new(None),
        })
    }

    /// Voice this manager renders
    pub fn role(&self) -> Role {
        self.voice.role
    }

    /// Render rate in Hz, used to turn millisecond delays into samples
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// True between a successful `start` and the next `stop`
    pub fn is_streaming(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the send loop, and the render loop when rendering internally.
    ///
    /// Re-initializes the engine if a previous `stop` released it.
    pub fn start(&self) -> Result<(), StreamError> {
        let _lifecycle = self.lifecycle.lock();
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let role = self.voice.role;

        {
            let mut renderer = self.voice.renderer.lock();
            if !renderer.initialized {
                renderer
                    .engine
                    .initialize(self.sample_rate, self.voice.block_size, self.channels)
                    .map_err(|source| StreamError::Engine { role, source })?;
                renderer.initialized = true;
            }
        }

        let Some(transport) = self.transport.lock().take() else {
            return Err(StreamError::TransportUnavailable(role));
        };
        // the send thread takes the transport from here and hands it back on exit
        let (handoff_tx, handoff_rx) = bounded::<Box<dyn AudioTransport>>(1);
        if let Err(SendError(transport)) = handoff_tx.send(transport) {
            *self.transport.lock() = Some(transport);
            return Err(StreamError::TransportUnavailable(role));
        }

        self.running.store(true, Ordering::SeqCst);

        if self.internal_render {
            let voice = self.voice.clone();
            let running = self.running.clone();
            let interval = Duration::from_secs_f64(self.voice.block_size as f64 / self.sample_rate as f64);
            let spawned = thread::Builder::new()
                .name(format!("render-{role}"))
                .spawn(move || render_loop(voice, running, interval));
            match spawned {
                Ok(handle) => *self.render_thread.lock() = Some(handle),
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    *self.transport.lock() = handoff_rx.try_recv().ok();
                    return Err(StreamError::Spawn(e.to_string()));
                }
            }
        }

        let pacing = Pacing {
            frames_per_packet: self.frames_per_packet,
            channels: self.channels,
            interval: Duration::from_secs_f64(self.frames_per_packet as f64 / self.sample_rate as f64),
        };
        let voice = self.voice.clone();
        let running = self.running.clone();
        let thread_rx = handoff_rx.clone();
        let spawned = thread::Builder::new()
            .name(format!("send-{role}"))
            .spawn(move || {
                let transport = thread_rx.recv().ok()?;
                Some(send_loop(voice, transport, running, pacing))
            });
        match spawned {
            Ok(handle) => *self.send_thread.lock() = Some(handle),
            Err(e) => {
                self.stop_locked();
                *self.transport.lock() = handoff_rx.try_recv().ok();
                return Err(StreamError::Spawn(e.to_string()));
            }
        }

        info!(
            role = %role,
            transport = %self.transport_name,
            "Streaming started: {} frames/packet every {:.2}ms",
            self.frames_per_packet,
            pacing.interval.as_secs_f64() * 1000.0
        );
        Ok(())
    }

    /// Stop both loops, wait for them to exit, then release the engine.
    ///
    /// Takes up to one packet interval. Does nothing when not running.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.stop_locked();
    }

    fn stop_locked(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let role = self.voice.role;

        if let Some(handle) = self.render_thread.lock().take() {
            if handle.join().is_err() {
                error!(role = %role, "Render thread panicked");
            }
        }
        if let Some(handle) = self.send_thread.lock().take() {
            match handle.join() {
                Ok(Some(transport)) => *self.transport.lock() = Some(transport),
                Ok(None) => error!(role = %role, "Send thread exited without a transport"),
                Err(_) => error!(role = %role, "Send thread panicked, transport lost"),
            }
        }

        {
            let mut renderer = self.voice.renderer.lock();
            if renderer.initialized {
                renderer.engine.release();
                renderer.initialized = false;
            }
        }
        info!(
            role = %role,
            packets = self.voice.packets_sent.load(Ordering::Relaxed),
            "Streaming stopped"
        );
    }

    /// Queue a preset for the engine and record it as this voice's current
    /// preset. The engine picks it up before its next block.
    pub fn set_preset(&self, preset: &Preset) {
        info!(role = %self.voice.role, preset = %preset.key, category = %preset.category, "Preset assigned");
        *self.voice.pending_preset.lock() = Some(preset.clone());
        *self.current_preset.write() = Some(preset.clone());
    }

    /// Last preset assigned, whether or not the engine has applied it yet
    pub fn current_preset(&self) -> Option<Preset> {
        self.current_preset.read().clone()
    }

    /// Category of the current preset. For the user voice this is the role
    /// its input plays against the automated voices.
    pub fn midi_role(&self) -> Option<PresetCategory> {
        self.current_preset.read().as_ref().map(|p| p.category)
    }

    /// Schedule `message` `delay_samples` into the future. Negative delays
    /// are dropped.
    pub fn enqueue_midi(&self, message: MidiMessage, delay_samples: i64) -> bool {
        let queued = self.voice.scheduler.enqueue(message, delay_samples);
        if !queued {
            debug!(role = %self.voice.role, delay_samples, "Dropped late MIDI event");
        }
        queued
    }

    /// Shared handle to this voice's scheduler
    pub fn scheduler(&self) -> Arc<MidiEventScheduler> {
        self.voice.scheduler.clone()
    }

    /// Render one block: apply a pending preset, drain due MIDI, run the
    /// engine and push the block into the ring buffer.
    ///
    /// Called by the internal render thread, or by an external real-time
    /// callback when internal rendering is off.
    pub fn render_block(&self) {
        self.voice.render_block();
    }

    /// Buffer between the render side and the send thread
    pub fn ring(&self) -> &RingBuffer {
        &self.voice.ring
    }

    /// Snapshot of counters and current assignment
    pub fn status(&self) -> StreamStatus {
        let preset = self.current_preset.read().clone();
        StreamStatus {
            role: self.voice.role,
            streaming: self.is_streaming(),
            engine: self.voice.renderer.lock().engine.name().to_string(),
            category: preset.as_ref().map(|p| p.category),
            preset: preset.map(|p| p.key),
            transport: self.transport_name.clone(),
            packets_sent: self.voice.packets_sent.load(Ordering::Relaxed),
            send_errors: self.voice.send_errors.load(Ordering::Relaxed),
            pending_midi: self.voice.scheduler.pending(),
            ring: self.voice.ring.stats(),
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy)]
struct Pacing {
    frames_per_packet: usize,
    channels: u16,
    interval: Duration,
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

fn render_loop(voice: Arc<Voice>, running: Arc<AtomicBool>, interval: Duration) {
    let mut next_tick = Instant::now();
    while running.load(Ordering::Relaxed) {
        voice.render_block();
        next_tick += interval;
        sleep_until(next_tick);
    }
}

fn send_loop(
    voice: Arc<Voice>,
    mut transport: Box<dyn AudioTransport>,
    running: Arc<AtomicBool>,
    pacing: Pacing,
) -> Box<dyn AudioTransport> {
    let mut samples = vec![0.0f32; pacing.frames_per_packet * pacing.channels as usize];
    let mut packet = BytesMut::with_capacity(packet_len(pacing.frames_per_packet, pacing.channels));
    let mut failing = false;

    // one packet of latency so the render side is a block ahead
    let mut next_tick = Instant::now() + pacing.interval;
    sleep_until(next_tick);

    while running.load(Ordering::Relaxed) {
        voice.ring.read_into(&mut samples);
        packet.clear();
        encode_packet(&samples, &mut packet);

        match transport.send(&packet) {
            Ok(()) => {
                voice.packets_sent.fetch_add(1, Ordering::Relaxed);
                if failing {
                    info!(role = %voice.role, "Transport recovered");
                    failing = false;
                }
            }
            Err(e) => {
                voice.send_errors.fetch_add(1, Ordering::Relaxed);
                if failing {
                    debug!(role = %voice.role, "Failed to send packet: {}", e);
                } else {
                    warn!(role = %voice.role, "Failed to send packet: {}", e);
                    failing = true;
                }
            }
        }

        next_tick += pacing.interval;
        sleep_until(next_tick);
    }
    transport
}
