//! # Synth Stream
//!
//! Multi-voice synthesizer audio streaming with sample-accurate remote MIDI
//! scheduling.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          CONTROL PLANE (tokio)                            │
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────────┐               │
//! │  │ preset_control│   │composer_output│   │ input_forward │  DuplexClient │
//! │  └───────┬───────┘   └───────┬───────┘   └───────▲───────┘               │
//! │          │ {preset}          │ {role,note,ts}    │ {note,ts}             │
//! │          ▼                   ▼                   │                       │
//! │  ┌─────────────────────────────────────────┐     │                       │
//! │  │  StreamController (streaming::controller)│     │                       │
//! │  │  Role -> StreamManager registry          │     │                       │
//! │  └────────┬──────────────┬─────────────────┘     │                       │
//! └───────────┼──────────────┼───────────────────────┼───────────────────────┘
//!             │ preset slot  │ enqueue_midi          │
//!             ▼              ▼                       │
//! ┌──────────────────────────────────────────────────┼───────────────────────┐
//! │  StreamManager (one per voice)                   │                       │
//! │  ┌──────────────┐   ┌──────────────┐   ┌─────────┴────┐                  │
//! │  │ Render thread│──▶│ MidiScheduler│   │InputForwarder│◀─ local MIDI     │
//! │  │ AudioEngine  │   └──────────────┘   └──────────────┘                  │
//! │  └──────┬───────┘                                                        │
//! │         ▼                                                                │
//! │  ┌──────────────┐   ┌──────────────┐                                     │
//! │  │  RingBuffer  │──▶│ Send thread  │──▶ UDP / binary WebSocket           │
//! │  └──────────────┘   └──────────────┘    [f32 LE interleaved, no header]  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod midi;
pub mod network;
pub mod presets;
pub mod protocol;
pub mod streaming;

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default render block size in frames
    pub const DEFAULT_BLOCK_SIZE: usize = 512;

    /// Default transport packet size in frames
    pub const DEFAULT_FRAMES_PER_PACKET: usize = 512;

    /// First UDP port used by the default voice layout
    pub const DEFAULT_UDP_BASE_PORT: u16 = 9000;

    /// Default control-plane WebSocket endpoint
    pub const DEFAULT_BRIDGE_URL: &str = "ws://localhost:8080";

    /// Capacity of the local MIDI input channel
    pub const INPUT_QUEUE_CAPACITY: usize = 256;

    /// Grace period for the control runtime to wind down at shutdown
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 500;
}
