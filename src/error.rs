//! Error types for the synth streaming host
//!
//! One enum per subsystem. Binaries wrap them with `anyhow` at the top level.

use thiserror::Error;

use crate::protocol::Role;

/// Sound-generating adapter errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine initialization failed: {0}")]
    InitFailed(String),

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    #[error("Engine is not initialized")]
    NotInitialized,
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Resolve failed: {0}")]
    ResolveFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Payload does not match connection mode: {0}")]
    WrongMode(&'static str),
}

/// Voice lifecycle and registry errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream not found: {0}")]
    NotFound(Role),

    #[error("Stream already exists: {0}")]
    AlreadyExists(Role),

    #[error("Connection already exists: {0}")]
    ConnectionExists(Role),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(Role),

    #[error("Role {0} is a control key, not a voice")]
    NotAVoice(Role),

    #[error("Transport unavailable for {0}")]
    TransportUnavailable(Role),

    #[error("Transport setup failed for {role}: {source}")]
    Transport {
        role: Role,
        #[source]
        source: NetworkError,
    },

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),

    #[error("Invalid audio settings: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine failed for {role}: {source}")]
    Engine {
        role: Role,
        #[source]
        source: EngineError,
    },
}

/// Recoverable control-plane errors, logged at the handler boundary
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("Malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Event is {late_ms} ms late")]
    LateEvent { late_ms: i64 },

    #[error("Voice unavailable: {0}")]
    VoiceUnavailable(Role),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
