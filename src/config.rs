//! Application configuration
//!
//! Loaded from TOML. Every section has defaults that reproduce the stock
//! five-voice layout, so an empty file (or no file) is a valid config.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::ConfigError;
use crate::protocol::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub presets: PresetConfig,
    pub streams: Vec<StreamConfig>,
    pub connections: Vec<ConnectionConfig>,
    pub input: InputConfig,
}

/// Rendering and packetization parameters shared by every voice
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Frames per render block
    pub block_size: usize,
    pub channels: u16,
    /// Frames per transport packet
    pub frames_per_packet: usize,
    /// Ring buffer size in frames; twice the larger of block and packet
    /// when unset
    pub ring_capacity_frames: Option<usize>,
    /// Render from a per-voice thread. Turn off when an external real-time
    /// callback drives `StreamManager::render_block` instead.
    pub internal_render: bool,
}

impl AudioConfig {
    /// Ring buffer size in frames
    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity_frames
            .unwrap_or(2 * self.block_size.max(self.frames_per_packet))
    }

    /// Reject values the render and send loops cannot run with.
    ///
    /// The ring must hold at least one block and one packet, otherwise every
    /// packet is partly padding while the writer overruns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be non-zero".into()));
        }
        if self.block_size == 0 || self.frames_per_packet == 0 {
            return Err(ConfigError::Invalid(
                "block_size and frames_per_packet must be non-zero".into(),
            ));
        }
        if self.channels == 0 {
            return Err(ConfigError::Invalid("channels must be non-zero".into()));
        }
        let needed = self.block_size.max(self.frames_per_packet);
        if self.ring_capacity() < needed {
            return Err(ConfigError::Invalid(format!(
                "ring_capacity_frames {} is smaller than {} (block or packet size)",
                self.ring_capacity(),
                needed
            )));
        }
        Ok(())
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            channels: DEFAULT_CHANNELS,
            frames_per_packet: DEFAULT_FRAMES_PER_PACKET,
            ring_capacity_frames: None,
            internal_render: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetConfig {
    /// Root directory preset locators are resolved against
    pub directory: PathBuf,
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("resources/presets"),
        }
    }
}

/// One voice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub role: Role,
    pub transport: TransportConfig,
    /// Catalog key loaded when the voice starts
    #[serde(default)]
    pub initial_preset: Option<String>,
}

/// Where a voice's audio packets go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Udp { target: SocketAddr },
    /// Binary frames over the duplex connection registered under `connection`
    WebSocket { connection: Role },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Json,
    Binary,
}

/// What a JSON connection does with inbound messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    PresetChange,
    ComposedOutput,
    /// Outbound only; inbound messages are logged and ignored
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: Role,
    pub url: String,
    #[serde(default)]
    pub mode: ConnectionMode,
    #[serde(default)]
    pub handler: HandlerKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Connection that receives forwarded local input, if any
    pub forward_to: Option<Role>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let streams = Role::VOICES
            .iter()
            .zip(DEFAULT_UDP_BASE_PORT..)
            .map(|(&role, port)| StreamConfig {
                role,
                transport: TransportConfig::Udp {
                    target: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
                },
                initial_preset: None,
            })
            .collect();

        let connection = |id, path: &str, handler| ConnectionConfig {
            id,
            url: format!("{DEFAULT_BRIDGE_URL}{path}"),
            mode: ConnectionMode::Json,
            handler,
        };

        Self {
            audio: AudioConfig::default(),
            presets: PresetConfig::default(),
            streams,
            connections: vec![
                connection(Role::PresetControl, "/user/preset", HandlerKind::PresetChange),
                connection(Role::ComposerOutput, "/composer/output", HandlerKind::ComposedOutput),
                connection(Role::InputForward, "/user/input", HandlerKind::None),
            ],
            input: InputConfig {
                forward_to: Some(Role::InputForward),
            },
        }
    }
}

impl AppConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Standard per-user config location, e.g. `~/.config/synth-stream/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "synth-stream")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, else from [`Self::default_path`] if that file
    /// exists, else fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Check the audio section, stream roles and connection ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.audio.validate()?;

        let mut roles = HashSet::new();
        for stream in &self.streams {
            if !stream.role.is_voice() {
                return Err(ConfigError::Invalid(format!("{} is not a voice role", stream.role)));
            }
            if !roles.insert(stream.role) {
                return Err(ConfigError::Invalid(format!("duplicate stream role {}", stream.role)));
            }
        }

        let mut ids = HashSet::new();
        for connection in &self.connections {
            if !ids.insert(connection.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate connection id {}",
                    connection.id
                )));
            }
        }
        Ok(())
    }
}
