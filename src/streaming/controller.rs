//! Voice registry and control-plane routing
//!
//! The controller owns every [`StreamManager`] (keyed by [`Role`]), every
//! [`DuplexClient`] (keyed by the role its connection serves) and the tokio
//! runtime the connections run on. Control messages arrive on connection
//! tasks and are routed to voices through [`ControlHandler`].

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, error, info, warn};

use crate::audio::engine::AudioEngine;
use crate::config::{AppConfig, AudioConfig, ConnectionConfig, ConnectionMode, HandlerKind, TransportConfig};
use crate::constants::SHUTDOWN_TIMEOUT_MS;
use crate::error::{ControlError, NetworkError, StreamError};
use crate::midi::{InputForwarder, MidiMessage};
use crate::network::{
    AudioTransport, ClientHandle, ClientMode, ConnectionState, DuplexClient, JsonHandler,
    UdpAudioSender,
};
use crate::presets::PresetCatalog;
use crate::protocol::{epoch_millis, NoteEvent, PresetChange, Role};

use super::manager::{StreamManager, StreamStatus};

type Streams = Arc<DashMap<Role, StreamManager>>;

/// Borrowed registry entry
pub type StreamRef<'a> = dashmap::mapref::one::Ref<'a, Role, StreamManager>;

/// Snapshot of one control connection
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionStatus {
    pub id: Role,
    pub url: String,
    pub mode: ConnectionMode,
    pub state: ConnectionState,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub parse_errors: u64,
}

pub struct StreamController {
    runtime: Option<Runtime>,
    handle: Handle,
    streams: Streams,
    connections: DashMap<Role, DuplexClient>,
    catalog: Arc<PresetCatalog>,
}

impl StreamController {
    /// Create an empty controller with its own I/O runtime.
    pub fn new(catalog: Arc<PresetCatalog>) -> Result<Self, StreamError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("control-io")
            .enable_all()
            .build()
            .map_err(|e| StreamError::Spawn(e.to_string()))?;
        let handle = runtime.handle().clone();

        Ok(Self {
            runtime: Some(runtime),
            handle,
            streams: Arc::new(DashMap::new()),
            connections: DashMap::new(),
            catalog,
        })
    }

    /// Runtime the connections run on
    pub fn runtime(&self) -> &Handle {
        &self.handle
    }

    /// Map a category label to the voice that plays it. Unrecognized labels
    /// route to the user voice.
    pub fn role_for_label(label: &str) -> Role {
        Role::from_label(label)
    }

    /// Register a connection and start connecting in the background.
    pub fn add_connection(
        &self,
        id: Role,
        url: impl Into<String>,
        mode: ClientMode,
    ) -> Result<(), StreamError> {
        match self.connections.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StreamError::ConnectionExists(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let client = DuplexClient::new(id, url, mode);
                info!(connection = %id, url = client.url(), mode = ?client.mode(), "Connection added");
                client.run(&self.handle);
                slot.insert(client);
                Ok(())
            }
        }
    }

    /// Send handle for a registered connection
    pub fn connection(&self, id: Role) -> Option<ClientHandle> {
        self.connections.get(&id).map(|client| client.handle())
    }

    /// Inbound behaviour for a configured connection
    pub fn client_mode(&self, config: &ConnectionConfig) -> ClientMode {
        match config.mode {
            ConnectionMode::Binary => ClientMode::Binary(None),
            ConnectionMode::Json => ClientMode::Json(Arc::new(self.handler(config.handler))),
        }
    }

    /// Build the JSON handler for `kind`, bound to this controller's voices
    pub fn handler(&self, kind: HandlerKind) -> ControlHandler {
        match kind {
            HandlerKind::PresetChange => ControlHandler::PresetChange {
                streams: self.streams.clone(),
                catalog: self.catalog.clone(),
            },
            HandlerKind::ComposedOutput => ControlHandler::ComposedOutput {
                streams: self.streams.clone(),
            },
            HandlerKind::None => ControlHandler::Ignore,
        }
    }

    /// Create a voice per `transport`, start it and register it.
    ///
    /// A WebSocket transport must name a binary connection added earlier.
    pub fn add_stream(
        &self,
        role: Role,
        audio: &AudioConfig,
        transport: &TransportConfig,
        engine: Box<dyn AudioEngine>,
    ) -> Result<(), StreamError> {
        let transport: Box<dyn AudioTransport> = match transport {
            TransportConfig::Udp { target } => Box::new(
                UdpAudioSender::new(*target).map_err(|source| StreamError::Transport { role, source })?,
            ),
            TransportConfig::WebSocket { connection } => {
                let client = self
                    .connections
                    .get(connection)
                    .ok_or(StreamError::ConnectionNotFound(*connection))?;
                if client.mode() != ConnectionMode::Binary {
                    return Err(StreamError::Transport {
                        role,
                        source: NetworkError::WrongMode("audio needs a binary connection"),
                    });
                }
                Box::new(client.handle())
            }
        };
        self.add_stream_with_transport(role, audio, engine, transport)
    }

    /// Like [`Self::add_stream`] with a caller-supplied transport
    pub fn add_stream_with_transport(
        &self,
        role: Role,
        audio: &AudioConfig,
        engine: Box<dyn AudioEngine>,
        transport: Box<dyn AudioTransport>,
    ) -> Result<(), StreamError> {
        match self.streams.entry(role) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StreamError::AlreadyExists(role)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let manager = StreamManager::new(role, audio, engine, transport)?;
                manager.start()?;
                slot.insert(manager);
                Ok(())
            }
        }
    }

    /// Bring up everything `config` describes.
    ///
    /// Connections come first so audio connections exist when their voices
    /// resolve them. A voice or connection that fails is logged and skipped;
    /// the rest still come up. Returns what failed.
    pub fn configure(
        &self,
        config: &AppConfig,
        mut make_engine: impl FnMut(Role) -> Box<dyn AudioEngine>,
    ) -> Vec<(Role, StreamError)> {
        let mut failures = Vec::new();

        for connection in &config.connections {
            let mode = self.client_mode(connection);
            if let Err(e) = self.add_connection(connection.id, connection.url.clone(), mode) {
                error!(connection = %connection.id, "Failed to add connection: {}", e);
                failures.push((connection.id, e));
            }
        }

        for stream in &config.streams {
            let role = stream.role;
            if let Err(e) = self.add_stream(role, &config.audio, &stream.transport, make_engine(role)) {
                error!(role = %role, "Voice unavailable: {}", e);
                failures.push((role, e));
                continue;
            }
            if let Some(key) = &stream.initial_preset {
                match self.catalog.get(key) {
                    Ok(preset) => {
                        if let Ok(voice) = self.stream(role) {
                            voice.set_preset(preset);
                        }
                    }
                    Err(e) => warn!(role = %role, "Initial preset skipped: {}", e),
                }
            }
        }

        info!(
            voices = self.streams.len(),
            connections = self.connections.len(),
            failed = failures.len(),
            "Controller configured"
        );
        failures
    }

    /// Look up a voice. Missing voices are an error.
    pub fn stream(&self, role: Role) -> Result<StreamRef<'_>, StreamError> {
        self.streams.get(&role).ok_or(StreamError::NotFound(role))
    }

    /// Start forwarding local input to the user voice, and outward over
    /// `connection` when it is registered.
    pub fn input_forwarder(&self, connection: Option<Role>) -> Result<InputForwarder, StreamError> {
        let scheduler = self.stream(Role::User)?.scheduler();
        let handle = match connection {
            Some(id) => Some(self.connection(id).ok_or(StreamError::ConnectionNotFound(id))?),
            None => None,
        };
        InputForwarder::start(scheduler, handle)
    }

    /// Status of every voice, in role order
    pub fn statuses(&self) -> Vec<StreamStatus> {
        Role::VOICES
            .iter()
            .filter_map(|role| self.streams.get(role).map(|voice| voice.status()))
            .collect()
    }

    /// Status of every connection, sorted by id
    pub fn connection_statuses(&self) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<_> = self
            .connections
            .iter()
            .map(|client| ConnectionStatus {
                id: client.id(),
                url: client.url().to_string(),
                mode: client.mode(),
                state: client.state(),
                frames_sent: client.frames_sent(),
                frames_received: client.frames_received(),
                parse_errors: client.parse_errors(),
            })
            .collect();
        statuses.sort_by_key(|status| status.id.as_str());
        statuses
    }

    /// Close every connection, stop every voice, then stop the I/O runtime.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        info!("Shutting down controller");

        for client in self.connections.iter() {
            client.close();
        }
        for voice in self.streams.iter() {
            debug!(role = %voice.role(), "Stopping voice");
            voice.stop();
        }
        self.streams.clear();
        self.connections.clear();

        runtime.shutdown_timeout(Duration::from_millis(SHUTDOWN_TIMEOUT_MS));
        info!("Controller stopped");
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Routes inbound control messages to voices
pub enum ControlHandler {
    /// `{ "preset": name }` switches the user voice and re-rolls the others
    PresetChange {
        streams: Streams,
        catalog: Arc<PresetCatalog>,
    },
    /// Timestamped note events for the voice named by their label
    ComposedOutput { streams: Streams },
    /// Outbound-only connection
    Ignore,
}

impl JsonHandler for ControlHandler {
    fn handle(&self, message: serde_json::Value) -> Result<(), ControlError> {
        match self {
            Self::PresetChange { streams, catalog } => {
                let change: PresetChange = serde_json::from_value(message)?;
                change_preset(streams, catalog, &change)
            }
            Self::ComposedOutput { streams } => {
                let event: NoteEvent = serde_json::from_value(message)?;
                schedule_composed(streams, &event)
            }
            Self::Ignore => {
                debug!(%message, "Ignoring inbound message");
                Ok(())
            }
        }
    }
}

/// Assign the named preset to the user voice, then give every automated
/// voice of a different category a fresh random preset of its own category.
fn change_preset(
    streams: &DashMap<Role, StreamManager>,
    catalog: &PresetCatalog,
    change: &PresetChange,
) -> Result<(), ControlError> {
    let preset = catalog.get(&change.preset)?;
    streams
        .get(&Role::User)
        .ok_or(ControlError::VoiceUnavailable(Role::User))?
        .set_preset(preset);

    let mut rng = rand::rng();
    for role in Role::AUXILIARY {
        let Some(category) = role.category() else {
            continue;
        };
        if category == preset.category {
            continue;
        }
        let Some(voice) = streams.get(&role) else {
            debug!(role = %role, "No voice to re-roll");
            continue;
        };
        match catalog.random(category, &mut rng) {
            Some(pick) => voice.set_preset(pick),
            None => warn!(role = %role, %category, "No presets in category"),
        }
    }
    Ok(())
}

/// Schedule a composed note on its voice, `timestamp - now` from now.
/// Events whose timestamp has already passed are dropped.
fn schedule_composed(streams: &DashMap<Role, StreamManager>, event: &NoteEvent) -> Result<(), ControlError> {
    let role = Role::from_label(event.role.as_deref().unwrap_or_default());
    let voice = streams.get(&role).ok_or(ControlError::VoiceUnavailable(role))?;
    let message = MidiMessage::from_event(event)?;

    let delta_ms = event.timestamp - epoch_millis();
    if delta_ms < 0 {
        return Err(ControlError::LateEvent { late_ms: -delta_ms });
    }
    let delay_samples = (delta_ms as f64 * voice.sample_rate() as f64 / 1000.0).round() as i64;
    voice.enqueue_midi(message, delay_samples);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::engine::testing::{FailingEngine, RecordingEngine};
    use crate::config::StreamConfig;
    use crate::network::test_support::{spawn_ws_server, RecordingTransport};
    use crate::presets::PresetCategory;
    use crate::protocol::NoteEventKind;
    use std::thread;
    use std::time::Instant;

    fn audio() -> AudioConfig {
        AudioConfig {
            sample_rate: 48000,
            block_size: 64,
            channels: 2,
            frames_per_packet: 64,
            ring_capacity_frames: Some(256),
            internal_render: false,
        }
    }

    fn controller_with_voices() -> StreamController {
        let controller = StreamController::new(Arc::new(PresetCatalog::builtin("presets"))).unwrap();
        for role in Role::VOICES {
            controller
                .add_stream_with_transport(
                    role,
                    &audio(),
                    Box::new(RecordingEngine::default()),
                    Box::new(RecordingTransport::default()),
                )
                .unwrap();
        }
        controller
    }

    fn note(label: &str, timestamp: i64) -> serde_json::Value {
        serde_json::json!({
            "role": label,
            "type": "note_on",
            "note": 64,
            "velocity": 90,
            "timestamp": timestamp,
        })
    }

    #[test]
    fn test_role_for_label() {
        assert_eq!(StreamController::role_for_label("pad"), Role::AiPad);
        assert_eq!(StreamController::role_for_label("drums"), Role::User);
    }

    #[test]
    fn test_bass_preset_rerolls_other_categories() {
        let controller = controller_with_voices();
        let handler = controller.handler(HandlerKind::PresetChange);

        handler.handle(serde_json::json!({ "preset": "COLONY" })).unwrap();

        let user = controller.stream(Role::User).unwrap();
        assert_eq!(user.current_preset().unwrap().key, "COLONY");
        assert_eq!(user.midi_role(), Some(PresetCategory::Bass));
        drop(user);

        for role in [Role::AiLead, Role::AiPad, Role::AiPluck] {
            let voice = controller.stream(role).unwrap();
            let category = voice.midi_role().unwrap();
            assert_ne!(category, PresetCategory::Bass);
            assert_eq!(Some(category), role.category());
        }
        // same category as the user voice: left alone
        assert!(controller.stream(Role::AiBass).unwrap().current_preset().is_none());
        controller.shutdown();
    }

    #[test]
    fn test_unknown_preset_changes_nothing() {
        let controller = controller_with_voices();
        let handler = controller.handler(HandlerKind::PresetChange);

        let result = handler.handle(serde_json::json!({ "preset": "NOT A PRESET" }));
        assert!(matches!(result, Err(ControlError::UnknownPreset(_))));
        assert!(controller.statuses().iter().all(|s| s.preset.is_none()));

        let result = handler.handle(serde_json::json!({ "wrong": 1 }));
        assert!(matches!(result, Err(ControlError::Malformed(_))));
        controller.shutdown();
    }

    #[test]
    fn test_composed_note_is_scheduled_on_labelled_voice() {
        let controller = controller_with_voices();
        let handler = controller.handler(HandlerKind::ComposedOutput);

        handler.handle(note("lead", epoch_millis() + 1000)).unwrap();

        let lead = controller.stream(Role::AiLead).unwrap();
        assert_eq!(lead.scheduler().pending(), 1);
        // roughly one second of samples away
        assert!(lead.scheduler().drain(47_000).is_empty());
        let fired = lead.scheduler().drain(2_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].message, MidiMessage::note_on(0, 64, 90));
        drop(lead);

        // unknown label lands on the user voice
        handler.handle(note("drums", epoch_millis() + 50)).unwrap();
        assert_eq!(controller.stream(Role::User).unwrap().scheduler().pending(), 1);
        controller.shutdown();
    }

    #[test]
    fn test_late_note_is_dropped() {
        let controller = controller_with_voices();
        let handler = controller.handler(HandlerKind::ComposedOutput);

        for label in ["bass", "lead", "pad", "pluck", "drums"] {
            let result = handler.handle(note(label, epoch_millis() - 250));
            assert!(matches!(result, Err(ControlError::LateEvent { .. })));
        }
        for role in Role::VOICES {
            assert_eq!(controller.stream(role).unwrap().scheduler().pending(), 0, "{role}");
        }
        controller.shutdown();
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let controller = controller_with_voices();
        let result = controller.add_stream_with_transport(
            Role::AiPad,
            &audio(),
            Box::new(RecordingEngine::default()),
            Box::new(RecordingTransport::default()),
        );
        assert!(matches!(result, Err(StreamError::AlreadyExists(Role::AiPad))));
        assert!(matches!(
            controller.stream(Role::ComposerOutput),
            Err(StreamError::NotFound(Role::ComposerOutput))
        ));
        controller.shutdown();
    }

    #[test]
    fn test_failing_voice_does_not_block_others() {
        let controller = StreamController::new(Arc::new(PresetCatalog::builtin("presets"))).unwrap();
        let config = AppConfig {
            audio: audio(),
            streams: vec![
                StreamConfig {
                    role: Role::User,
                    transport: TransportConfig::Udp { target: "127.0.0.1:9".parse().unwrap() },
                    initial_preset: Some("BLESS".into()),
                },
                StreamConfig {
                    role: Role::AiBass,
                    transport: TransportConfig::Udp { target: "127.0.0.1:9".parse().unwrap() },
                    initial_preset: None,
                },
                StreamConfig {
                    role: Role::AiLead,
                    transport: TransportConfig::WebSocket { connection: Role::AiLead },
                    initial_preset: None,
                },
            ],
            connections: Vec::new(),
            ..AppConfig::default()
        };

        let failures = controller.configure(&config, |role| -> Box<dyn AudioEngine> {
            if role == Role::AiBass {
                Box::new(FailingEngine)
            } else {
                Box::new(RecordingEngine::default())
            }
        });

        assert_eq!(failures.len(), 2);
        assert!(matches!(failures[0], (Role::AiBass, StreamError::Engine { .. })));
        assert!(matches!(failures[1], (Role::AiLead, StreamError::ConnectionNotFound(Role::AiLead))));

        let statuses = controller.statuses();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].streaming);
        assert_eq!(statuses[0].preset.as_deref(), Some("BLESS"));
        controller.shutdown();
    }

    #[test]
    fn test_preset_message_over_connection_updates_user_voice() {
        let controller = controller_with_voices();
        let server = controller.runtime().block_on(spawn_ws_server());
        let mode = controller.client_mode(&ConnectionConfig {
            id: Role::PresetControl,
            url: server.url(),
            mode: ConnectionMode::Json,
            handler: HandlerKind::PresetChange,
        });
        controller.add_connection(Role::PresetControl, server.url(), mode).unwrap();
        assert!(matches!(
            controller.add_connection(Role::PresetControl, server.url(), ClientMode::Binary(None)),
            Err(StreamError::ConnectionExists(Role::PresetControl))
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.connection_statuses()[0].state != ConnectionState::Open {
            assert!(Instant::now() < deadline, "connection never opened");
            thread::sleep(Duration::from_millis(5));
        }
        server
            .push
            .send(axum::extract::ws::Message::Text(r#"{"preset":"TETRA"}"#.into()))
            .unwrap();

        while controller.stream(Role::User).unwrap().current_preset().is_none() {
            assert!(Instant::now() < deadline, "preset never applied");
            thread::sleep(Duration::from_millis(5));
        }
        let user = controller.stream(Role::User).unwrap();
        assert_eq!(user.current_preset().unwrap().key, "TETRA");
        drop(user);
        controller.shutdown();
    }

    #[test]
    fn test_shutdown_stops_voices_and_connections() {
        let controller = controller_with_voices();
        let server = controller.runtime().block_on(spawn_ws_server());
        controller
            .add_connection(Role::InputForward, server.url(), ClientMode::Json(Arc::new(ControlHandler::Ignore)))
            .unwrap();
        let handle = controller.connection(Role::InputForward).unwrap();
        assert!(controller.statuses().iter().all(|s| s.streaming));

        controller.shutdown();
        assert!(handle.state().is_terminal() || handle.state() == ConnectionState::Closing);
        assert!(handle
            .send_json(&NoteEvent {
                role: None,
                kind: NoteEventKind::NoteOff,
                note: 60,
                velocity: 0,
                timestamp: 0,
            })
            .is_err());
    }
}
