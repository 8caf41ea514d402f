//! Synth Host Application
//!
//! Brings up every configured voice and control connection, then runs until
//! `quit` (or end of input) on stdin.
//!
//! Usage: `synth-host [config.toml]`

use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use synth_stream::{
    audio::{AudioEngine, ToneEngine},
    config::{AppConfig, HandlerKind},
    network::JsonHandler,
    presets::PresetCatalog,
    streaming::StreamController,
};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Synth Host");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())
        .context("Failed to load configuration")?;

    let catalog = Arc::new(PresetCatalog::builtin(&config.presets.directory));
    tracing::info!(
        "Preset catalog: {} presets under {}",
        catalog.len(),
        config.presets.directory.display()
    );

    let controller =
        StreamController::new(catalog).context("Failed to start control runtime")?;

    let failures = controller.configure(&config, |_| -> Box<dyn AudioEngine> {
        Box::new(ToneEngine::new())
    });
    if !failures.is_empty() {
        tracing::warn!("{} voice(s) or connection(s) failed to start", failures.len());
    }

    let mut forwarder = match controller.input_forwarder(config.input.forward_to) {
        Ok(forwarder) => Some(forwarder),
        Err(e) => {
            tracing::warn!("Local input forwarding disabled: {}", e);
            None
        }
    };

    let preset_change = controller.handler(HandlerKind::PresetChange);

    println!("\nCommands: status | preset <KEY> | quit");
    for line in std::io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("quit"), _) => break,
            (Some("status"), _) => {
                let report = serde_json::json!({
                    "streams": controller.statuses(),
                    "connections": controller.connection_statuses(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            (Some("preset"), Some(key)) => {
                // same path as a preset message from the bridge
                let message = serde_json::json!({ "preset": key });
                if let Err(e) = preset_change.handle(message) {
                    tracing::warn!("{}", e);
                }
            }
            (None, _) => {}
            (Some(other), _) => println!("Unknown command: {other}"),
        }
    }

    if let Some(forwarder) = forwarder.as_mut() {
        forwarder.stop();
    }
    controller.shutdown();
    tracing::info!("Synth Host stopped");
    Ok(())
}
