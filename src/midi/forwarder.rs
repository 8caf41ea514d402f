//! Local input forwarding
//!
//! Note events captured locally (for example from a MIDI keyboard callback)
//! are pushed through a bounded channel so the capturing thread never
//! blocks. A forwarding thread plays each event on the user voice right away
//! and sends it outward as a timestamped JSON note event.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::message::MidiMessage;
use super::scheduler::MidiEventScheduler;
use crate::constants::INPUT_QUEUE_CAPACITY;
use crate::error::StreamError;
use crate::network::ClientHandle;
use crate::protocol::epoch_millis;

/// How often the forwarding thread checks its running flag when idle
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Real-time side of the forwarding path. Cheap to clone.
#[derive(Clone)]
pub struct LocalInput {
    tx: Sender<MidiMessage>,
    dropped: Arc<AtomicU64>,
}

impl LocalInput {
    /// Hand an event to the forwarder without blocking.
    ///
    /// Returns false if the queue is full or the forwarder has stopped.
    pub fn push(&self, message: MidiMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Push a raw MIDI message; anything other than note on/off is ignored.
    pub fn push_raw(&self, bytes: &[u8]) -> bool {
        match MidiMessage::from_bytes(bytes) {
            Some(message) => self.push(message),
            None => false,
        }
    }

    /// Events lost to a full queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Forwarding thread for one local input source
pub struct InputForwarder {
    input: LocalInput,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InputForwarder {
    /// Start forwarding into `scheduler` (immediate playback) and, when
    /// given, outward over `connection`.
    pub fn start(
        scheduler: Arc<MidiEventScheduler>,
        connection: Option<ClientHandle>,
    ) -> Result<Self, StreamError> {
        let (tx, rx) = bounded(INPUT_QUEUE_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let thread = thread::Builder::new()
            .name("input-forward".into())
            .spawn(move || forward_loop(rx, scheduler, connection, running_for_loop))
            .map_err(|e| StreamError::Spawn(e.to_string()))?;

        info!("Local input forwarding started");
        Ok(Self {
            input: LocalInput {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            running,
            thread: Some(thread),
        })
    }

    /// Handle for the real-time side; clones share the same queue
    pub fn input(&self) -> LocalInput {
        self.input.clone()
    }

    /// Stop the forwarding thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(()) => info!("Local input forwarding stopped"),
                Err(_) => error!("Input forwarding thread panicked"),
            }
        }
    }
}

impl Drop for InputForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward_loop(
    rx: Receiver<MidiMessage>,
    scheduler: Arc<MidiEventScheduler>,
    connection: Option<ClientHandle>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let message = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        debug!(?message, "Local input");
        scheduler.enqueue(message, 0);

        if let Some(connection) = &connection {
            let event = message.to_event(epoch_millis());
            if let Err(e) = connection.send_json(&event) {
                warn!(connection = %connection.id(), "Failed to forward input: {}", e);
            }
        }
    }
}
