//! Sample-accurate delay queue for remotely scheduled MIDI
//!
//! The control plane enqueues events with a delay measured in samples; the
//! render side drains the queue once per block and receives the events that
//! fall inside that block together with their offset.

use parking_lot::Mutex;

use super::message::MidiMessage;

/// An event due inside the block being rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub message: MidiMessage,
    /// Sample offset from the start of the block
    pub offset: usize,
}

#[derive(Debug)]
struct PendingEvent {
    message: MidiMessage,
    /// Residual delay in samples
    delay: u64,
}

/// Delay queue shared between the control plane and the render side
#[derive(Debug, Default)]
pub struct MidiEventScheduler {
    pending: Mutex<Vec<PendingEvent>>,
}

impl MidiEventScheduler {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` to fire `delay_samples` from the start of the next
    /// drained block. Negative delays are already late and are not stored.
    pub fn enqueue(&self, message: MidiMessage, delay_samples: i64) -> bool {
        if delay_samples < 0 {
            return false;
        }
        self.pending.lock().push(PendingEvent {
            message,
            delay: delay_samples as u64,
        });
        true
    }

    /// Collect the events due within the next `num_samples` samples into
    /// `out`, ordered by offset and then by enqueue order. Everything else
    /// has its residual delay reduced by `num_samples`.
    pub fn drain_into(&self, num_samples: usize, out: &mut Vec<ScheduledEvent>) {
        let start = out.len();
        let block = num_samples as u64;
        {
            let mut pending = self.pending.lock();
            pending.retain_mut(|event| {
                if event.delay < block {
                    out.push(ScheduledEvent {
                        message: event.message,
                        offset: event.delay as usize,
                    });
                    false
                } else {
                    event.delay -= block;
                    true
                }
            });
        }
        out[start..].sort_by_key(|event| event.offset);
    }

    /// Allocating form of [`Self::drain_into`]
    pub fn drain(&self, num_samples: usize) -> Vec<ScheduledEvent> {
        let mut out = Vec::new();
        self.drain_into(num_samples, &mut out);
        out
    }

    /// Number of events still waiting
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop every pending event
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}
