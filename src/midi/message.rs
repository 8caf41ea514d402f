//! Channel voice messages understood by the sound-generating adapters

use crate::error::ControlError;
use crate::protocol::{NoteEvent, NoteEventKind};

/// Highest valid MIDI data byte
pub const MAX_DATA_BYTE: u8 = 127;

/// A note message. Channels are zero-based (0..=15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
}

impl MidiMessage {
    /// Note-on, with channel and data bytes masked into range
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::NoteOn {
            channel: channel & 0x0F,
            note: note & MAX_DATA_BYTE,
            velocity: velocity & MAX_DATA_BYTE,
        }
    }

    /// Note-off, with channel and note masked into range
    pub fn note_off(channel: u8, note: u8) -> Self {
        Self::NoteOff {
            channel: channel & 0x0F,
            note: note & MAX_DATA_BYTE,
        }
    }

    /// Parse a raw 3-byte channel voice message.
    ///
    /// A note-on with zero velocity is treated as note-off, as most
    /// controllers send it that way. Other status bytes yield `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&status, rest) = bytes.split_first()?;
        let channel = status & 0x0F;
        match (status & 0xF0, rest) {
            (0x90, [note, 0, ..]) => Some(Self::note_off(channel, *note)),
            (0x90, [note, velocity, ..]) => Some(Self::note_on(channel, *note, *velocity)),
            (0x80, [note, _, ..]) => Some(Self::note_off(channel, *note)),
            _ => None,
        }
    }

    pub fn note(&self) -> u8 {
        match *self {
            Self::NoteOn { note, .. } | Self::NoteOff { note, .. } => note,
        }
    }

    /// Build a message from a control-plane note event on channel 0.
    pub fn from_event(event: &NoteEvent) -> Result<Self, ControlError> {
        if event.note > MAX_DATA_BYTE || event.velocity > MAX_DATA_BYTE {
            return Err(ControlError::InvalidValue(format!(
                "note {} / velocity {} outside 0-127",
                event.note, event.velocity
            )));
        }
        Ok(match event.kind {
            NoteEventKind::NoteOn => Self::note_on(0, event.note, event.velocity),
            NoteEventKind::NoteOff => Self::note_off(0, event.note),
        })
    }

    /// Convert to an outbound note event stamped with `timestamp_ms`.
    pub fn to_event(&self, timestamp_ms: i64) -> NoteEvent {
        let (kind, velocity) = match *self {
            Self::NoteOn { velocity, .. } => (NoteEventKind::NoteOn, velocity),
            Self::NoteOff { .. } => (NoteEventKind::NoteOff, 0),
        };
        NoteEvent {
            role: None,
            kind,
            note: self.note(),
            velocity,
            timestamp: timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes() {
        assert_eq!(
            MidiMessage::from_bytes(&[0x91, 60, 100]),
            Some(MidiMessage::note_on(1, 60, 100))
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0x90, 60, 0]),
            Some(MidiMessage::note_off(0, 60))
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0x80, 64, 12]),
            Some(MidiMessage::note_off(0, 64))
        );
        // Control change is not a note message
        assert_eq!(MidiMessage::from_bytes(&[0xB0, 7, 100]), None);
        assert_eq!(MidiMessage::from_bytes(&[0x90]), None);
    }

    #[test]
    fn test_from_event_rejects_out_of_range() {
        let event = NoteEvent {
            role: Some("bass".into()),
            kind: NoteEventKind::NoteOn,
            note: 200,
            velocity: 10,
            timestamp: 0,
        };
        assert!(matches!(
            MidiMessage::from_event(&event),
            Err(ControlError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_note_off_event_has_zero_velocity() {
        let event = MidiMessage::note_off(0, 48).to_event(1234);
        assert_eq!(event.kind, NoteEventKind::NoteOff);
        assert_eq!(event.velocity, 0);
        assert_eq!(event.timestamp, 1234);
        assert!(event.role.is_none());
    }
}
