//! Wire formats shared by the control plane and the audio plane
//!
//! Control plane: JSON text frames over the duplex client.
//! Audio plane: headerless packets of interleaved little-endian `f32`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::presets::PresetCategory;

/// Stable routing key for a voice or a control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Voice played by the local user
    User,
    AiBass,
    AiLead,
    AiPad,
    AiPluck,
    /// Control connection receiving preset changes
    PresetControl,
    /// Control connection receiving composed note events
    ComposerOutput,
    /// Control connection carrying local input outward
    InputForward,
}

impl Role {
    /// Roles that own an audio-producing voice
    pub const VOICES: [Role; 5] = [
        Role::User,
        Role::AiBass,
        Role::AiLead,
        Role::AiPad,
        Role::AiPluck,
    ];

    /// Automated voices, one per preset category
    pub const AUXILIARY: [Role; 4] = [Role::AiBass, Role::AiLead, Role::AiPad, Role::AiPluck];

    /// True for roles that own a voice, false for control keys
    pub fn is_voice(&self) -> bool {
        Self::VOICES.contains(self)
    }

    /// Map a category label to its automated voice.
    ///
    /// Anything unrecognized routes to the user voice.
    pub fn from_label(label: &str) -> Role {
        match PresetCategory::from_label(label) {
            Some(category) => Self::for_category(category),
            None => Role::User,
        }
    }

    /// The automated voice dedicated to `category`
    pub fn for_category(category: PresetCategory) -> Role {
        match category {
            PresetCategory::Bass => Role::AiBass,
            PresetCategory::Lead => Role::AiLead,
            PresetCategory::Pad => Role::AiPad,
            PresetCategory::Pluck => Role::AiPluck,
        }
    }

    /// Category an automated voice is dedicated to
    pub fn category(&self) -> Option<PresetCategory> {
        match self {
            Role::AiBass => Some(PresetCategory::Bass),
            Role::AiLead => Some(PresetCategory::Lead),
            Role::AiPad => Some(PresetCategory::Pad),
            Role::AiPluck => Some(PresetCategory::Pluck),
            _ => None,
        }
    }

    /// Snake-case name, as used in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::AiBass => "ai_bass",
            Role::AiLead => "ai_lead",
            Role::AiPad => "ai_pad",
            Role::AiPluck => "ai_pluck",
            Role::PresetControl => "preset_control",
            Role::ComposerOutput => "composer_output",
            Role::InputForward => "input_forward",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound preset switch: `{ "preset": "COLONY" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetChange {
    pub preset: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteEventKind {
    NoteOn,
    NoteOff,
}

/// Timestamped note event.
///
/// Inbound from the composer it carries a category label in `role`;
/// outbound local input omits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(rename = "type")]
    pub kind: NoteEventKind,
    pub note: u8,
    pub velocity: u8,
    /// Epoch milliseconds at which the event should sound
    pub timestamp: i64,
}

/// Current wall-clock time in epoch milliseconds, the clock note event
/// timestamps are expressed in
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Size in bytes of one audio packet
pub fn packet_len(frames_per_packet: usize, channels: u16) -> usize {
    frames_per_packet * channels as usize * std::mem::size_of::<f32>()
}

/// Serialize interleaved samples into `out` as little-endian `f32`.
pub fn encode_packet(samples: &[f32], out: &mut BytesMut) {
    out.reserve(samples.len() * std::mem::size_of::<f32>());
    for &sample in samples {
        out.put_f32_le(sample);
    }
}

/// Parse an audio packet back into samples. Trailing bytes that do not form
/// a whole sample are ignored.
pub fn decode_packet(mut packet: Bytes) -> Vec<f32> {
    let mut samples = Vec::with_capacity(packet.len() / 4);
    while packet.remaining() >= 4 {
        samples.push(packet.get_f32_le());
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_label() {
        assert_eq!(Role::from_label("bass"), Role::AiBass);
        assert_eq!(Role::from_label("lead"), Role::AiLead);
        assert_eq!(Role::from_label("pad"), Role::AiPad);
        assert_eq!(Role::from_label("pluck"), Role::AiPluck);
        assert_eq!(Role::from_label("unrecognized"), Role::User);
        assert_eq!(Role::from_label(""), Role::User);
    }

    #[test]
    fn test_auxiliary_categories_round_trip() {
        for role in Role::AUXILIARY {
            let category = role.category().unwrap();
            assert_eq!(Role::for_category(category), role);
        }
        assert_eq!(Role::User.category(), None);
    }

    #[test]
    fn test_control_roles_are_not_voices() {
        assert!(Role::User.is_voice());
        assert!(Role::AiPluck.is_voice());
        assert!(!Role::PresetControl.is_voice());
        assert!(!Role::InputForward.is_voice());
    }

    #[test]
    fn test_note_event_json_shape() {
        let json = r#"{"role":"bass","type":"note_on","note":60,"velocity":100,"timestamp":1700000000000}"#;
        let event: NoteEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.role.as_deref(), Some("bass"));
        assert_eq!(event.kind, NoteEventKind::NoteOn);
        assert_eq!(event.timestamp, 1_700_000_000_000);

        let outbound = NoteEvent { role: None, ..event };
        let text = serde_json::to_string(&outbound).unwrap();
        assert!(!text.contains("role"));
        assert!(text.contains(r#""type":"note_on""#));
    }

    #[test]
    fn test_packet_is_little_endian_f32() {
        let mut out = BytesMut::new();
        encode_packet(&[1.0, -0.5], &mut out);
        assert_eq!(out.len(), packet_len(1, 2));
        assert_eq!(&out[..4], &1.0f32.to_le_bytes());
        assert_eq!(&out[4..], &(-0.5f32).to_le_bytes());
        assert_eq!(decode_packet(out.freeze()), vec![1.0, -0.5]);
    }
}
