//! Preset catalog
//!
//! The catalog is built once at startup and shared read-only (`Arc`) with
//! every component that resolves presets. Nothing mutates it afterwards.

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ControlError;

/// Sound category of a preset; each automated voice plays one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetCategory {
    Bass,
    Lead,
    Pad,
    Pluck,
}

impl PresetCategory {
    pub const ALL: [PresetCategory; 4] = [
        PresetCategory::Bass,
        PresetCategory::Lead,
        PresetCategory::Pad,
        PresetCategory::Pluck,
    ];

    /// Parse a lowercase category label such as `"bass"`
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "bass" => Some(Self::Bass),
            "lead" => Some(Self::Lead),
            "pad" => Some(Self::Pad),
            "pluck" => Some(Self::Pluck),
            _ => None,
        }
    }

    /// Label used on the wire and in logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Bass => "bass",
            Self::Lead => "lead",
            Self::Pad => "pad",
            Self::Pluck => "pluck",
        }
    }

    /// Subdirectory of the preset root holding this category's files
    fn directory(&self) -> &'static str {
        match self {
            Self::Bass => "basses",
            Self::Lead => "leads",
            Self::Pad => "pads",
            Self::Pluck => "plucks",
        }
    }
}

impl fmt::Display for PresetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A named, categorized sound configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preset {
    /// Catalog key used on the wire, e.g. `LEAD_1984`
    pub key: String,
    /// Human readable name
    pub name: String,
    /// Where the adapter loads the preset from
    pub locator: PathBuf,
    pub category: PresetCategory,
}

/// (key, name, category, file stem)
const BUILTIN: &[(&str, &str, PresetCategory, &str)] = &[
    ("ANALOG_REESE_SWEEP", "Analog Reese Sweep", PresetCategory::Bass, "analog_reese_sweep"),
    ("VIBRATO_BASS", "Vibrato Bass", PresetCategory::Bass, "analog_vibrato_bass"),
    ("COLONY", "Colony", PresetCategory::Bass, "colony"),
    ("ENGINE_HASH", "Engine Hash", PresetCategory::Bass, "engine_hash"),
    ("NUMBERNINE", "Numbernine", PresetCategory::Bass, "numbernine"),
    ("OFFRECORD", "Offrecord", PresetCategory::Bass, "offrecord"),
    ("SUBNET", "Subnet", PresetCategory::Bass, "subnet"),
    ("WELCOME", "Welcome", PresetCategory::Bass, "welcome"),
    ("LEAD_1984", "1984", PresetCategory::Lead, "1984"),
    ("CRASHWAVE", "Crashwave", PresetCategory::Lead, "crashwave"),
    ("CURSED_BRASS", "Cursed Brass", PresetCategory::Lead, "cursed_brass"),
    ("DS61", "DS61", PresetCategory::Lead, "ds61"),
    ("LEGATO_SAW_LEAD", "Legato Saw Lead", PresetCategory::Lead, "legato_saw_lead"),
    ("MINI", "Mini", PresetCategory::Lead, "mini"),
    ("MODULE", "Module", PresetCategory::Lead, "module"),
    ("RETRO_BASS_LEAD", "Retro Bass Lead", PresetCategory::Lead, "retro_bass_lead"),
    ("SAWKRAFT", "Sawkraft", PresetCategory::Lead, "sawkraft"),
    ("TIMECOP", "Timecop", PresetCategory::Lead, "timecop"),
    ("BLADE_SWIMMER", "Blade Swimmer", PresetCategory::Pad, "blade_swimmer"),
    ("BLESS", "Bless", PresetCategory::Pad, "bless"),
    ("LALA", "Lala", PresetCategory::Pad, "lala"),
    ("OUT_TO_PLAY", "Out To Play", PresetCategory::Pad, "out_to_play"),
    ("RETROTOOTH", "Retrotooth", PresetCategory::Pad, "retrotooth"),
    ("SECONDS", "Seconds", PresetCategory::Pad, "seconds"),
    ("VISIONS", "Visions", PresetCategory::Pad, "visions"),
    ("RETROBIT", "Retrobit", PresetCategory::Pluck, "retrobit"),
    ("TETRA", "Tetra", PresetCategory::Pluck, "tetra"),
];

/// Immutable lookup table of presets by key and by category
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    by_key: HashMap<String, Preset>,
    by_category: HashMap<PresetCategory, Vec<Preset>>,
}

impl PresetCatalog {
    /// Build the stock catalog with locators rooted at `root`.
    pub fn builtin(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::from_presets(BUILTIN.iter().map(|&(key, name, category, stem)| Preset {
            key: key.to_string(),
            name: name.to_string(),
            locator: root
                .join(category.directory())
                .join(format!("{stem}.vstpreset")),
            category,
        }))
    }

    /// Build a catalog from an explicit list. Later duplicates of a key win.
    pub fn from_presets(presets: impl IntoIterator<Item = Preset>) -> Self {
        let mut by_key = HashMap::new();
        let mut by_category: HashMap<PresetCategory, Vec<Preset>> = HashMap::new();
        for preset in presets {
            by_category
                .entry(preset.category)
                .or_default()
                .push(preset.clone());
            by_key.insert(preset.key.clone(), preset);
        }
        Self { by_key, by_category }
    }

    /// Look up a preset by catalog key
    pub fn get(&self, key: &str) -> Result<&Preset, ControlError> {
        self.by_key
            .get(key)
            .ok_or_else(|| ControlError::UnknownPreset(key.to_string()))
    }

    /// Presets of one category in catalog order
    pub fn category(&self, category: PresetCategory) -> &[Preset] {
        self.by_category
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Uniform draw from a category; `None` if the category is empty.
    pub fn random<R: Rng + ?Sized>(&self, category: PresetCategory, rng: &mut R) -> Option<&Preset> {
        self.category(category).choose(rng)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_builtin_catalog() {
        let catalog = PresetCatalog::builtin("presets");
        assert_eq!(catalog.len(), 27);
        assert_eq!(catalog.category(PresetCategory::Bass).len(), 8);
        assert_eq!(catalog.category(PresetCategory::Lead).len(), 10);
        assert_eq!(catalog.category(PresetCategory::Pad).len(), 7);
        assert_eq!(catalog.category(PresetCategory::Pluck).len(), 2);

        let colony = catalog.get("COLONY").unwrap();
        assert_eq!(colony.category, PresetCategory::Bass);
        assert_eq!(colony.locator, Path::new("presets/basses/colony.vstpreset"));
    }

    #[test]
    fn test_unknown_preset() {
        let catalog = PresetCatalog::builtin("presets");
        assert!(matches!(
            catalog.get("NOPE"),
            Err(ControlError::UnknownPreset(name)) if name == "NOPE"
        ));
    }

    #[test]
    fn test_random_covers_whole_category() {
        let catalog = PresetCatalog::builtin("presets");
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let preset = catalog.random(PresetCategory::Pluck, &mut rng).unwrap();
            assert_eq!(preset.category, PresetCategory::Pluck);
            seen.insert(preset.key.clone());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_random_from_empty_category() {
        let catalog = PresetCatalog::from_presets(Vec::new());
        assert!(catalog.is_empty());
        assert!(catalog.random(PresetCategory::Pad, &mut rand::rng()).is_none());
    }
}
