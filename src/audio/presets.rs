//! # Spatialization Presets
//!
//! Static catalog of named presets. Each preset bundles an EQ curve, a virtual
//! source geometry and a loudness target. The catalog is built once at startup
//! and never mutated afterwards.
//!
//! ## Lookup Rules:
//! - Keys are matched case-insensitively
//! - Unknown keys resolve to the default preset (`cinema`) and log a warning
//! - `list()` preserves catalog order for help/listing output

use serde::Serialize;
use tracing::warn;

/// Key of the preset returned for unknown names.
pub const DEFAULT_PRESET: &str = "cinema";

/// Centre frequencies shared by every built-in EQ curve.
const BAND_FREQUENCIES: [f64; 9] = [
    63.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

const BAND_Q: f64 = 0.7;

/// Single peaking EQ band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EqBand {
    /// Centre frequency in Hz (> 0)
    pub frequency: f64,
    /// Gain in dB; 0 dB bands are skipped by the filter chain
    pub gain: f64,
    /// Quality factor (> 0)
    pub q_factor: f64,
}

impl EqBand {
    pub const fn new(frequency: f64, gain: f64, q_factor: f64) -> Self {
        Self {
            frequency,
            gain,
            q_factor,
        }
    }
}

/// Immutable spatialization preset.
///
/// ## Geometry:
/// `elevation`, `azimuth` and `distance` describe the virtual source. They are
/// informational for the synthetic renderer; the ILD/ITD multipliers are what
/// actually shape the stereo image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preset {
    /// Catalog key (lowercase)
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Degrees, -90..90
    pub elevation: f64,
    /// Degrees, 0..360
    pub azimuth: f64,
    /// Metres
    pub distance: f64,
    /// Interaural level difference multiplier (> 0)
    pub ild_exaggeration: f64,
    /// Interaural time difference multiplier (>= 0)
    pub itd_exaggeration: f64,
    pub use_eq: bool,
    pub eq_bands: Vec<EqBand>,
    pub normalize_loudness: bool,
    /// Target loudness in LUFS
    pub target_loudness: f64,
}

fn curve(gains: [f64; 9]) -> Vec<EqBand> {
    BAND_FREQUENCIES
        .iter()
        .zip(gains)
        .map(|(&frequency, gain)| EqBand::new(frequency, gain, BAND_Q))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn preset(
    id: &'static str,
    name: &'static str,
    description: &'static str,
    elevation: f64,
    distance: f64,
    ild_exaggeration: f64,
    itd_exaggeration: f64,
    gains: [f64; 9],
) -> Preset {
    Preset {
        id,
        name,
        description,
        elevation,
        azimuth: 0.0,
        distance,
        ild_exaggeration,
        itd_exaggeration,
        use_eq: true,
        eq_bands: curve(gains),
        normalize_loudness: true,
        target_loudness: -14.0,
    }
}

/// Ordered, read-only preset catalog.
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    presets: Vec<Preset>,
    default_index: usize,
}

impl Default for PresetCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PresetCatalog {
    /// The built-in catalog with `cinema` as the fallback.
    pub fn builtin() -> Self {
        let presets = vec![
            preset(
                "cinema",
                "Cinema",
                "Theatrical surround effect for immersive listening",
                15.0,
                2.0,
                1.2,
                1.1,
                [2.0, 1.5, 0.5, -0.5, 0.0, 1.0, 2.0, 1.5, 0.5],
            ),
            preset(
                "maxwide",
                "MaxWide",
                "Extra-wide stereo imaging, extended soundfield",
                0.0,
                3.0,
                1.5,
                1.3,
                [3.0, 2.0, 0.0, -1.0, -0.5, 1.5, 3.0, 2.5, 1.0],
            ),
            preset(
                "bassboost",
                "BassBoost",
                "Enhanced bass response for club/dance music",
                -10.0,
                1.5,
                1.0,
                1.0,
                [6.0, 4.0, 2.0, 0.0, -0.5, 0.0, 0.5, 0.0, -0.5],
            ),
            preset(
                "vocal",
                "Vocal",
                "Vocal-focused with centered imaging",
                0.0,
                1.0,
                0.8,
                0.8,
                [-2.0, -1.0, 0.0, 2.0, 3.0, 3.5, 2.0, 0.5, -1.0],
            ),
            preset(
                "neutral",
                "Neutral",
                "Reference/neutral binaural spatialization",
                0.0,
                1.0,
                1.0,
                1.0,
                [0.0; 9],
            ),
            preset(
                "monitor",
                "Monitor",
                "Studio monitor simulation (reference)",
                5.0,
                1.2,
                0.9,
                0.95,
                [-1.0, -0.5, 0.0, 0.5, 0.0, -0.5, 0.0, -0.5, -1.0],
            ),
            preset(
                "club",
                "Club",
                "Club sound - bright highs + powerful bass",
                -15.0,
                2.5,
                1.3,
                1.2,
                [4.0, 3.0, 1.0, -2.0, -2.0, 0.0, 3.0, 3.5, 2.0],
            ),
        ];

        let default_index = presets
            .iter()
            .position(|p| p.id == DEFAULT_PRESET)
            .unwrap_or(0);
        Self {
            presets,
            default_index,
        }
    }

    /// Build a catalog from explicit presets. Returns `None` if `default_id`
    /// is not among them.
    pub fn from_presets(presets: Vec<Preset>, default_id: &str) -> Option<Self> {
        let default_index = presets
            .iter()
            .position(|p| p.id.eq_ignore_ascii_case(default_id))?;
        Some(Self {
            presets,
            default_index,
        })
    }

    /// Resolve a preset by name. Never fails: unknown names fall back to the
    /// default preset.
    pub fn lookup(&self, name: &str) -> &Preset {
        match self.find(name) {
            Some(preset) => preset,
            None => {
                let fallback = self.default_preset();
                warn!(
                    requested = %name,
                    fallback = %fallback.id,
                    "Unknown preset, using default"
                );
                fallback
            }
        }
    }

    /// Strict lookup used by callers that want to reject unknown names.
    pub fn find(&self, name: &str) -> Option<&Preset> {
        let key = name.trim();
        self.presets.iter().find(|p| p.id.eq_ignore_ascii_case(key))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn default_preset(&self) -> &Preset {
        &self.presets[self.default_index]
    }

    pub fn list(&self) -> &[Preset] {
        &self.presets
    }
}
