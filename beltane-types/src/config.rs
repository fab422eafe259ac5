use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// UDP ports the studio and its helper processes communicate over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioPorts {
    /// Port the synthesis engine listens on.
    pub scsynth: u16,
    /// Port engine-bound messages are sent from.
    pub scsynth_send: u16,
    /// Port incoming cue/MIDI events are delivered to.
    pub osc_cues: u16,
    /// Port the outbound MIDI bridge listens on.
    pub osc_midi: u16,
}

impl Default for StudioPorts {
    fn default() -> Self {
        Self {
            scsynth: 57110,
            scsynth_send: 57111,
            osc_cues: 4560,
            osc_midi: 4561,
        }
    }
}

/// Studio configuration: ports, bridge executables and on-disk resources.
///
/// All fields have working defaults; a TOML file may override any subset
/// (missing keys fall back to the default).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub ports: StudioPorts,
    /// Executable translating hardware MIDI into OSC cue messages.
    pub midi_in_bridge: PathBuf,
    /// Executable translating OSC messages back into hardware MIDI.
    pub midi_out_bridge: PathBuf,
    /// Directory of compiled synthdefs loaded at startup and on reboot.
    pub synthdef_dir: PathBuf,
    /// Backing file for the shared random-source buffer.
    pub rand_stream_path: PathBuf,
    /// Bit depth for recordings and saved buffers (8, 16, 24 or 32).
    pub bit_depth: u32,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            ports: StudioPorts::default(),
            midi_in_bridge: PathBuf::from("m2o"),
            midi_out_bridge: PathBuf::from("o2m"),
            synthdef_dir: PathBuf::from("synthdefs"),
            rand_stream_path: PathBuf::from("buffers/rand-stream.wav"),
            bit_depth: 16,
        }
    }
}

impl StudioConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(ConfigError::Parse)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Error loading a [`StudioConfig`] from disk.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Parse(e) => write!(f, "config parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Sample encoding used for recordings and saved buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    Int8,
    Int16,
    Int24,
    Int32,
}

impl SampleFormat {
    pub fn from_bit_depth(depth: u32) -> Option<Self> {
        match depth {
            8 => Some(Self::Int8),
            16 => Some(Self::Int16),
            24 => Some(Self::Int24),
            32 => Some(Self::Int32),
            _ => None,
        }
    }

    /// The engine-side name of this format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int24 => "int24",
            Self::Int32 => "int32",
        }
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::Int16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = StudioConfig::default();
        assert_eq!(config.ports.scsynth, 57110);
        assert_eq!(config.bit_depth, 16);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config = StudioConfig::from_toml_str(
            r#"
            bit_depth = 24

            [ports]
            osc_cues = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.bit_depth, 24);
        assert_eq!(config.ports.osc_cues, 9000);
        // untouched keys keep their defaults
        assert_eq!(config.ports.scsynth, 57110);
        assert_eq!(config.midi_in_bridge, PathBuf::from("m2o"));
    }

    #[test]
    fn load_round_trips_through_a_file() {
        let path = std::env::temp_dir().join("beltane-config-test.toml");
        fs::write(&path, "bit_depth = 32\n").unwrap();
        let config = StudioConfig::load(&path).unwrap();
        assert_eq!(config.bit_depth, 32);
        let _ = fs::remove_file(&path);

        let err = StudioConfig::load(Path::new("/nonexistent/beltane.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn bit_depth_mapping() {
        assert_eq!(SampleFormat::from_bit_depth(16), Some(SampleFormat::Int16));
        assert_eq!(SampleFormat::from_bit_depth(24), Some(SampleFormat::Int24));
        assert_eq!(SampleFormat::from_bit_depth(12), None);
        assert_eq!(SampleFormat::Int8.as_str(), "int8");
    }
}
