use serde::Deserialize;
use std::path::Path;

use crate::graph::{AudioError, AudioResult};

/// Streaming configuration as written in a YAML file
///
/// Every field is optional so that a file only needs to name what it changes. Values
/// present here override environment variables and defaults.
///
/// # Example YAML structure
/// ```yaml
/// read_buffer:
///   desired_buffer_length_ms: 100
///
/// write_buffer:
///   max_buffer_length_ms: 500
///
/// push_pull:
///   max_buffer_length_ms: 62.5
///
/// mixer:
///   read_forever: true
///   input_buffer_length_ms: 500
///
/// concatenator:
///   read_forever: false
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub read_buffer: Option<ReadBufferYaml>,
    pub write_buffer: Option<WriteBufferYaml>,
    pub push_pull: Option<PushPullYaml>,
    pub mixer: Option<MixerYaml>,
    pub concatenator: Option<ConcatenatorYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReadBufferYaml {
    pub desired_buffer_length_ms: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WriteBufferYaml {
    pub max_buffer_length_ms: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PushPullYaml {
    pub max_buffer_length_ms: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MixerYaml {
    pub read_forever: Option<bool>,
    pub input_buffer_length_ms: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConcatenatorYaml {
    pub read_forever: Option<bool>,
}

impl YamlConfig {
    pub fn from_file(path: &Path) -> AudioResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AudioError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> AudioResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| AudioError::Configuration(format!("failed to parse YAML: {e}")))
    }
}
