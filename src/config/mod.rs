//! Streaming configuration
//!
//! Buffer lengths are held as `Duration`s and converted to frames by each component
//! using its own sample rate. Env vars and YAML write them in milliseconds, fractions
//! allowed.
//!
//! Priority order (highest to lowest):
//! 1. YAML file values
//! 2. Environment variables (`WAAV_AUDIO_*`; `.env` is loaded by the binary)
//! 3. Default values
//!
//! # Example
//! ```rust,no_run
//! use waav_audio_graph::config::StreamingConfig;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StreamingConfig::from_file(Path::new("audio.yaml"))?;
//! println!("prefetch: {:?}", config.read_buffer.desired_buffer_length());
//! # Ok(())
//! # }
//! ```

pub mod yaml;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::graph::{AudioError, AudioResult};
pub use yaml::YamlConfig;

pub const ENV_READ_BUFFER_MS: &str = "WAAV_AUDIO_READ_BUFFER_MS";
pub const ENV_WRITE_BUFFER_MS: &str = "WAAV_AUDIO_WRITE_BUFFER_MS";
pub const ENV_PUSH_PULL_MAX_MS: &str = "WAAV_AUDIO_PUSH_PULL_MAX_MS";
pub const ENV_MIXER_READ_FOREVER: &str = "WAAV_AUDIO_MIXER_READ_FOREVER";
pub const ENV_MIXER_INPUT_BUFFER_MS: &str = "WAAV_AUDIO_MIXER_INPUT_BUFFER_MS";
pub const ENV_CONCAT_READ_FOREVER: &str = "WAAV_AUDIO_CONCAT_READ_FOREVER";

/// Prefetch settings for [`AsyncAudioReadBuffer`](crate::components::AsyncAudioReadBuffer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncReadBufferConfig {
    /// Steady-state prefetch depth; also the latency the buffer adds
    #[serde(rename = "desired_buffer_length_ms", with = "millis")]
    pub desired_buffer_length: Duration,
}

impl AsyncReadBufferConfig {
    pub fn new(desired_buffer_length: Duration) -> Self {
        Self { desired_buffer_length }
    }

    pub fn desired_buffer_length(&self) -> Duration {
        self.desired_buffer_length
    }

    pub fn validate(&self) -> AudioResult<()> {
        positive("read_buffer.desired_buffer_length_ms", self.desired_buffer_length)
    }
}

impl Default for AsyncReadBufferConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

/// Backpressure bound for [`AsyncAudioWriteBuffer`](crate::components::AsyncAudioWriteBuffer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncWriteBufferConfig {
    /// Audio held before further writes are dropped
    #[serde(rename = "max_buffer_length_ms", with = "millis")]
    pub max_buffer_length: Duration,
}

impl AsyncWriteBufferConfig {
    pub fn new(max_buffer_length: Duration) -> Self {
        Self { max_buffer_length }
    }

    pub fn max_buffer_length(&self) -> Duration {
        self.max_buffer_length
    }

    pub fn validate(&self) -> AudioResult<()> {
        positive("write_buffer.max_buffer_length_ms", self.max_buffer_length)
    }
}

impl Default for AsyncWriteBufferConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

/// Overflow bound for [`PushPullBuffer`](crate::components::PushPullBuffer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PushPullBufferConfig {
    /// Oldest audio beyond this length is pruned; unbounded when absent
    #[serde(rename = "max_buffer_length_ms", with = "optional_millis")]
    pub max_buffer_length: Option<Duration>,
}

impl PushPullBufferConfig {
    pub fn bounded(max_buffer_length: Duration) -> Self {
        Self {
            max_buffer_length: Some(max_buffer_length),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn max_buffer_length(&self) -> Option<Duration> {
        self.max_buffer_length
    }

    pub fn validate(&self) -> AudioResult<()> {
        match self.max_buffer_length {
            Some(length) => positive("push_pull.max_buffer_length_ms", length),
            None => Ok(()),
        }
    }
}

/// Fan-in mixer behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Produce silence when no inputs are attached instead of finishing
    pub read_forever: bool,
    /// Staging capacity per input
    #[serde(rename = "input_buffer_length_ms", with = "millis")]
    pub input_buffer_length: Duration,
}

impl MixerConfig {
    pub fn input_buffer_length(&self) -> Duration {
        self.input_buffer_length
    }

    pub fn validate(&self) -> AudioResult<()> {
        positive("mixer.input_buffer_length_ms", self.input_buffer_length)
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            read_forever: true,
            input_buffer_length: Duration::from_millis(500),
        }
    }
}

/// Concatenator behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcatenatorConfig {
    /// Produce silence once every queued input has finished instead of finishing
    pub read_forever: bool,
}

impl Default for ConcatenatorConfig {
    fn default() -> Self {
        Self { read_forever: true }
    }
}

/// Resolved configuration for all streaming components
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StreamingConfig {
    pub read_buffer: AsyncReadBufferConfig,
    pub write_buffer: AsyncWriteBufferConfig,
    pub push_pull: PushPullBufferConfig,
    pub mixer: MixerConfig,
    pub concatenator: ConcatenatorConfig,
}

impl StreamingConfig {
    /// Defaults overridden by process environment variables
    pub fn from_env() -> AudioResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values produced by `lookup`
    pub fn from_lookup<F>(lookup: F) -> AudioResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(length) = parse_env_millis(&lookup, ENV_READ_BUFFER_MS)? {
            config.read_buffer.desired_buffer_length = length;
        }
        if let Some(length) = parse_env_millis(&lookup, ENV_WRITE_BUFFER_MS)? {
            config.write_buffer.max_buffer_length = length;
        }
        if let Some(length) = parse_env_millis(&lookup, ENV_PUSH_PULL_MAX_MS)? {
            config.push_pull.max_buffer_length = Some(length);
        }
        if let Some(flag) = parse_env::<bool>(&lookup, ENV_MIXER_READ_FOREVER)? {
            config.mixer.read_forever = flag;
        }
        if let Some(length) = parse_env_millis(&lookup, ENV_MIXER_INPUT_BUFFER_MS)? {
            config.mixer.input_buffer_length = length;
        }
        if let Some(flag) = parse_env::<bool>(&lookup, ENV_CONCAT_READ_FOREVER)? {
            config.concatenator.read_forever = flag;
        }

        config.validate()?;
        Ok(config)
    }

    /// Environment configuration with a YAML file applied on top
    pub fn from_file(path: &Path) -> AudioResult<Self> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = Self::from_env()?;
        config.apply_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Overwrite every value the YAML document sets
    pub fn apply_yaml(&mut self, yaml: YamlConfig) -> AudioResult<()> {
        if let Some(read_buffer) = yaml.read_buffer {
            if let Some(ms) = read_buffer.desired_buffer_length_ms {
                self.read_buffer.desired_buffer_length =
                    duration_from_millis("read_buffer.desired_buffer_length_ms", ms)?;
            }
        }
        if let Some(write_buffer) = yaml.write_buffer {
            if let Some(ms) = write_buffer.max_buffer_length_ms {
                self.write_buffer.max_buffer_length =
                    duration_from_millis("write_buffer.max_buffer_length_ms", ms)?;
            }
        }
        if let Some(push_pull) = yaml.push_pull {
            if let Some(ms) = push_pull.max_buffer_length_ms {
                self.push_pull.max_buffer_length =
                    Some(duration_from_millis("push_pull.max_buffer_length_ms", ms)?);
            }
        }
        if let Some(mixer) = yaml.mixer {
            if let Some(flag) = mixer.read_forever {
                self.mixer.read_forever = flag;
            }
            if let Some(ms) = mixer.input_buffer_length_ms {
                self.mixer.input_buffer_length = duration_from_millis("mixer.input_buffer_length_ms", ms)?;
            }
        }
        if let Some(concatenator) = yaml.concatenator {
            if let Some(flag) = concatenator.read_forever {
                self.concatenator.read_forever = flag;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> AudioResult<()> {
        self.read_buffer.validate()?;
        self.write_buffer.validate()?;
        self.push_pull.validate()?;
        self.mixer.validate()?;
        Ok(())
    }
}

fn positive(field: &str, value: Duration) -> AudioResult<()> {
    if value.is_zero() {
        return Err(AudioError::Configuration(format!("{field} must be greater than zero")));
    }
    Ok(())
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> AudioResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| AudioError::Configuration(format!("invalid value for {key}: {e}"))),
        None => Ok(None),
    }
}

/// Milliseconds as written in env vars and YAML; fractions keep sub-millisecond lengths
pub fn duration_from_millis(field: &str, ms: f64) -> AudioResult<Duration> {
    if !ms.is_finite() || ms < 0.0 {
        return Err(AudioError::Configuration(format!(
            "{field} must be a non-negative number of milliseconds, got {ms}"
        )));
    }
    Duration::try_from_secs_f64(ms / 1000.0)
        .map_err(|e| AudioError::Configuration(format!("{field} is out of range: {e}")))
}

fn parse_env_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> AudioResult<Option<Duration>> {
    match parse_env::<f64>(lookup, key)? {
        Some(ms) => duration_from_millis(key, ms).map(Some),
        None => Ok(None),
    }
}

/// Serde adapter writing a `Duration` as (possibly fractional) milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        super::duration_from_millis("duration", ms).map_err(serde::de::Error::custom)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(length) => super::millis::serialize(length, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(ms) => super::duration_from_millis("duration", ms)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
