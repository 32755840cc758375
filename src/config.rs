//! Studio configuration
//!
//! Loaded from TOML. Every section and field has a default, so an empty
//! file (or no file at all) gives a working setup that talks to SuperDirt
//! on its default port and a pattern server on 7770.

use crate::controller::Backend;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub session: SessionConfig,
    pub sandbox: SandboxConfig,
    pub tone: ToneConfig,
    pub pattern: PatternConfig,
}

/// Longest session a config may ask for (one day)
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// Playback lifecycle timing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds before a running session is stopped automatically
    pub timeout_secs: f64,
    /// How often a pattern session checks whether the engine is still playing
    pub poll_interval_ms: u64,
    /// Backend used when none is chosen explicitly
    pub default_backend: Backend,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10.0,
            poll_interval_ms: 100,
            default_backend: Backend::Tone,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Limits applied to every snippet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_source_bytes: usize,
    /// Upper bound on evaluated expressions per run
    pub max_steps: usize,
    /// Deepest syntax tree a snippet may compile to
    pub max_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: 64 * 1024,
            max_steps: 100_000,
            max_depth: crate::script::parser::DEFAULT_MAX_DEPTH,
        }
    }
}

/// Direct audio-library backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    /// Identifier the namespace is bound to inside snippets
    pub binding: String,
    /// Synthesis server receiving `/dirt/play`
    pub target: String,
    /// Tempo used for notation durations like "8n"
    pub bpm: f64,
    pub orbit: i32,
    /// Instrument class to synth name on the server
    pub instruments: BTreeMap<String, String>,
}

impl Default for ToneConfig {
    fn default() -> Self {
        let instruments = [
            ("Synth", "superpiano"),
            ("FMSynth", "superfm"),
            ("AMSynth", "superhammond"),
            ("MonoSynth", "supersaw"),
            ("DuoSynth", "supersquare"),
            ("MembraneSynth", "superkick"),
            ("MetalSynth", "superhat"),
            ("PluckSynth", "superpiano"),
            ("PolySynth", "superpiano"),
        ]
        .into_iter()
        .map(|(class, synth)| (class.to_string(), synth.to_string()))
        .collect();

        Self {
            binding: "Tone".to_string(),
            target: "127.0.0.1:57120".to_string(),
            bpm: 120.0,
            orbit: 0,
            instruments,
        }
    }
}

/// External pattern server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub server: String,
    /// Wait for `/eval/ok` or `/eval/error` after sending code
    pub acknowledge: bool,
    pub reply_timeout_ms: u64,
    /// Tempo sent once after the engine starts
    pub cps: Option<f64>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:7770".to_string(),
            acknowledge: false,
            reply_timeout_ms: 2000,
            cps: None,
        }
    }
}

impl PatternConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl StudioConfig {
    /// Parse and validate TOML content
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_at(content, Path::new("<inline>"))
    }

    fn parse_at(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: StudioConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_at(&content, path)
    }

    /// Explicit path if given, else the user config file if it exists, else defaults
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `$CONFIG_DIR/phonon-studio/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("phonon-studio").join("config.toml"))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.session.timeout_secs.is_finite() && self.session.timeout_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "session.timeout_secs must be positive, got {}",
                self.session.timeout_secs
            )));
        }
        if self.session.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "session.timeout_secs must be at most {}, got {}",
                MAX_TIMEOUT_SECS, self.session.timeout_secs
            )));
        }
        if self.session.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.sandbox.max_steps == 0
            || self.sandbox.max_source_bytes == 0
            || self.sandbox.max_depth == 0
        {
            return Err(ConfigError::Invalid(
                "sandbox limits must be non-zero".to_string(),
            ));
        }
        if !(self.tone.bpm.is_finite() && self.tone.bpm > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tone.bpm must be positive, got {}",
                self.tone.bpm
            )));
        }
        if !is_identifier(&self.tone.binding) {
            return Err(ConfigError::Invalid(format!(
                "tone.binding '{}' is not a valid identifier",
                self.tone.binding
            )));
        }
        if let Some(cps) = self.pattern.cps {
            if !(cps.is_finite() && cps > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "pattern.cps must be positive, got {}",
                    cps
                )));
            }
        }
        parse_addr("tone.target", &self.tone.target)?;
        parse_addr("pattern.server", &self.pattern.server)?;
        Ok(())
    }
}

/// Socket address from a config field
pub fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| {
        ConfigError::Invalid(format!(
            "{} must be an address like 127.0.0.1:57120, got '{}'",
            field, value
        ))
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = StudioConfig::parse("").unwrap();
        assert_eq!(config, StudioConfig::default());
        assert_eq!(config.session.timeout(), Duration::from_secs(10));
        assert_eq!(config.session.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.tone.instruments["FMSynth"], "superfm");
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = StudioConfig::parse(
            r#"
            [session]
            timeout_secs = 30
            default_backend = "pattern"

            [pattern]
            acknowledge = true
            cps = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.session.timeout_secs, 30.0);
        assert_eq!(config.session.default_backend, Backend::Pattern);
        assert_eq!(config.session.poll_interval_ms, 100);
        assert!(config.pattern.acknowledge);
        assert_eq!(config.pattern.cps, Some(0.5));
        assert_eq!(config.pattern.server, "127.0.0.1:7770");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            StudioConfig::parse("[session]\ntimeout_secs = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            StudioConfig::parse("[tone]\ntarget = \"localhost\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            StudioConfig::parse("[tone]\nbinding = \"2tone\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            StudioConfig::parse("[session]\ntimeout_secs = \"ten\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_timeout_is_capped_at_one_day() {
        let err = StudioConfig::parse("[session]\ntimeout_secs = 1e30").unwrap_err();
        assert!(err.to_string().contains("at most 86400"));
        assert!(StudioConfig::parse("[session]\ntimeout_secs = 86401").is_err());

        let config = StudioConfig::parse("[session]\ntimeout_secs = 86400").unwrap();
        assert_eq!(config.session.timeout(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_sandbox_depth_must_be_non_zero() {
        let config = StudioConfig::parse("[sandbox]\nmax_depth = 16").unwrap();
        assert_eq!(config.sandbox.max_depth, 16);
        assert!(matches!(
            StudioConfig::parse("[sandbox]\nmax_depth = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file_and_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tone]\nbpm = 90.0\norbit = 2").unwrap();

        let config = StudioConfig::load(file.path()).unwrap();
        assert_eq!(config.tone.bpm, 90.0);
        assert_eq!(config.tone.orbit, 2);

        let reparsed = StudioConfig::parse(&config.to_toml().unwrap()).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = StudioConfig::load(Path::new("/nonexistent/phonon-studio.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("Cannot read config"));
    }
}
