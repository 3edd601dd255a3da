use crate::memory::{DEFAULT_COLLECTION, DEFAULT_QDRANT_URL, DEFAULT_VECTOR_SIZE};
use crate::providers::{DEFAULT_EMBED_MODEL, DEFAULT_OLLAMA_URL};
use crate::vla::decision::DecisionConfig;
use crate::vla::knowledge::KnowledgeConfig;
use crate::vla::loop_controller::LoopConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which wire protocol the model endpoint speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Ollama,
    OpenAi,
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelProvider::Ollama => write!(f, "ollama"),
            ModelProvider::OpenAi => write!(f, "openai"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub provider: ModelProvider,
    pub endpoint: String,
    pub model: String,
    pub embed_endpoint: String,
    pub embed_model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Budget for open-ended idle observations
    pub passive_max_tokens: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Ollama,
            endpoint: DEFAULT_OLLAMA_URL.into(),
            model: "llava".into(),
            embed_endpoint: DEFAULT_OLLAMA_URL.into(),
            embed_model: DEFAULT_EMBED_MODEL.into(),
            api_key: None,
            temperature: 0.1,
            max_tokens: 512,
            passive_max_tokens: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub url: String,
    pub collection: String,
    pub vector_size: usize,
    pub api_key: Option<String>,
    /// Similarity above which a step counts as known
    pub known_threshold: f32,
    /// Similarity above which a remembered action is replayed
    pub recall_threshold: f32,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_QDRANT_URL.into(),
            collection: DEFAULT_COLLECTION.into(),
            vector_size: DEFAULT_VECTOR_SIZE,
            api_key: None,
            known_threshold: 0.85,
            recall_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    pub tick_secs: u64,
    pub idle_threshold_secs: u64,
    pub cooldown_secs: u64,
    pub cycle_delay_secs: u64,
    pub idle_analysis_enabled: bool,
    /// Capture a fresh screen every active cycle instead of reusing the loaded one
    pub live_capture: bool,
    pub history_cap: usize,
    /// Longest WAIT the loop will honour
    pub max_wait_ms: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            idle_threshold_secs: 10,
            cooldown_secs: 30,
            cycle_delay_secs: 3,
            idle_analysis_enabled: true,
            live_capture: false,
            history_cap: 5,
            max_wait_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionSettings {
    pub max_blocks: usize,
    pub max_recent: usize,
    pub raw_truncate: usize,
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            max_blocks: 30,
            max_recent: 5,
            raw_truncate: 1200,
        }
    }
}

/// Full pvt configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvtConfig {
    pub model: ModelSettings,
    pub memory: MemorySettings,
    #[serde(rename = "loop")]
    pub control: LoopSettings,
    pub decision: DecisionSettings,
}

impl PvtConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{} must be within [0, 1], got {}", name, v)))
            }
        };
        unit("memory.known_threshold", self.memory.known_threshold)?;
        unit("memory.recall_threshold", self.memory.recall_threshold)?;

        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::Invalid(format!(
                "model.temperature must be within [0, 2], got {}",
                self.model.temperature
            )));
        }

        let nonzero = [
            ("loop.tick_secs", self.control.tick_secs),
            ("loop.idle_threshold_secs", self.control.idle_threshold_secs),
            ("loop.cooldown_secs", self.control.cooldown_secs),
            ("loop.cycle_delay_secs", self.control.cycle_delay_secs),
            ("model.max_tokens", self.model.max_tokens as u64),
            ("model.passive_max_tokens", self.model.passive_max_tokens as u64),
            ("memory.vector_size", self.memory.vector_size as u64),
            ("decision.max_blocks", self.decision.max_blocks as u64),
            ("decision.raw_truncate", self.decision.raw_truncate as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        Ok(())
    }

    pub fn decision_config(&self) -> DecisionConfig {
        DecisionConfig {
            max_blocks: self.decision.max_blocks,
            max_recent: self.decision.max_recent,
            raw_truncate: self.decision.raw_truncate,
            max_tokens: self.model.max_tokens,
            temperature: self.model.temperature,
        }
    }

    pub fn knowledge_config(&self) -> KnowledgeConfig {
        KnowledgeConfig {
            known_threshold: self.memory.known_threshold,
            recall_threshold: self.memory.recall_threshold,
            max_tokens: self.model.max_tokens,
            temperature: self.model.temperature,
            ..KnowledgeConfig::default()
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            tick: Duration::from_secs(self.control.tick_secs),
            idle_threshold: Duration::from_secs(self.control.idle_threshold_secs),
            cooldown: Duration::from_secs(self.control.cooldown_secs),
            cycle_delay: Duration::from_secs(self.control.cycle_delay_secs),
            idle_analysis_enabled: self.control.idle_analysis_enabled,
            live_capture: self.control.live_capture,
            history_cap: self.control.history_cap,
            max_wait: Duration::from_millis(self.control.max_wait_ms),
            passive_max_tokens: self.model.passive_max_tokens,
            temperature: self.model.temperature,
        }
    }
}

pub struct ConfigManager {
    path: PathBuf,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        let path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pvt")
            .join("config.toml");
        Self { path }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved config, or defaults when the file is absent or unreadable
    pub fn load(&self) -> PvtConfig {
        if self.path.exists() {
            match fs::read_to_string(&self.path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => warn!(path = %self.path.display(), error = %e, "config unparsable, using defaults"),
                },
                Err(e) => warn!(path = %self.path.display(), error = %e, "config unreadable, using defaults"),
            }
        }
        PvtConfig::default()
    }

    pub fn save(&self, config: &PvtConfig) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(config).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to serialize config to TOML: {}", e),
            )
        })?;
        fs::write(&self.path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PvtConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory.collection, "pvt_memory");
        assert_eq!(config.memory.vector_size, 768);
        assert_eq!(config.loop_config().cooldown, Duration::from_secs(30));
        assert_eq!(config.decision_config().raw_truncate, 1200);
        assert_eq!(config.loop_config().max_wait, Duration::from_secs(10));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("pvt").join("config.toml"));

        let mut config = PvtConfig::default();
        config.model.provider = ModelProvider::OpenAi;
        config.memory.known_threshold = 0.8;
        config.control.live_capture = true;
        manager.save(&config).unwrap();

        assert_eq!(manager.load(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[loop]\ncooldown_secs = 60\n\n[model]\nprovider = \"openai\"\n").unwrap();

        let config = ConfigManager::with_path(&path).load();
        assert_eq!(config.control.cooldown_secs, 60);
        assert_eq!(config.control.tick_secs, 5);
        assert_eq!(config.model.provider, ModelProvider::OpenAi);
        assert_eq!(config.model.max_tokens, 512);
    }

    #[test]
    fn test_max_wait_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[loop]\nmax_wait_ms = 2500\n").unwrap();

        let config = ConfigManager::with_path(&path).load();
        assert_eq!(config.loop_config().max_wait, Duration::from_millis(2500));
    }

    #[test]
    fn test_garbage_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is = = not toml").unwrap();
        assert_eq!(ConfigManager::with_path(&path).load(), PvtConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PvtConfig::default();
        config.memory.known_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = PvtConfig::default();
        config.control.cooldown_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid("loop.cooldown_secs must be greater than zero".into()))
        );
    }
}
