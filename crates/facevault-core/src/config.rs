use crate::extractor::DEFAULT_MIN_FACE_SIZE;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::matcher::MatchPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration: TOML file, then `FACEVAULT_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Required lead of the best candidate over the runner-up (0 disables).
    pub margin: f32,
    /// Upper bound on one match call, in milliseconds.
    pub match_timeout_ms: u64,
    /// Number of verification outcomes kept in history.
    pub history_capacity: usize,
    /// Smallest accepted face side, in pixels.
    pub min_face_size: u32,
    /// Directory holding the enrollment store.
    pub data_dir: PathBuf,
    /// ArcFace ONNX model; defaults to `<data_dir>/models/w600k_r50.onnx`.
    pub model_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let policy = MatchPolicy::default();
        Self {
            similarity_threshold: policy.threshold,
            margin: policy.margin,
            match_timeout_ms: 2000,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            data_dir: default_data_dir(),
            model_path: None,
        }
    }
}

impl EngineConfig {
    /// Load from an optional TOML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `FACEVAULT_*` variables; unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parsed(&var, "FACEVAULT_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = v;
        }
        if let Some(v) = parsed(&var, "FACEVAULT_MARGIN") {
            self.margin = v;
        }
        if let Some(v) = parsed(&var, "FACEVAULT_MATCH_TIMEOUT_MS") {
            self.match_timeout_ms = v;
        }
        if let Some(v) = parsed(&var, "FACEVAULT_HISTORY_CAPACITY") {
            self.history_capacity = v;
        }
        if let Some(v) = parsed(&var, "FACEVAULT_MIN_FACE_SIZE") {
            self.min_face_size = v;
        }
        if let Some(v) = var("FACEVAULT_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACEVAULT_MODEL_PATH") {
            self.model_path = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold {} outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if !(0.0..=2.0).contains(&self.margin) {
            return Err(ConfigError::Invalid(format!("margin {} outside [0, 2]", self.margin)));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be at least 1".into()));
        }
        if self.match_timeout_ms == 0 {
            return Err(ConfigError::Invalid("match_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.similarity_threshold,
            margin: self.margin,
        }
    }

    pub fn match_timeout(&self) -> Duration {
        Duration::from_millis(self.match_timeout_ms)
    }

    /// Directory handed to the file-backed key-value store.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models").join("w600k_r50.onnx"))
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facevault")
}
