use crate::core::cluster::{ClusterError, DEFAULT_EPSILON, DEFAULT_MIN_POINTS, DuplicateClusterer};
use crate::core::extractor::{
    DEFAULT_INPUT_SIZE, ExtractionError, FeatureExtractor, PerceptualHashExtractor,
    PixelGridExtractor, ProjectionModel,
};
use crate::core::scanner::DEFAULT_EXTENSIONS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const APP_DIR: &str = "dupimg";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid clustering parameters: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Invalid extractor settings: {0}")]
    Extractor(String),
}

/// Which embedding the scan produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExtractorKind {
    Grid { grid: u32 },
    Hash { hash_size: u32 },
    Model { path: PathBuf },
}

impl Default for ExtractorKind {
    fn default() -> Self {
        ExtractorKind::Grid { grid: 16 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub directories: Vec<PathBuf>,
    pub epsilon: f32,
    pub min_points: usize,
    pub extensions: Vec<String>,
    pub workers: usize,
    pub input_size: u32,
    pub store_path: PathBuf,
    pub history_path: PathBuf,
    pub extractor: ExtractorKind,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self {
            directories: dirs::picture_dir().into_iter().collect(),
            epsilon: DEFAULT_EPSILON,
            min_points: DEFAULT_MIN_POINTS,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            workers: num_cpus::get(),
            input_size: DEFAULT_INPUT_SIZE,
            store_path: data_dir.join("store"),
            history_path: data_dir.join("history.jsonl"),
            extractor: ExtractorKind::default(),
        }
    }
}

impl Settings {
    /// `<config_dir>/dupimg/config.json`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.json"))
    }

    /// Load from `explicit`, else from the default path if it exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => path,
                None => {
                    log::debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        settings.validate()?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Reject parameters the clusterer or extractors can't work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.clusterer()?;
        if self.input_size == 0 {
            return Err(ConfigError::Extractor("input_size must be positive".to_string()));
        }
        let (name, value, min) = match &self.extractor {
            ExtractorKind::Grid { grid } => ("grid", *grid, 1),
            ExtractorKind::Hash { hash_size } => ("hash_size", *hash_size, 2),
            ExtractorKind::Model { .. } => return Ok(()),
        };
        if value < min || value > self.input_size {
            return Err(ConfigError::Extractor(format!(
                "{name} must be between {min} and input_size ({}), got {value}",
                self.input_size
            )));
        }
        Ok(())
    }

    pub fn clusterer(&self) -> Result<DuplicateClusterer, ClusterError> {
        DuplicateClusterer::new(self.epsilon, self.min_points)
    }

    pub fn build_extractor(&self) -> Result<Arc<dyn FeatureExtractor>, ExtractionError> {
        Ok(match &self.extractor {
            ExtractorKind::Grid { grid } => {
                Arc::new(PixelGridExtractor::new(*grid, self.input_size))
            }
            ExtractorKind::Hash { hash_size } => {
                Arc::new(PerceptualHashExtractor::new(*hash_size, self.input_size))
            }
            ExtractorKind::Model { path } => Arc::new(ProjectionModel::load(path, self.input_size)?),
        })
    }
}
