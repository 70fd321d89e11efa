use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ChdError;
use crate::model::{BackboneKind, Device};
use crate::preprocess::{ClaheParams, PreprocessStrategy};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "CARDIOCAM_DATA_DIR";
pub const ENV_MODEL_PATH: &str = "CARDIOCAM_MODEL_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    pub explain: ExplainConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Weights artifact (ONNX). Relative paths resolve against the data directory.
    pub path: PathBuf,
    pub backbone: String,
    pub device: String,
    /// Graph output carrying the last convolutional stage (ONNX backbone only).
    pub feature_output: String,
    pub head_weight: String,
    pub head_bias: String,
    /// Residual stage widths of the native backbone.
    pub stage_channels: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessConfig {
    pub strategy: String,
    pub clahe: bool,
    pub clahe_clip_limit: f32,
    pub clahe_tile_grid: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExplainConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Daily log files kept under `<data_dir>/logs`.
    pub log_retention_files: usize,
    /// Directives appended to the console filter unless `--log-filter` or `-v` is given.
    pub log_noise_filter: String,
    pub log_file_noise_filter: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/chd_model.onnx"),
            backbone: "native".to_string(),
            device: "cpu".to_string(),
            feature_output: "features".to_string(),
            head_weight: "fc.1.weight".to_string(),
            head_bias: "fc.1.bias".to_string(),
            stage_channels: vec![64, 128, 256, 512],
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            strategy: "grayscale".to_string(),
            clahe: false,
            clahe_clip_limit: 2.0,
            clahe_tile_grid: 8,
        }
    }
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
            log_retention_files: 14,
            log_noise_filter: "ort=error".to_string(),
            log_file_noise_filter: "ort=warn".to_string(),
        }
    }
}

impl ModelConfig {
    pub fn backbone_kind(&self) -> Result<BackboneKind, ChdError> {
        BackboneKind::from_name(&self.backbone)
    }

    pub fn device(&self) -> Result<Device, ChdError> {
        Device::from_name(&self.device)
    }

    /// Check the fields that must be valid before any file is touched.
    pub fn validate(&self) -> Result<(), ChdError> {
        if self.path.as_os_str().is_empty() {
            return Err(ChdError::Config("model.path must not be empty".to_string()));
        }
        self.device()?;
        let kind = self.backbone_kind()?;
        if kind == BackboneKind::Native && self.stage_channels.is_empty() {
            return Err(ChdError::Config(
                "model.stage_channels must name at least one stage".to_string(),
            ));
        }
        if self.stage_channels.contains(&0) {
            return Err(ChdError::Config(
                "model.stage_channels entries must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl PreprocessConfig {
    pub fn strategy(&self) -> Result<PreprocessStrategy, ChdError> {
        match self.strategy.trim().to_ascii_lowercase().as_str() {
            "grayscale" | "gray" if self.clahe => Err(ChdError::Config(
                "preprocess.clahe requires the imagenet strategy".to_string(),
            )),
            "grayscale" | "gray" => Ok(PreprocessStrategy::Grayscale),
            "imagenet" | "rgb" => {
                let clahe = if self.clahe {
                    if self.clahe_tile_grid == 0 {
                        return Err(ChdError::Config(
                            "preprocess.clahe_tile_grid must be positive".to_string(),
                        ));
                    }
                    if self.clahe_clip_limit.is_nan() || self.clahe_clip_limit <= 0.0 {
                        return Err(ChdError::Config(
                            "preprocess.clahe_clip_limit must be positive".to_string(),
                        ));
                    }
                    Some(ClaheParams {
                        clip_limit: self.clahe_clip_limit,
                        tile_grid: self.clahe_tile_grid,
                    })
                } else {
                    None
                };
                Ok(PreprocessStrategy::ImageNet { clahe })
            }
            other => Err(ChdError::Config(format!(
                "unknown preprocessing strategy '{other}' (expected grayscale or imagenet)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    /// Load and validate. Any failure, including malformed TOML, surfaces as
    /// `ChdError::Config` wrapped with the file path.
    pub fn load_validated(path: &Path) -> Result<Self> {
        let config = Self::load_from_path(path)
            .map_err(|e| anyhow::Error::new(ChdError::Config(format!("{e:#}"))))
            .and_then(|config| {
                config.validate()?;
                Ok(config)
            })
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChdError> {
        self.model.validate()?;
        self.preprocess.strategy()?;
        if self.server.log_retention_files == 0 {
            return Err(ChdError::Config(
                "server.log_retention_files must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Apply the weights path override with priority CLI flag, then
    /// `CARDIOCAM_MODEL_PATH`, then the config file value.
    pub fn apply_model_override(&mut self, cli_override: Option<&Path>) {
        if let Some(path) = cli_override {
            self.model.path = path.to_path_buf();
        } else if let Some(env_path) = env::var_os(ENV_MODEL_PATH) {
            self.model.path = PathBuf::from(env_path);
        }
    }

    /// Resolved weights path: absolute as-is, otherwise under `data_dir`.
    pub fn model_path(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.model.path)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. CARDIOCAM_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml on first run.
/// An existing config file is never overwritten.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
