//! Main configuration structures for rustfuse

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use super::params::*;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main fusion configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Cycle scheduling
    pub pipeline: PipelineParams,
    /// Frame-to-window registration
    pub matching: MatchingParams,
    /// Per-frame cloud construction
    pub cloud: CloudParams,
    /// Voxel downsampling
    pub downsample: DownsampleParams,
    /// Visualization handoff
    pub viewer: ViewerParams,
    /// Output files
    pub output: OutputParams,
    /// Log filter and format
    pub logging: LoggingParams,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn check_voxel(field: &'static str, size: f32) -> Result<(), ConfigError> {
    if size.is_finite() && size > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("must be a positive voxel size, got {size}")))
    }
}

impl FusionConfig {
    /// Configuration for full-batch processing
    pub fn offline() -> Self {
        Self {
            pipeline: PipelineParams {
                mode: FusionMode::Offline,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.window == 0 {
            return Err(invalid("pipeline.window", "must be at least 1"));
        }
        if self.pipeline.batch_width == 0 {
            return Err(invalid("pipeline.batch_width", "must be at least 1"));
        }
        if self.matching.match_window == 0 {
            return Err(invalid("matching.match_window", "must be at least 1"));
        }
        if self.cloud.pixel_stride == 0 {
            return Err(invalid("cloud.pixel_stride", "must be at least 1"));
        }
        if let Some(depth) = self.cloud.max_depth {
            if !(depth.is_finite() && depth > 0.0) {
                return Err(invalid("cloud.max_depth", format!("must be positive, got {depth}")));
            }
        }
        if self.downsample.frame_voxel_size != 0.0 {
            check_voxel("downsample.frame_voxel_size", self.downsample.frame_voxel_size)?;
        }
        check_voxel("downsample.output_voxel_size", self.downsample.output_voxel_size)?;
        if let Some(size) = self.viewer.preview_voxel_size {
            check_voxel("viewer.preview_voxel_size", size)?;
        }
        Ok(())
    }
}

/// Configuration loader supporting YAML and TOML
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file, choosing the parser by extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<FusionConfig, ConfigError> {
        let path = path.as_ref();
        let extension = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match extension.to_lowercase().as_str() {
            "yaml" | "yml" => Self::load_yaml(path),
            "toml" => Self::load_toml(path),
            _ => Err(ConfigError::UnsupportedFormat(extension.to_string())),
        }
    }

    /// Load configuration from YAML file
    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<FusionConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FusionConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<FusionConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FusionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn save_yaml<P: AsRef<Path>>(config: &FusionConfig, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_toml<P: AsRef<Path>>(config: &FusionConfig, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string(config)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::CloudMode;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    #[test]
    fn test_config_default() {
        let config = FusionConfig::default();
        assert_eq!(config.pipeline.batch_width, 7);
        assert_eq!(config.pipeline.mode, FusionMode::Online);
        assert_eq!(config.matching.failure_policy, MatchFailurePolicy::PropagatePrevious);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_offline() {
        assert_eq!(FusionConfig::offline().pipeline.mode, FusionMode::Offline);
    }

    #[test]
    fn test_save_load_yaml() {
        let mut config = FusionConfig::offline();
        config.cloud.mode = CloudMode::Sparse;
        config.cloud.max_depth = Some(40.0);
        let temp_file = NamedTempFile::new().unwrap();

        ConfigLoader::save_yaml(&config, temp_file.path()).unwrap();
        let loaded = ConfigLoader::load_yaml(temp_file.path()).unwrap();

        assert_eq!(loaded.pipeline.mode, FusionMode::Offline);
        assert_eq!(loaded.cloud.mode, CloudMode::Sparse);
        assert_eq!(loaded.cloud.max_depth, Some(40.0));
    }

    #[test]
    fn test_save_load_toml() {
        let mut config = FusionConfig::default();
        config.pipeline.window = 4;
        config.downsample.frame_voxel_size = 0.0;
        let temp_file = NamedTempFile::new().unwrap();

        ConfigLoader::save_toml(&config, temp_file.path()).unwrap();
        let loaded = ConfigLoader::load_toml(temp_file.path()).unwrap();

        assert_eq!(loaded.pipeline.window, 4);
        assert_eq!(loaded.downsample.frame_voxel_size, 0.0);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pipeline]\nmode = \"offline\"\n\n[matching]\nfailure_policy = \"fatal\"\n\n[logging]\nformat = \"json\""
        )
        .unwrap();

        let loaded = ConfigLoader::load(file.path()).unwrap();
        assert_eq!(loaded.pipeline.mode, FusionMode::Offline);
        assert_eq!(loaded.pipeline.batch_width, 7);
        assert_eq!(loaded.matching.failure_policy, MatchFailurePolicy::Fatal);
        assert_eq!(loaded.matching.match_window, 3);
        assert_eq!(loaded.downsample.frame_voxel_size, 0.05);
        assert_eq!(loaded.logging.format, LogFormat::Json);
        assert!(loaded.logging.level.is_none());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            ConfigLoader::load(file.path()),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "ini"
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = FusionConfig::default();
        config.pipeline.window = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "pipeline.window", .. })
        ));

        let mut config = FusionConfig::default();
        config.downsample.output_voxel_size = -1.0;
        assert!(config.validate().is_err());

        let mut config = FusionConfig::default();
        config.downsample.frame_voxel_size = 0.0;
        assert!(config.validate().is_ok());
        config.downsample.frame_voxel_size = -0.05;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "downsample.frame_voxel_size", .. })
        ));

        let mut config = FusionConfig::default();
        config.cloud.pixel_stride = 0;
        assert!(config.validate().is_err());

        let mut config = FusionConfig::default();
        config.matching.match_window = 0;
        assert!(config.validate().is_err());
    }
}
