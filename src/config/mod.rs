//! Configuration module for rustfuse
//!
//! Loads and validates pipeline configuration from TOML or YAML.

pub mod config;
pub mod params;

pub use config::{ConfigError, ConfigLoader, FusionConfig};
pub use params::{
    CloudParams, DownsampleParams, EstimatorKind, FusionMode, LogFormat, LoggingParams, MatchFailurePolicy,
    MatchingParams, OutputParams, PipelineParams, SinkKind, ViewerParams,
};
