//! # rustfuse
//!
//! Incremental, drift-corrected point cloud fusion from posed camera frames.
//!
//! ## Overview
//!
//! Every frame carries a reported pose from an external positioning source
//! and an organized grid of camera-frame points. rustfuse keeps two
//! transform chains per frame:
//! - the reported chain, taken as-is from the input
//! - the vision chain, built from frame-to-window registration and pulled
//!   back onto the reported trajectory by a rigid drift correction after
//!   every cycle
//!
//! Frame clouds are built in parallel, placed with the corrected vision
//! transforms and appended to one accumulated cloud, which is downsampled
//! with a voxel grid on output.
//!
//! ## Example
//!
//! ```rust
//! use rustfuse::config::FusionConfig;
//! use rustfuse::io::InMemorySource;
//! use rustfuse::pipeline::FusionPipeline;
//! use rustfuse::registration::IdentityEstimator;
//! use rustfuse::test_utils::{create_sequence, TrajectoryType};
//!
//! let frames = create_sequence(6, 8, 6, TrajectoryType::Line);
//! let source = InMemorySource::new(frames);
//!
//! let mut config = FusionConfig::default();
//! config.pipeline.window = 3;
//!
//! let mut pipeline = FusionPipeline::new(config)
//!     .unwrap()
//!     .with_estimator(Box::new(IdentityEstimator));
//! let output = pipeline.run(&source).unwrap();
//!
//! assert_eq!(output.report.cycles.len(), 2);
//! assert_eq!(output.accumulated.len(), 6 * 8 * 6);
//! ```

pub mod chain;
pub mod cli;
pub mod config;
pub mod core;
pub mod fusion;
pub mod io;
pub mod pipeline;
pub mod registration;
pub mod test_utils;

pub use chain::{ChainError, TransformChain};
pub use config::{ConfigLoader, FusionConfig, FusionMode};
pub use core::{ColoredPoint, Frame, PointCloud, PointGrid, ReportedPose, SE3};
pub use fusion::FusionEngine;
pub use io::{DirectorySource, FrameSource, InMemorySource};
pub use pipeline::{FusionOutput, FusionPipeline, PipelineError};
