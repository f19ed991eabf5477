//! Per-frame cloud building, voxel downsampling and batched fusion.

pub mod builder;
pub mod engine;
pub mod voxel;

use thiserror::Error;

pub use builder::{CloudBuilder, CloudMode, GridCloudBuilder};
pub use engine::{merge_in_index_order, FusionEngine};
pub use voxel::{Downsampler, VoxelGrid};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FusionError {
    #[error("failed to start fusion worker pool: {0}")]
    ThreadPool(String),
    #[error("no vision transform for frame {index}")]
    MissingTransform { index: usize },
    #[error("failed to build cloud for frame {index}: {message}")]
    Build { index: usize, message: String },
}

impl FusionError {
    /// Frame the error refers to, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            FusionError::ThreadPool(_) => None,
            FusionError::MissingTransform { index } | FusionError::Build { index, .. } => Some(*index),
        }
    }
}
