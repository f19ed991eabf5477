//! Incremental persistence of the accumulated cloud and a run manifest.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::PointCloud;
use crate::io::{ply, PlyError, PlyFormat};

pub const MANIFEST_FILE: &str = "run_status.json";
pub const PARTIAL_DIR: &str = "partial";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to create checkpoint directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("failed to write checkpoint {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to read checkpoint {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to serialize checkpoint {path}: {source}")]
    Serialize { path: PathBuf, source: serde_json::Error },
    #[error("failed to deserialize checkpoint {path}: {source}")]
    Deserialize { path: PathBuf, source: serde_json::Error },
    #[error("failed to write partial cloud: {0}")]
    Cloud(#[from] PlyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Partial,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub cycle: usize,
    pub frame: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub version: u32,
    pub status: RunStatus,
    pub total_cycles: usize,
    pub completed_cycles: usize,
    pub last_cloud: Option<PathBuf>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    pub format: PlyFormat,
}

pub struct CheckpointManager {
    config: CheckpointConfig,
    manifest: RunManifest,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig, total_cycles: usize) -> Result<Self, CheckpointError> {
        let partial = config.dir.join(PARTIAL_DIR);
        if !partial.exists() {
            fs::create_dir_all(&partial).map_err(|source| CheckpointError::CreateDir {
                path: partial.clone(),
                source,
            })?;
        }

        let manager = Self {
            config,
            manifest: RunManifest {
                version: 1,
                status: RunStatus::InProgress,
                total_cycles,
                completed_cycles: 0,
                last_cloud: None,
                failure: None,
            },
        };
        manager.write_manifest()?;
        Ok(manager)
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.config.dir.join(MANIFEST_FILE)
    }

    /// Persist the accumulated cloud after `cycle` completed.
    pub fn save_cycle(&mut self, cycle: usize, accumulated: &PointCloud) -> Result<PathBuf, CheckpointError> {
        let path = cycle_cloud_path(&self.config.dir, cycle);
        ply::save_cloud(&path, accumulated, self.config.format)?;
        self.manifest.completed_cycles = cycle + 1;
        self.manifest.last_cloud = Some(path.clone());
        self.write_manifest()?;
        Ok(path)
    }

    /// Record a fatal error. Files already written are left in place.
    pub fn mark_failed(&mut self, cycle: usize, frame: Option<usize>, message: String) -> Result<(), CheckpointError> {
        self.manifest.status = RunStatus::Partial;
        self.manifest.failure = Some(FailureRecord { cycle, frame, message });
        self.write_manifest()
    }

    pub fn mark_complete(&mut self) -> Result<(), CheckpointError> {
        self.manifest.status = RunStatus::Complete;
        self.write_manifest()
    }

    fn write_manifest(&self) -> Result<(), CheckpointError> {
        save_manifest(&self.manifest, &self.manifest_path())
    }
}

pub fn cycle_cloud_path(dir: &Path, cycle: usize) -> PathBuf {
    dir.join(PARTIAL_DIR)
        .join(format!("accumulated_cycle_{cycle:04}.ply"))
}

pub fn save_manifest(manifest: &RunManifest, path: &Path) -> Result<(), CheckpointError> {
    let file = File::create(path).map_err(|source| CheckpointError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, manifest).map_err(|source| CheckpointError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

pub fn load_manifest(path: &Path) -> Result<RunManifest, CheckpointError> {
    let file = File::open(path).map_err(|source| CheckpointError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|source| CheckpointError::Deserialize {
        path: path.to_path_buf(),
        source,
    })
}
