//! Final output export.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use super::ply::{save_cloud, PlyError, PlyFormat};
use crate::pipeline::FusionOutput;

pub const ACCUMULATED_FILE: &str = "accumulated.ply";
pub const DOWNSAMPLED_FILE: &str = "downsampled.ply";
pub const CAMERA_POSITIONS_FILE: &str = "camera_positions.ply";
pub const REPORT_FILE: &str = "run_report.json";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir { path: String, source: std::io::Error },
    #[error(transparent)]
    Cloud(#[from] PlyError),
    #[error("failed to write report {path}: {source}")]
    Report { path: String, source: std::io::Error },
    #[error("failed to serialize report {path}: {source}")]
    Serialize { path: String, source: serde_json::Error },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedFiles {
    pub accumulated: PathBuf,
    pub downsampled: PathBuf,
    pub camera_positions: PathBuf,
    pub report: PathBuf,
}

/// Write the accumulated cloud, its downsampled variant, the combined camera
/// positions and the run report into `output_dir`.
pub fn export_outputs(output_dir: &Path, output: &FusionOutput, format: PlyFormat) -> Result<ExportedFiles, ExportError> {
    if !output_dir.exists() {
        fs::create_dir_all(output_dir).map_err(|source| ExportError::CreateDir {
            path: output_dir.display().to_string(),
            source,
        })?;
    }

    let files = ExportedFiles {
        accumulated: output_dir.join(ACCUMULATED_FILE),
        downsampled: output_dir.join(DOWNSAMPLED_FILE),
        camera_positions: output_dir.join(CAMERA_POSITIONS_FILE),
        report: output_dir.join(REPORT_FILE),
    };

    save_cloud(&files.accumulated, &output.accumulated, format)?;
    save_cloud(&files.downsampled, &output.downsampled, format)?;
    save_cloud(&files.camera_positions, &output.camera_positions(), format)?;

    let file = File::create(&files.report).map_err(|source| ExportError::Report {
        path: files.report.display().to_string(),
        source,
    })?;
    serde_json::to_writer_pretty(BufWriter::new(file), &output.report).map_err(|source| ExportError::Serialize {
        path: files.report.display().to_string(),
        source,
    })?;

    log::info!("Wrote outputs to {}", output_dir.display());
    Ok(files)
}
