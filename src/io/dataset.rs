//! Frame sources.
//!
//! A directory source has the layout
//!
//! ```text
//! <root>/poses.csv                 index,x,y,z,qx,qy,qz,qw[,timestamp]
//! <root>/frames/NNNNNN.ply         organized grid (obj_info width/height)
//! <root>/frames/NNNNNN.tracks.csv  track_id,u,v (optional)
//! ```

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::{Frame, ReportedPose, TrackedKeypoint};

use super::ply::{self, PlyError, PlyFormat};

pub const POSES_FILE: &str = "poses.csv";
pub const FRAMES_DIR: &str = "frames";

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid dataset format: {0}")]
    Format(String),

    #[error("Frame index out of bounds: {0}")]
    FrameIndex(usize),

    #[error("failed to load frame {index}: {source}")]
    Ply {
        index: usize,
        #[source]
        source: PlyError,
    },
}

pub type Result<T> = std::result::Result<T, DatasetError>;

/// Supplies frames by index. Frames are shared, never copied.
pub trait FrameSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_frame(&self, index: usize) -> Result<Arc<Frame>>;
}

/// Frames held in memory, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    frames: Vec<Arc<Frame>>,
}

impl InMemorySource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(Arc::new(frame));
    }
}

impl FrameSource for InMemorySource {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn get_frame(&self, index: usize) -> Result<Arc<Frame>> {
        self.frames
            .get(index)
            .cloned()
            .ok_or(DatasetError::FrameIndex(index))
    }
}

#[derive(Debug, Clone)]
struct PoseEntry {
    pose: ReportedPose,
    timestamp: Option<f64>,
}

/// Frames stored on disk; grids are loaded lazily per `get_frame`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    poses: Vec<PoseEntry>,
}

impl DirectorySource {
    pub fn open(root: &Path) -> Result<Self> {
        let poses = parse_poses(&root.join(POSES_FILE))?;
        log::info!("Opened {} with {} frames", root.display(), poses.len());
        Ok(Self {
            root: root.to_path_buf(),
            poses,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn grid_path(&self, index: usize) -> PathBuf {
        frame_path(&self.root, index, "ply")
    }

    pub fn tracks_path(&self, index: usize) -> PathBuf {
        frame_path(&self.root, index, "tracks.csv")
    }

    /// Write `frames` in directory layout under `root`.
    pub fn write(root: &Path, frames: &[Frame], format: PlyFormat) -> Result<()> {
        fs::create_dir_all(root.join(FRAMES_DIR))?;
        let mut poses = BufWriter::new(File::create(root.join(POSES_FILE))?);
        writeln!(poses, "# index,x,y,z,qx,qy,qz,qw,timestamp")?;
        for frame in frames {
            let pose = frame.pose();
            let [x, y, z] = pose.position;
            let [qx, qy, qz, qw] = pose.orientation;
            write!(poses, "{},{x},{y},{z},{qx},{qy},{qz},{qw}", frame.index())?;
            match frame.timestamp() {
                Some(t) => writeln!(poses, ",{t}")?,
                None => writeln!(poses)?,
            }

            let index = frame.index();
            ply::save_grid(&frame_path(root, index, "ply"), frame.grid(), format)
                .map_err(|source| DatasetError::Ply { index, source })?;
            if !frame.keypoints().is_empty() {
                let mut tracks = BufWriter::new(File::create(frame_path(root, index, "tracks.csv"))?);
                writeln!(tracks, "track_id,u,v")?;
                for kp in frame.keypoints() {
                    writeln!(tracks, "{},{},{}", kp.track_id, kp.u, kp.v)?;
                }
                tracks.flush()?;
            }
        }
        poses.flush()?;
        Ok(())
    }
}

impl FrameSource for DirectorySource {
    fn len(&self) -> usize {
        self.poses.len()
    }

    fn get_frame(&self, index: usize) -> Result<Arc<Frame>> {
        let entry = self.poses.get(index).ok_or(DatasetError::FrameIndex(index))?;
        let grid = ply::load_grid(&self.grid_path(index)).map_err(|source| DatasetError::Ply { index, source })?;

        let tracks_path = self.tracks_path(index);
        let keypoints = if tracks_path.exists() {
            parse_tracks(&tracks_path)?
        } else {
            Vec::new()
        };

        let mut frame = Frame::new(index, entry.pose, grid).with_keypoints(keypoints);
        if let Some(timestamp) = entry.timestamp {
            frame = frame.with_timestamp(timestamp);
        }
        Ok(Arc::new(frame))
    }
}

fn frame_path(root: &Path, index: usize, extension: &str) -> PathBuf {
    root.join(FRAMES_DIR).join(format!("{index:06}.{extension}"))
}

/// Non-empty, non-comment lines with their 1-based line numbers. A first line
/// whose leading field is not numeric is treated as a header and skipped.
fn data_lines(path: &Path) -> Result<Vec<(usize, String)>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let first = line.split(',').next().unwrap_or("").trim();
        if lines.is_empty() && first.parse::<f64>().is_err() {
            continue;
        }
        lines.push((line_num + 1, line.to_string()));
    }
    Ok(lines)
}

fn parse_field<T: std::str::FromStr>(path: &Path, line_num: usize, name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        DatasetError::Format(format!(
            "{}: line {}: invalid {} '{}'",
            path.display(),
            line_num,
            name,
            raw.trim()
        ))
    })
}

fn parse_poses(path: &Path) -> Result<Vec<PoseEntry>> {
    const NAMES: [&str; 7] = ["x", "y", "z", "qx", "qy", "qz", "qw"];
    let mut poses = Vec::new();

    for (line_num, line) in data_lines(path)? {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 8 && parts.len() != 9 {
            return Err(DatasetError::Format(format!(
                "{}: line {}: expected 8 or 9 fields, got {}",
                path.display(),
                line_num,
                parts.len()
            )));
        }
        let index: usize = parse_field(path, line_num, "index", parts[0])?;
        if index != poses.len() {
            return Err(DatasetError::Format(format!(
                "{}: line {}: expected frame index {}, got {}",
                path.display(),
                line_num,
                poses.len(),
                index
            )));
        }
        let mut values = [0.0f64; 7];
        for (slot, (name, raw)) in values.iter_mut().zip(NAMES.iter().zip(&parts[1..8])) {
            *slot = parse_field(path, line_num, name, raw)?;
        }
        let timestamp = match parts.get(8) {
            Some(raw) => Some(parse_field(path, line_num, "timestamp", raw)?),
            None => None,
        };
        poses.push(PoseEntry {
            pose: ReportedPose::new(
                [values[0], values[1], values[2]],
                [values[3], values[4], values[5], values[6]],
            ),
            timestamp,
        });
    }
    Ok(poses)
}

fn parse_tracks(path: &Path) -> Result<Vec<TrackedKeypoint>> {
    data_lines(path)?
        .into_iter()
        .map(|(line_num, line)| {
            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() != 3 {
                return Err(DatasetError::Format(format!(
                    "{}: line {}: expected track_id,u,v",
                    path.display(),
                    line_num
                )));
            }
            Ok(TrackedKeypoint {
                track_id: parse_field(path, line_num, "track_id", parts[0])?,
                u: parse_field(path, line_num, "u", parts[1])?,
                v: parse_field(path, line_num, "v", parts[2])?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColoredPoint, PointGrid, SE3};
    use glam::{DVec3, Vec3};
    use tempfile::tempdir;

    fn frame(index: usize) -> Frame {
        let pose = SE3::from_axis_angle(DVec3::Z, 0.1 * index as f64, DVec3::new(index as f64, 2.0, 30.0));
        let grid = PointGrid::new(
            2,
            1,
            vec![ColoredPoint::new(Vec3::new(0.5, 0.5, 4.0), [7, 8, 9]), ColoredPoint::invalid()],
        )
        .unwrap();
        Frame::new(index, ReportedPose::from_se3(&pose), grid)
            .with_keypoints(vec![TrackedKeypoint { track_id: 42, u: 0, v: 0 }])
            .with_timestamp(index as f64 * 0.5)
    }

    #[test]
    fn test_directory_roundtrip() {
        let dir = tempdir().unwrap();
        let frames = vec![frame(0), frame(1), frame(2)];
        DirectorySource::write(dir.path(), &frames, PlyFormat::BinaryLittleEndian).unwrap();

        let source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 3);
        let loaded = source.get_frame(1).unwrap();
        assert_eq!(loaded.pose(), frames[1].pose());
        assert_eq!(loaded.keypoints(), frames[1].keypoints());
        assert_eq!(loaded.timestamp(), Some(0.5));
        assert_eq!(loaded.grid().valid_count(), 1);
        assert!(matches!(source.get_frame(3), Err(DatasetError::FrameIndex(3))));
    }

    #[test]
    fn test_pose_header_and_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(POSES_FILE);
        fs::write(
            &path,
            "index,x,y,z,qx,qy,qz,qw\n# comment\n\n0,1,2,3,0,0,0,1\n1,4,5,6,0,0,0,1\n",
        )
        .unwrap();
        let poses = parse_poses(&path).unwrap();
        assert_eq!(poses.len(), 2);
        assert_eq!(poses[1].pose.position, [4.0, 5.0, 6.0]);
        assert!(poses[0].timestamp.is_none());
    }

    #[test]
    fn test_pose_index_gap_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(POSES_FILE);
        fs::write(&path, "0,1,2,3,0,0,0,1\n2,4,5,6,0,0,0,1\n").unwrap();
        assert!(matches!(parse_poses(&path), Err(DatasetError::Format(_))));
    }

    #[test]
    fn test_bad_number_reports_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(POSES_FILE);
        fs::write(&path, "0,1,2,abc,0,0,0,1\n").unwrap();
        let err = parse_poses(&path).unwrap_err().to_string();
        assert!(err.contains("line 1"));
        assert!(err.contains("'abc'"));
    }

    #[test]
    fn test_missing_grid_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(POSES_FILE), "0,0,0,0,0,0,0,1\n").unwrap();
        let source = DirectorySource::open(dir.path()).unwrap();
        assert!(matches!(source.get_frame(0), Err(DatasetError::Ply { index: 0, .. })));
    }

    #[test]
    fn test_in_memory_source() {
        let source = InMemorySource::new(vec![frame(0)]);
        assert_eq!(source.len(), 1);
        assert!(!source.is_empty());
        assert!(source.get_frame(1).is_err());
    }
}
