//! IO module: frame sources, PLY clouds and output export.

pub mod dataset;
pub mod export;
pub mod ply;

pub use dataset::{DatasetError, DirectorySource, FrameSource, InMemorySource, FRAMES_DIR, POSES_FILE};
pub use export::{export_outputs, ExportError, ExportedFiles};
pub use ply::{load_cloud, load_grid, save_cloud, save_grid, PlyError, PlyFormat};
