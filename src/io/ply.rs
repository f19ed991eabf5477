//! PLY point cloud reading and writing.
//!
//! Writes `x y z` as float and `red green blue` as uchar, in ASCII or binary
//! little endian. Organized grids carry their dimensions in
//! `obj_info width W` / `obj_info height H` header lines (the PCL spellings
//! `num_cols` / `num_rows` are accepted on read).

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ColoredPoint, FrameError, PointCloud, PointGrid};

/// Upper bound on vertices reserved up front. The header count is untrusted;
/// anything beyond this grows as the body is actually read.
const MAX_PREALLOCATED_VERTICES: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum PlyError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: String, source: io::Error },
    #[error("failed to create output directory {path}: {source}")]
    CreateDir { path: String, source: io::Error },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid PLY header: {0}")]
    Header(String),
    #[error("invalid PLY data at vertex {vertex}: {message}")]
    Body { vertex: usize, message: String },
    #[error(transparent)]
    Grid(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlyFormat {
    Ascii,
    #[default]
    BinaryLittleEndian,
}

impl PlyFormat {
    fn header_name(self) -> &'static str {
        match self {
            PlyFormat::Ascii => "ascii",
            PlyFormat::BinaryLittleEndian => "binary_little_endian",
        }
    }
}

/// Contents of a PLY vertex element.
#[derive(Debug, Clone, PartialEq)]
pub struct PlyData {
    pub points: Vec<ColoredPoint>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "char" | "int8" => Scalar::I8,
            "uchar" | "uint8" => Scalar::U8,
            "short" | "int16" => Scalar::I16,
            "ushort" | "uint16" => Scalar::U16,
            "int" | "int32" => Scalar::I32,
            "uint" | "uint32" => Scalar::U32,
            "float" | "float32" => Scalar::F32,
            "double" | "float64" => Scalar::F64,
            _ => return None,
        })
    }

    fn read<R: Read>(self, reader: &mut R) -> io::Result<f64> {
        Ok(match self {
            Scalar::I8 => reader.read_i8()? as f64,
            Scalar::U8 => reader.read_u8()? as f64,
            Scalar::I16 => reader.read_i16::<LittleEndian>()? as f64,
            Scalar::U16 => reader.read_u16::<LittleEndian>()? as f64,
            Scalar::I32 => reader.read_i32::<LittleEndian>()? as f64,
            Scalar::U32 => reader.read_u32::<LittleEndian>()? as f64,
            Scalar::F32 => reader.read_f32::<LittleEndian>()? as f64,
            Scalar::F64 => reader.read_f64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    X,
    Y,
    Z,
    Red,
    Green,
    Blue,
    Other,
}

impl Field {
    fn parse(name: &str) -> Self {
        match name {
            "x" => Field::X,
            "y" => Field::Y,
            "z" => Field::Z,
            "red" | "r" | "diffuse_red" => Field::Red,
            "green" | "g" | "diffuse_green" => Field::Green,
            "blue" | "b" | "diffuse_blue" => Field::Blue,
            _ => Field::Other,
        }
    }
}

#[derive(Debug)]
struct Header {
    format: PlyFormat,
    vertex_count: usize,
    properties: Vec<(Field, Scalar)>,
    width: Option<u32>,
    height: Option<u32>,
}

fn parse_header<R: BufRead>(reader: &mut R) -> Result<Header, PlyError> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim() != "ply" {
        return Err(PlyError::Header("missing 'ply' magic".to_string()));
    }

    let mut format = None;
    let mut vertex_count = None;
    let mut in_vertex = false;
    let mut properties = Vec::new();
    let mut width = None;
    let mut height = None;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(PlyError::Header("unexpected end of header".to_string()));
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["end_header"] => break,
            ["format", name, _version] => {
                format = Some(match *name {
                    "ascii" => PlyFormat::Ascii,
                    "binary_little_endian" => PlyFormat::BinaryLittleEndian,
                    other => return Err(PlyError::Header(format!("unsupported format '{other}'"))),
                });
            }
            ["comment", ..] | [] => {}
            ["obj_info", key, value] => {
                let parsed = value.parse::<u32>().ok();
                match *key {
                    "width" | "num_cols" => width = parsed,
                    "height" | "num_rows" => height = parsed,
                    _ => {}
                }
            }
            ["obj_info", ..] => {}
            ["element", name, count] => {
                let count: usize = count
                    .parse()
                    .map_err(|_| PlyError::Header(format!("invalid element count '{count}'")))?;
                if *name == "vertex" {
                    vertex_count = Some(count);
                    in_vertex = true;
                } else if vertex_count.is_none() && count > 0 {
                    return Err(PlyError::Header(format!(
                        "element '{name}' before vertex is not supported"
                    )));
                } else {
                    in_vertex = false;
                }
            }
            ["property", "list", ..] if in_vertex => {
                return Err(PlyError::Header("list properties on vertex are not supported".to_string()));
            }
            ["property", ty, name] => {
                if in_vertex {
                    let scalar = Scalar::parse(ty)
                        .ok_or_else(|| PlyError::Header(format!("unknown property type '{ty}'")))?;
                    properties.push((Field::parse(name), scalar));
                }
            }
            ["property", ..] => {}
            other => {
                return Err(PlyError::Header(format!("unrecognized line '{}'", other.join(" "))));
            }
        }
    }

    let format = format.ok_or_else(|| PlyError::Header("missing format line".to_string()))?;
    let vertex_count = vertex_count.ok_or_else(|| PlyError::Header("missing vertex element".to_string()))?;
    for required in [Field::X, Field::Y, Field::Z] {
        if !properties.iter().any(|(field, _)| *field == required) {
            return Err(PlyError::Header(format!("missing {required:?} property")));
        }
    }

    Ok(Header {
        format,
        vertex_count,
        properties,
        width,
        height,
    })
}

fn assemble(values: &[f64], properties: &[(Field, Scalar)]) -> ColoredPoint {
    let mut position = Vec3::ZERO;
    let mut color = [255u8; 3];
    for ((field, _), value) in properties.iter().zip(values) {
        let channel = value.round().clamp(0.0, 255.0) as u8;
        match field {
            Field::X => position.x = *value as f32,
            Field::Y => position.y = *value as f32,
            Field::Z => position.z = *value as f32,
            Field::Red => color[0] = channel,
            Field::Green => color[1] = channel,
            Field::Blue => color[2] = channel,
            Field::Other => {}
        }
    }
    ColoredPoint::new(position, color)
}

/// Read the vertex element of a PLY stream.
pub fn read_ply<R: BufRead>(mut reader: R) -> Result<PlyData, PlyError> {
    let header = parse_header(&mut reader)?;
    let mut points = Vec::with_capacity(header.vertex_count.min(MAX_PREALLOCATED_VERTICES));
    let mut values = vec![0.0f64; header.properties.len()];

    match header.format {
        PlyFormat::Ascii => {
            let mut line = String::new();
            for vertex in 0..header.vertex_count {
                line.clear();
                if reader.read_line(&mut line)? == 0 {
                    return Err(PlyError::Body {
                        vertex,
                        message: "unexpected end of file".to_string(),
                    });
                }
                let tokens: Vec<&str> = line.split_whitespace().collect();
                if tokens.len() < values.len() {
                    return Err(PlyError::Body {
                        vertex,
                        message: format!("expected {} values, got {}", values.len(), tokens.len()),
                    });
                }
                for (slot, token) in values.iter_mut().zip(&tokens) {
                    *slot = token.parse().map_err(|_| PlyError::Body {
                        vertex,
                        message: format!("invalid number '{token}'"),
                    })?;
                }
                points.push(assemble(&values, &header.properties));
            }
        }
        PlyFormat::BinaryLittleEndian => {
            for vertex in 0..header.vertex_count {
                for (slot, (_, scalar)) in values.iter_mut().zip(&header.properties) {
                    *slot = scalar.read(&mut reader).map_err(|e| PlyError::Body {
                        vertex,
                        message: e.to_string(),
                    })?;
                }
                points.push(assemble(&values, &header.properties));
            }
        }
    }

    Ok(PlyData {
        points,
        width: header.width,
        height: header.height,
    })
}

fn write_points<W: Write>(
    writer: &mut W,
    points: &[ColoredPoint],
    format: PlyFormat,
    dimensions: Option<(u32, u32)>,
) -> io::Result<()> {
    writeln!(writer, "ply")?;
    writeln!(writer, "format {} 1.0", format.header_name())?;
    writeln!(writer, "comment rustfuse point cloud")?;
    if let Some((width, height)) = dimensions {
        writeln!(writer, "obj_info width {width}")?;
        writeln!(writer, "obj_info height {height}")?;
    }
    writeln!(writer, "element vertex {}", points.len())?;
    writeln!(writer, "property float x")?;
    writeln!(writer, "property float y")?;
    writeln!(writer, "property float z")?;
    writeln!(writer, "property uchar red")?;
    writeln!(writer, "property uchar green")?;
    writeln!(writer, "property uchar blue")?;
    writeln!(writer, "end_header")?;

    match format {
        PlyFormat::Ascii => {
            for p in points {
                let [r, g, b] = p.color;
                writeln!(writer, "{} {} {} {r} {g} {b}", p.position.x, p.position.y, p.position.z)?;
            }
        }
        PlyFormat::BinaryLittleEndian => {
            for p in points {
                writer.write_f32::<LittleEndian>(p.position.x)?;
                writer.write_f32::<LittleEndian>(p.position.y)?;
                writer.write_f32::<LittleEndian>(p.position.z)?;
                writer.write_all(&p.color)?;
            }
        }
    }
    writer.flush()
}

pub fn write_cloud<W: Write>(writer: &mut W, cloud: &PointCloud, format: PlyFormat) -> io::Result<()> {
    write_points(writer, cloud.points(), format, None)
}

pub fn write_grid<W: Write>(writer: &mut W, grid: &PointGrid, format: PlyFormat) -> io::Result<()> {
    write_points(writer, grid.points(), format, Some((grid.width(), grid.height())))
}

fn create_file(path: &Path) -> Result<BufWriter<File>, PlyError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|source| PlyError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }
    let file = File::create(path).map_err(|source| PlyError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufWriter::new(file))
}

pub fn save_cloud(path: &Path, cloud: &PointCloud, format: PlyFormat) -> Result<(), PlyError> {
    let mut writer = create_file(path)?;
    write_cloud(&mut writer, cloud, format).map_err(|source| PlyError::Write {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_grid(path: &Path, grid: &PointGrid, format: PlyFormat) -> Result<(), PlyError> {
    let mut writer = create_file(path)?;
    write_grid(&mut writer, grid, format).map_err(|source| PlyError::Write {
        path: path.display().to_string(),
        source,
    })
}

fn open(path: &Path) -> Result<BufReader<File>, PlyError> {
    let file = File::open(path).map_err(|source| PlyError::Open {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}

pub fn load_cloud(path: &Path) -> Result<PointCloud, PlyError> {
    Ok(PointCloud::from_points(read_ply(open(path)?)?.points))
}

/// Load an organized grid. Files without grid dimensions are rejected.
pub fn load_grid(path: &Path) -> Result<PointGrid, PlyError> {
    let data = read_ply(open(path)?)?;
    match (data.width, data.height) {
        (Some(width), Some(height)) => Ok(PointGrid::new(width, height, data.points)?),
        _ => Err(PlyError::Header(format!(
            "{} has no obj_info width/height",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn sample() -> PointCloud {
        PointCloud::from_points(vec![
            ColoredPoint::new(Vec3::new(1.5, -2.25, 3.0), [255, 0, 10]),
            ColoredPoint::new(Vec3::new(0.0, 0.125, -7.5), [1, 2, 3]),
        ])
    }

    #[test]
    fn test_ascii_roundtrip() {
        let mut buf = Vec::new();
        write_cloud(&mut buf, &sample(), PlyFormat::Ascii).unwrap();
        let data = read_ply(Cursor::new(buf)).unwrap();
        assert_eq!(data.points, sample().into_points());
        assert_eq!(data.width, None);
    }

    #[test]
    fn test_binary_roundtrip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cloud.ply");
        save_cloud(&path, &sample(), PlyFormat::BinaryLittleEndian).unwrap();
        assert_eq!(load_cloud(&path).unwrap(), sample());
    }

    #[test]
    fn test_grid_keeps_invalid_pixels() {
        let grid = PointGrid::new(
            2,
            2,
            vec![
                ColoredPoint::new(Vec3::new(0.0, 0.0, 1.0), [1, 1, 1]),
                ColoredPoint::invalid(),
                ColoredPoint::new(Vec3::new(1.0, 1.0, 2.0), [2, 2, 2]),
                ColoredPoint::invalid(),
            ],
        )
        .unwrap();
        let dir = tempdir().unwrap();
        for format in [PlyFormat::Ascii, PlyFormat::BinaryLittleEndian] {
            let path = dir.path().join(format!("{format:?}.ply"));
            save_grid(&path, &grid, format).unwrap();
            let loaded = load_grid(&path).unwrap();
            assert_eq!(loaded.width(), 2);
            assert_eq!(loaded.valid_count(), 2);
            assert!(loaded.get(1, 0).is_none());
            assert_eq!(loaded.get(0, 1).unwrap().color, [2, 2, 2]);
        }
    }

    #[test]
    fn test_reads_pcl_style_header() {
        let text = "ply\nformat ascii 1.0\ncomment PCL generated\nobj_info is_cropped 0\nobj_info num_cols 1\nobj_info num_rows 2\n\
element vertex 2\nproperty float x\nproperty float y\nproperty float z\nproperty float intensity\n\
property uchar red\nproperty uchar green\nproperty uchar blue\nelement camera 1\nproperty float view_px\nend_header\n\
1 2 3 0.5 10 20 30\nnan nan nan 0 0 0 0\n0 0 0\n";
        let data = read_ply(Cursor::new(text.as_bytes())).unwrap();
        assert_eq!(data.width, Some(1));
        assert_eq!(data.height, Some(2));
        assert_eq!(data.points[0].color, [10, 20, 30]);
        assert!(!data.points[1].is_valid());
    }

    #[test]
    fn test_cloud_without_dimensions_is_not_a_grid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flat.ply");
        save_cloud(&path, &sample(), PlyFormat::Ascii).unwrap();
        assert!(matches!(load_grid(&path), Err(PlyError::Header(_))));
    }

    #[test]
    fn test_truncated_body() {
        let text = "ply\nformat ascii 1.0\nelement vertex 2\nproperty float x\nproperty float y\nproperty float z\nend_header\n1 2 3\n";
        assert!(matches!(
            read_ply(Cursor::new(text.as_bytes())),
            Err(PlyError::Body { vertex: 1, .. })
        ));
    }

    #[test]
    fn test_oversized_vertex_count_is_a_body_error() {
        let ascii = "ply\nformat ascii 1.0\nelement vertex 18446744073709551615\n\
property float x\nproperty float y\nproperty float z\nend_header\n1 2 3\n";
        assert!(matches!(
            read_ply(Cursor::new(ascii.as_bytes())),
            Err(PlyError::Body { vertex: 1, .. })
        ));

        let mut binary = b"ply\nformat binary_little_endian 1.0\nelement vertex 1000000000000\n\
property float x\nproperty float y\nproperty float z\nend_header\n"
            .to_vec();
        binary.extend_from_slice(&[0u8; 12]);
        assert!(matches!(
            read_ply(Cursor::new(binary)),
            Err(PlyError::Body { vertex: 1, .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_cloud(Path::new("/nonexistent/cloud.ply")),
            Err(PlyError::Open { .. })
        ));
    }
}
