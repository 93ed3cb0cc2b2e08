//! PLY point-cloud reading
//!
//! ASCII and binary little-endian PLY. Required vertex properties: `x,y,z`
//! (float32/float64). Optional: `red,green,blue` in `[0,255]` (or floats) and
//! normals `nx,ny,nz`. Unknown vertex properties are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use nalgebra::{Point3, Vector3};
use tracing::debug;

use crate::error::{FaceForgeError, Result};
use crate::geometry::PointCloud;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Ascii,
    BinaryLittleEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarType {
    F32,
    F64,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
}

impl ScalarType {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "float" | "float32" => Some(ScalarType::F32),
            "double" | "float64" => Some(ScalarType::F64),
            "uchar" | "uint8" => Some(ScalarType::U8),
            "char" | "int8" => Some(ScalarType::I8),
            "ushort" | "uint16" => Some(ScalarType::U16),
            "short" | "int16" => Some(ScalarType::I16),
            "uint" | "uint32" => Some(ScalarType::U32),
            "int" | "int32" => Some(ScalarType::I32),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::F32 | ScalarType::U32 | ScalarType::I32 => 4,
            ScalarType::F64 => 8,
        }
    }

    fn read_le(self, bytes: &[u8]) -> f64 {
        match self {
            ScalarType::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            ScalarType::F64 => f64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            ScalarType::U8 => bytes[0] as f64,
            ScalarType::I8 => bytes[0] as i8 as f64,
            ScalarType::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            ScalarType::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            ScalarType::U32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            ScalarType::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        }
    }
}

#[derive(Debug, Clone)]
struct VertexProperty {
    name: String,
    scalar: ScalarType,
}

#[derive(Debug)]
struct Header {
    format: Format,
    vertex_count: usize,
    properties: Vec<VertexProperty>,
    /// True when the vertex element is declared first; binary files with a
    /// preceding element cannot be sized without parsing it.
    vertex_first: bool,
}

fn invalid(msg: impl Into<String>) -> FaceForgeError {
    FaceForgeError::InputInvalid(msg.into())
}

fn parse_header<R: BufRead>(reader: &mut R) -> Result<Header> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim_end() != "ply" {
        return Err(invalid("not a PLY file (missing 'ply' magic)"));
    }

    let mut format = None;
    let mut vertex_count = None;
    let mut properties = Vec::new();
    let mut in_vertex_element = false;
    let mut seen_any_element = false;
    let mut vertex_first = false;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(invalid("unexpected end of PLY header"));
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] | ["comment", ..] | ["obj_info", ..] => continue,
            ["format", kind, _version] => {
                format = Some(match *kind {
                    "ascii" => Format::Ascii,
                    "binary_little_endian" => Format::BinaryLittleEndian,
                    other => {
                        return Err(invalid(format!("unsupported PLY format '{}'", other)));
                    }
                });
            }
            ["element", "vertex", count] => {
                vertex_count = Some(
                    count
                        .parse::<usize>()
                        .map_err(|_| invalid("bad vertex count"))?,
                );
                in_vertex_element = true;
                if !seen_any_element {
                    vertex_first = true;
                }
                seen_any_element = true;
            }
            ["element", ..] => {
                in_vertex_element = false;
                seen_any_element = true;
            }
            ["property", "list", ..] => {
                if in_vertex_element {
                    return Err(invalid("list properties on vertices are not supported"));
                }
            }
            ["property", scalar, name] => {
                if in_vertex_element {
                    let scalar = ScalarType::parse(scalar)
                        .ok_or_else(|| invalid(format!("unknown property type '{}'", scalar)))?;
                    properties.push(VertexProperty {
                        name: (*name).to_string(),
                        scalar,
                    });
                }
            }
            ["end_header"] => break,
            other => {
                return Err(invalid(format!("unrecognized header line: {:?}", other)));
            }
        }
    }

    let format = format.ok_or_else(|| invalid("PLY header missing format"))?;
    let vertex_count = vertex_count.ok_or_else(|| invalid("PLY header missing vertex element"))?;

    for required in ["x", "y", "z"] {
        if !properties.iter().any(|p| p.name == required) {
            return Err(invalid(format!("vertex property '{}' missing", required)));
        }
    }

    Ok(Header {
        format,
        vertex_count,
        properties,
        vertex_first,
    })
}

/// Read a PLY point cloud from `path`.
pub fn read_ply<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    let header = parse_header(&mut reader)?;

    if header.format == Format::BinaryLittleEndian && !header.vertex_first {
        return Err(invalid(
            "binary PLY with a non-leading vertex element is not supported",
        ));
    }

    debug!(
        vertices = header.vertex_count,
        properties = header.properties.len(),
        format = ?header.format,
        "reading PLY"
    );

    let values = match header.format {
        Format::Ascii => read_ascii_vertices(&mut reader, &header)?,
        Format::BinaryLittleEndian => read_binary_vertices(&mut reader, &header)?,
    };

    assemble_cloud(&header, values)
}

/// Per-vertex property values, row-major.
fn read_ascii_vertices<R: BufRead>(reader: &mut R, header: &Header) -> Result<Vec<f64>> {
    let n_props = header.properties.len();
    let mut values = Vec::with_capacity(header.vertex_count * n_props);
    let mut line = String::new();
    let mut read = 0usize;
    while read < header.vertex_count {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(invalid("PLY body ended before all vertices were read"));
        }
        let mut count = 0usize;
        for token in line.split_whitespace() {
            if count == n_props {
                break;
            }
            values.push(
                token
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("bad vertex value '{}'", token)))?,
            );
            count += 1;
        }
        if count == 0 {
            continue;
        }
        if count != n_props {
            return Err(invalid("vertex row has wrong property count"));
        }
        read += 1;
    }
    Ok(values)
}

fn read_binary_vertices<R: Read>(reader: &mut R, header: &Header) -> Result<Vec<f64>> {
    let stride: usize = header.properties.iter().map(|p| p.scalar.size()).sum();
    let mut buffer = vec![0u8; stride * header.vertex_count];
    reader
        .read_exact(&mut buffer)
        .map_err(|_| invalid("PLY body ended before all vertices were read"))?;

    let n_props = header.properties.len();
    let mut values = Vec::with_capacity(header.vertex_count * n_props);
    for row in buffer.chunks_exact(stride) {
        let mut offset = 0usize;
        for prop in &header.properties {
            values.push(prop.scalar.read_le(&row[offset..]));
            offset += prop.scalar.size();
        }
    }
    Ok(values)
}

fn assemble_cloud(header: &Header, values: Vec<f64>) -> Result<PointCloud> {
    let n_props = header.properties.len();
    let index = |name: &str| header.properties.iter().position(|p| p.name == name);

    let ix = index("x").expect("validated in header");
    let iy = index("y").expect("validated in header");
    let iz = index("z").expect("validated in header");
    let color_idx = match (index("red"), index("green"), index("blue")) {
        (Some(r), Some(g), Some(b)) => Some((r, g, b)),
        _ => None,
    };
    let color_is_byte = color_idx
        .map(|(r, _, _)| header.properties[r].scalar.size() == 1)
        .unwrap_or(false);
    let normal_idx = match (index("nx"), index("ny"), index("nz")) {
        (Some(x), Some(y), Some(z)) => Some((x, y, z)),
        _ => None,
    };

    let mut points = Vec::with_capacity(header.vertex_count);
    let mut colors = color_idx.map(|_| Vec::with_capacity(header.vertex_count));
    let mut normals = normal_idx.map(|_| Vec::with_capacity(header.vertex_count));

    for row in values.chunks_exact(n_props) {
        points.push(Point3::new(row[ix] as f32, row[iy] as f32, row[iz] as f32));
        if let (Some((r, g, b)), Some(colors)) = (color_idx, colors.as_mut()) {
            let scale = if color_is_byte { 1.0 / 255.0 } else { 1.0 };
            colors.push([
                (row[r] * scale) as f32,
                (row[g] * scale) as f32,
                (row[b] * scale) as f32,
            ]);
        }
        if let (Some((x, y, z)), Some(normals)) = (normal_idx, normals.as_mut()) {
            normals.push(Vector3::new(row[x] as f32, row[y] as f32, row[z] as f32));
        }
    }

    let cloud = PointCloud {
        points,
        colors,
        normals,
    };
    cloud.validate_finite()?;
    Ok(cloud)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_ascii_with_colors() {
        let ply = b"ply\n\
format ascii 1.0\n\
comment test cloud\n\
element vertex 2\n\
property float x\n\
property float y\n\
property float z\n\
property uchar red\n\
property uchar green\n\
property uchar blue\n\
end_header\n\
0.0 0.1 0.2 255 0 0\n\
1.0 1.1 1.2 0 255 0\n";
        let file = write_temp(ply);
        let cloud = read_ply(file.path()).unwrap();
        assert_eq!(cloud.len(), 2);
        assert!((cloud.points[1].x - 1.0).abs() < 1e-6);
        let colors = cloud.colors.unwrap();
        assert!((colors[0][0] - 1.0).abs() < 1e-6);
        assert!((colors[1][1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn reads_binary_little_endian_with_normals() {
        let mut body = Vec::new();
        for v in [
            [0.0f32, 0.0, 0.0, 0.0, 0.0, 1.0],
            [0.5, 0.25, 0.125, 1.0, 0.0, 0.0],
        ] {
            for c in v {
                body.extend_from_slice(&c.to_le_bytes());
            }
        }
        let mut ply = b"ply\n\
format binary_little_endian 1.0\n\
element vertex 2\n\
property float x\n\
property float y\n\
property float z\n\
property float nx\n\
property float ny\n\
property float nz\n\
end_header\n"
            .to_vec();
        ply.extend_from_slice(&body);
        let file = write_temp(&ply);
        let cloud = read_ply(file.path()).unwrap();
        assert_eq!(cloud.len(), 2);
        let normals = cloud.normals.unwrap();
        assert!((normals[0].z - 1.0).abs() < 1e-6);
        assert!((cloud.points[1].x - 0.5).abs() < 1e-6);
    }

    #[test]
    fn rejects_non_ply() {
        let file = write_temp(b"obj\nnot a ply\n");
        assert!(matches!(
            read_ply(file.path()),
            Err(FaceForgeError::InputInvalid(_))
        ));
    }

    #[test]
    fn rejects_missing_coordinates() {
        let ply = b"ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\nend_header\n0 0\n";
        let file = write_temp(ply);
        assert!(read_ply(file.path()).is_err());
    }

    #[test]
    fn truncated_body_is_invalid() {
        let ply = b"ply\nformat ascii 1.0\nelement vertex 3\nproperty float x\nproperty float y\nproperty float z\nend_header\n0 0 0\n";
        let file = write_temp(ply);
        assert!(read_ply(file.path()).is_err());
    }
}
