//! Model asset loading
//!
//! The FLAME parameter file and the landmark embedding file are NPZ archives
//! (zip containers of NPY arrays). Only the little-endian scalar dtypes the
//! assets actually use are supported.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use zip::ZipArchive;

use crate::error::{FaceForgeError, Result};

/// A decoded NPY array: flat data in C order plus its shape.
#[derive(Debug, Clone)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    data: NpyData,
}

#[derive(Debug, Clone)]
enum NpyData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U32(Vec<u32>),
}

impl NpyArray {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn to_f32(&self) -> Vec<f32> {
        match &self.data {
            NpyData::F32(v) => v.clone(),
            NpyData::F64(v) => v.iter().map(|&x| x as f32).collect(),
            NpyData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            NpyData::I64(v) => v.iter().map(|&x| x as f32).collect(),
            NpyData::U32(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    pub fn to_u32(&self) -> Result<Vec<u32>> {
        let convert_signed = |x: i64| -> Result<u32> {
            u32::try_from(x)
                .map_err(|_| FaceForgeError::AssetLoad(format!("negative index {} in array", x)))
        };
        match &self.data {
            NpyData::U32(v) => Ok(v.clone()),
            NpyData::I32(v) => v.iter().map(|&x| convert_signed(x as i64)).collect(),
            NpyData::I64(v) => v.iter().map(|&x| convert_signed(x)).collect(),
            _ => Err(FaceForgeError::AssetLoad(
                "expected an integer array".to_string(),
            )),
        }
    }
}

/// Parse a single NPY buffer.
fn parse_npy(bytes: &[u8], name: &str) -> Result<NpyArray> {
    let bad = |msg: &str| FaceForgeError::AssetLoad(format!("{}: {}", name, msg));

    if bytes.len() < 10 || &bytes[0..6] != b"\x93NUMPY" {
        return Err(bad("not an NPY array"));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (
            u16::from_le_bytes([bytes[8], bytes[9]]) as usize,
            10usize,
        ),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(bad("truncated header"));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12usize,
            )
        }
        _ => return Err(bad("unsupported NPY version")),
    };

    let header_end = header_start + header_len;
    if bytes.len() < header_end {
        return Err(bad("truncated header"));
    }
    let header = std::str::from_utf8(&bytes[header_start..header_end])
        .map_err(|_| bad("header is not UTF-8"))?;

    if header.contains("'fortran_order': True") {
        return Err(bad("fortran-ordered arrays are not supported"));
    }

    let descr = extract_quoted(header, "descr").ok_or_else(|| bad("missing descr"))?;
    let shape = extract_shape(header).ok_or_else(|| bad("missing shape"))?;
    let count: usize = shape.iter().product();

    let payload = &bytes[header_end..];
    let data = match descr.as_str() {
        "<f4" | "|f4" => NpyData::F32(read_scalars(payload, count, 4, |c| {
            f32::from_le_bytes([c[0], c[1], c[2], c[3]])
        })?),
        "<f8" => NpyData::F64(read_scalars(payload, count, 8, |c| {
            f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
        })?),
        "<i4" => NpyData::I32(read_scalars(payload, count, 4, |c| {
            i32::from_le_bytes([c[0], c[1], c[2], c[3]])
        })?),
        "<i8" => NpyData::I64(read_scalars(payload, count, 8, |c| {
            i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
        })?),
        "<u4" => NpyData::U32(read_scalars(payload, count, 4, |c| {
            u32::from_le_bytes([c[0], c[1], c[2], c[3]])
        })?),
        other => return Err(bad(&format!("unsupported dtype {}", other))),
    };

    Ok(NpyArray { shape, data })
}

fn read_scalars<T>(
    payload: &[u8],
    count: usize,
    item_size: usize,
    decode: impl Fn(&[u8]) -> T,
) -> Result<Vec<T>> {
    let needed = count * item_size;
    if payload.len() < needed {
        return Err(FaceForgeError::AssetLoad(format!(
            "array payload truncated: need {} bytes, have {}",
            needed,
            payload.len()
        )));
    }
    Ok(payload[..needed].chunks_exact(item_size).map(decode).collect())
}

fn extract_quoted(header: &str, key: &str) -> Option<String> {
    let needle = format!("'{}':", key);
    let start = header.find(&needle)? + needle.len();
    let rest = &header[start..];
    let open = rest.find('\'')? + 1;
    let close = rest[open..].find('\'')? + open;
    Some(rest[open..close].to_string())
}

fn extract_shape(header: &str) -> Option<Vec<usize>> {
    let start = header.find("'shape':")?;
    let rest = &header[start..];
    let open = rest.find('(')? + 1;
    let close = rest[open..].find(')')? + open;
    let inner = &rest[open..close];
    let mut shape = Vec::new();
    for token in inner.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        shape.push(token.parse().ok()?);
    }
    if shape.is_empty() {
        // A 0-d scalar: treat as a single element.
        shape.push(1);
    }
    Some(shape)
}

/// An opened NPZ archive.
pub struct NpzArchive {
    archive: ZipArchive<File>,
}

impl NpzArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            FaceForgeError::AssetLoad(format!("{}: {}", path.as_ref().display(), e))
        })?;
        let archive = ZipArchive::new(file)
            .map_err(|e| FaceForgeError::AssetLoad(format!("not an NPZ archive: {}", e)))?;
        Ok(Self { archive })
    }

    /// Read and decode the array stored under `name` (`<name>.npy`).
    pub fn array(&mut self, name: &str) -> Result<NpyArray> {
        let entry_name = format!("{}.npy", name);
        let mut entry = self
            .archive
            .by_name(&entry_name)
            .map_err(|_| FaceForgeError::AssetLoad(format!("missing array '{}'", name)))?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| FaceForgeError::AssetLoad(format!("reading '{}': {}", name, e)))?;
        parse_npy(&bytes, name)
    }

    pub fn has_array(&mut self, name: &str) -> bool {
        self.archive.by_name(&format!("{}.npy", name)).is_ok()
    }
}

/// The decoded FLAME parameter asset.
///
/// `shapedirs` and `expdirs` are flattened `[3*V, n]` row-major so a
/// coefficient column vector multiplies directly into vertex offsets.
#[derive(Debug, Clone)]
pub struct FlameAsset {
    pub n_vertices: usize,
    pub n_shape: usize,
    pub n_expr: usize,
    pub v_template: Vec<f32>,
    pub shapedirs: Vec<f32>,
    pub expdirs: Vec<f32>,
    pub faces: Vec<[u32; 3]>,
    pub jaw_weights: Vec<f32>,
    pub jaw_pivot: [f32; 3],
}

impl FlameAsset {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut npz = NpzArchive::open(path)?;

        let template = npz.array("v_template")?;
        if template.shape.len() != 2 || template.shape[1] != 3 {
            return Err(FaceForgeError::AssetLoad(
                "v_template must be (V, 3)".to_string(),
            ));
        }
        let n_vertices = template.shape[0];

        let shapedirs = npz.array("shapedirs")?;
        let expdirs = npz.array("expdirs")?;
        let n_shape = basis_width(&shapedirs, n_vertices, "shapedirs")?;
        let n_expr = basis_width(&expdirs, n_vertices, "expdirs")?;

        let faces_arr = npz.array("faces")?;
        if faces_arr.shape.len() != 2 || faces_arr.shape[1] != 3 {
            return Err(FaceForgeError::AssetLoad("faces must be (F, 3)".to_string()));
        }
        let flat = faces_arr.to_u32()?;
        let mut faces = Vec::with_capacity(faces_arr.shape[0]);
        for tri in flat.chunks_exact(3) {
            let tri = [tri[0], tri[1], tri[2]];
            if tri.iter().any(|&v| v as usize >= n_vertices) {
                return Err(FaceForgeError::AssetLoad(
                    "face index out of range".to_string(),
                ));
            }
            faces.push(tri);
        }

        // Jaw articulation arrays are optional; without them the jaw pose
        // channel is inert.
        let jaw_weights = if npz.has_array("jaw_weights") {
            let arr = npz.array("jaw_weights")?;
            if arr.len() != n_vertices {
                return Err(FaceForgeError::AssetLoad(
                    "jaw_weights length mismatch".to_string(),
                ));
            }
            arr.to_f32()
        } else {
            vec![0.0; n_vertices]
        };
        let jaw_pivot = if npz.has_array("jaw_pivot") {
            let arr = npz.array("jaw_pivot")?;
            let v = arr.to_f32();
            if v.len() != 3 {
                return Err(FaceForgeError::AssetLoad(
                    "jaw_pivot must have 3 elements".to_string(),
                ));
            }
            [v[0], v[1], v[2]]
        } else {
            [0.0; 3]
        };

        Ok(Self {
            n_vertices,
            n_shape,
            n_expr,
            v_template: template.to_f32(),
            shapedirs: shapedirs.to_f32(),
            expdirs: expdirs.to_f32(),
            faces,
            jaw_weights,
            jaw_pivot,
        })
    }
}

/// Accept `(V, 3, n)` or pre-flattened `(3V, n)` blendshape bases.
fn basis_width(arr: &NpyArray, n_vertices: usize, name: &str) -> Result<usize> {
    match arr.shape.as_slice() {
        [v, 3, n] if *v == n_vertices => Ok(*n),
        [rows, n] if *rows == 3 * n_vertices => Ok(*n),
        _ => Err(FaceForgeError::AssetLoad(format!(
            "{} shape {:?} does not match {} vertices",
            name, arr.shape, n_vertices
        ))),
    }
}

/// Raw landmark embedding arrays as stored in the embedding NPZ.
#[derive(Debug, Clone)]
pub struct LandmarkEmbeddingAsset {
    pub face_idx: Vec<u32>,
    pub bary: Vec<[f32; 3]>,
}

impl LandmarkEmbeddingAsset {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut npz = NpzArchive::open(path)?;
        let face_idx = npz.array("lmk_face_idx")?.to_u32()?;
        let coords = npz.array("lmk_b_coords")?;
        if coords.shape.len() != 2 || coords.shape[1] != 3 {
            return Err(FaceForgeError::AssetLoad(
                "lmk_b_coords must be (L, 3)".to_string(),
            ));
        }
        if coords.shape[0] != face_idx.len() {
            return Err(FaceForgeError::AssetLoad(
                "landmark arrays disagree on length".to_string(),
            ));
        }
        let flat = coords.to_f32();
        let bary = flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
        Ok(Self { face_idx, bary })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npy_bytes(descr: &str, shape: &str, payload: &[u8]) -> Vec<u8> {
        let header = format!(
            "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
            descr, shape
        );
        let mut padded = header.into_bytes();
        while (10 + padded.len()) % 64 != 0 {
            padded.push(b' ');
        }
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x93NUMPY");
        bytes.push(1);
        bytes.push(0);
        bytes.extend_from_slice(&(padded.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&padded);
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn parses_f4_array() {
        let values = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let arr = parse_npy(&npy_bytes("<f4", "(2, 3)", &payload), "test").unwrap();
        assert_eq!(arr.shape, vec![2, 3]);
        assert_eq!(arr.to_f32(), values.to_vec());
    }

    #[test]
    fn parses_i8_indices() {
        let values = [0i64, 5, 17];
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let arr = parse_npy(&npy_bytes("<i8", "(3,)", &payload), "test").unwrap();
        assert_eq!(arr.to_u32().unwrap(), vec![0, 5, 17]);
    }

    #[test]
    fn rejects_fortran_order() {
        let header = "{'descr': '<f4', 'fortran_order': True, 'shape': (1,), }";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x93NUMPY");
        bytes.push(1);
        bytes.push(0);
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        assert!(parse_npy(&bytes, "test").is_err());
    }

    #[test]
    fn basis_width_accepts_both_layouts() {
        let arr = NpyArray {
            shape: vec![10, 3, 7],
            data: NpyData::F32(vec![0.0; 210]),
        };
        assert_eq!(basis_width(&arr, 10, "shapedirs").unwrap(), 7);
        let flat = NpyArray {
            shape: vec![30, 7],
            data: NpyData::F32(vec![0.0; 210]),
        };
        assert_eq!(basis_width(&flat, 10, "shapedirs").unwrap(), 7);
        let bad = NpyArray {
            shape: vec![11, 3, 7],
            data: NpyData::F32(vec![0.0; 231]),
        };
        assert!(basis_width(&bad, 10, "shapedirs").is_err());
    }
}
