//! GLB mesh export
//!
//! Minimal glTF 2.0 binary writer: one mesh with positions and triangle
//! indices. Vertex order is preserved exactly (the canonical model order),
//! which downstream morphing relies on.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use nalgebra::Point3;
use serde_json::json;

use crate::error::{FaceForgeError, Result};

const GLB_MAGIC: u32 = 0x4654_6C67; // "glTF"
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

/// Serialize the mesh into a GLB byte buffer.
pub fn encode_glb(vertices: &[Point3<f32>], faces: &[[u32; 3]]) -> Result<Vec<u8>> {
    if vertices.is_empty() {
        return Err(FaceForgeError::EmptyInput("glb vertices"));
    }

    let mut bin = Vec::with_capacity(vertices.len() * 12 + faces.len() * 12);
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];
    for v in vertices {
        for (axis, &c) in [v.x, v.y, v.z].iter().enumerate() {
            min[axis] = min[axis].min(c);
            max[axis] = max[axis].max(c);
            bin.extend_from_slice(&c.to_le_bytes());
        }
    }
    let positions_len = bin.len();

    for face in faces {
        for &i in face {
            if i as usize >= vertices.len() {
                return Err(FaceForgeError::InputInvalid(format!(
                    "face index {} out of range",
                    i
                )));
            }
            bin.extend_from_slice(&i.to_le_bytes());
        }
    }
    let indices_len = bin.len() - positions_len;
    while bin.len() % 4 != 0 {
        bin.push(0);
    }

    let gltf = json!({
        "asset": { "version": "2.0", "generator": "face-forge" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0 }],
        "meshes": [{
            "primitives": [{
                "attributes": { "POSITION": 0 },
                "indices": 1,
                "mode": 4
            }]
        }],
        "buffers": [{ "byteLength": bin.len() }],
        "bufferViews": [
            {
                "buffer": 0,
                "byteOffset": 0,
                "byteLength": positions_len,
                "target": 34962
            },
            {
                "buffer": 0,
                "byteOffset": positions_len,
                "byteLength": indices_len,
                "target": 34963
            }
        ],
        "accessors": [
            {
                "bufferView": 0,
                "componentType": 5126,
                "count": vertices.len(),
                "type": "VEC3",
                "min": min,
                "max": max
            },
            {
                "bufferView": 1,
                "componentType": 5125,
                "count": faces.len() * 3,
                "type": "SCALAR"
            }
        ]
    });

    let mut json_bytes = serde_json::to_vec(&gltf)?;
    while json_bytes.len() % 4 != 0 {
        json_bytes.push(b' ');
    }

    let total = 12 + 8 + json_bytes.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());

    out.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_bytes);

    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);

    Ok(out)
}

/// Write the mesh as a GLB file.
pub fn write_glb<P: AsRef<Path>>(
    path: P,
    vertices: &[Point3<f32>],
    faces: &[[u32; 3]],
) -> Result<()> {
    let bytes = encode_glb(vertices, faces)?;
    let mut file = File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}
