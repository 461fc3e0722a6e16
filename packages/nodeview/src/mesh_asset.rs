//! Mesh asset decoding and coloring.
//!
//! Node models are served as STL (binary or ASCII); OBJ is accepted as well.
//! Decoded geometry is flattened into [`Vertex`] records ready for GPU upload.
//!
//! ## Coloring
//!
//! A node may carry a color hint, in which case every vertex gets that color.
//! Without one, vertices are colored from their normals (`n * 0.5 + 0.5`), the
//! usual debug-normal look.

use std::collections::HashMap;
use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    #[error("unsupported model format `{0}`")]
    UnsupportedFormat(String),
    #[error("malformed STL: {0}")]
    Stl(String),
    #[error("malformed OBJ: {0}")]
    Obj(String),
    #[error("model contains no triangles")]
    Empty,
}

/// Interleaved vertex layout: position, normal, color.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 4],
}

impl Vertex {
    pub const fn new(position: [f32; 3], normal: [f32; 3], color: [f32; 4]) -> Self {
        Self {
            position,
            normal,
            color,
        }
    }
}

/// Axis-aligned bounding box for a mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl BoundingBox {
    /// Compute bounding box from a set of vertices.
    pub fn from_vertices(vertices: &[Vertex]) -> Self {
        if vertices.is_empty() {
            return Self::default();
        }

        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];

        for v in vertices {
            for i in 0..3 {
                min[i] = min[i].min(v.position[i]);
                max[i] = max[i].max(v.position[i]);
            }
        }

        Self { min, max }
    }

    pub fn center(&self) -> [f32; 3] {
        [
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
            (self.min[2] + self.max[2]) / 2.0,
        ]
    }

    pub fn size(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

/// Display color hint sent with a node record.
///
/// Accepts `"#rgb"`, `"#rrggbb"`, `"#rrggbbaa"`, a handful of color names, or
/// an `[r, g, b]` / `[r, g, b, a]` array with components in 0..1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColorHint {
    Name(String),
    Components(Vec<f32>),
}

impl ColorHint {
    /// Resolve to RGBA, or `None` if the hint is not understood.
    pub fn rgba(&self) -> Option<[f32; 4]> {
        match self {
            ColorHint::Name(name) => parse_color_name(name),
            ColorHint::Components(c) => match c.as_slice() {
                [r, g, b] => Some([*r, *g, *b, 1.0]),
                [r, g, b, a] => Some([*r, *g, *b, *a]),
                _ => None,
            },
        }
    }
}

fn parse_color_name(name: &str) -> Option<[f32; 4]> {
    let name = name.trim();
    if let Some(hex) = name.strip_prefix('#') {
        return parse_hex(hex);
    }
    let rgb = match name.to_ascii_lowercase().as_str() {
        "red" => [1.0, 0.0, 0.0],
        "green" => [0.0, 0.5, 0.0],
        "lime" => [0.0, 1.0, 0.0],
        "blue" => [0.0, 0.0, 1.0],
        "yellow" => [1.0, 1.0, 0.0],
        "cyan" | "aqua" => [0.0, 1.0, 1.0],
        "magenta" | "fuchsia" => [1.0, 0.0, 1.0],
        "orange" => [1.0, 0.647, 0.0],
        "purple" => [0.5, 0.0, 0.5],
        "white" => [1.0, 1.0, 1.0],
        "black" => [0.0, 0.0, 0.0],
        "gray" | "grey" => [0.5, 0.5, 0.5],
        "silver" => [0.75, 0.75, 0.75],
        _ => return None,
    };
    Some([rgb[0], rgb[1], rgb[2], 1.0])
}

fn parse_hex(hex: &str) -> Option<[f32; 4]> {
    if !hex.is_ascii() {
        return None;
    }
    let channel = |s: &str| u8::from_str_radix(s, 16).ok().map(|v| v as f32 / 255.0);
    match hex.len() {
        3 => {
            let mut rgb = [0.0; 3];
            for (i, c) in hex.chars().enumerate() {
                rgb[i] = channel(&format!("{c}{c}"))?;
            }
            Some([rgb[0], rgb[1], rgb[2], 1.0])
        }
        6 | 8 => {
            let r = channel(&hex[0..2])?;
            let g = channel(&hex[2..4])?;
            let b = channel(&hex[4..6])?;
            let a = if hex.len() == 8 { channel(&hex[6..8])? } else { 1.0 };
            Some([r, g, b, a])
        }
        _ => None,
    }
}

/// How to color a freshly decoded mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coloring {
    Solid([f32; 4]),
    DebugNormals,
}

impl Coloring {
    /// The coloring for an optional hint; unknown hints fall back to debug normals.
    pub fn from_hint(hint: Option<&ColorHint>) -> Self {
        match hint.and_then(ColorHint::rgba) {
            Some(rgba) => Coloring::Solid(rgba),
            None => Coloring::DebugNormals,
        }
    }

    fn color_for(&self, normal: [f32; 3]) -> [f32; 4] {
        match self {
            Coloring::Solid(rgba) => *rgba,
            Coloring::DebugNormals => [
                normal[0] * 0.5 + 0.5,
                normal[1] * 0.5 + 0.5,
                normal[2] * 0.5 + 0.5,
                1.0,
            ],
        }
    }
}

/// A decoded mesh ready for rendering.
#[derive(Debug, Clone)]
pub struct MeshAsset {
    pub id: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub bounds: BoundingBox,
}

impl MeshAsset {
    pub fn new(id: String, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let bounds = BoundingBox::from_vertices(&vertices);
        Self {
            id,
            vertices,
            indices,
            bounds,
        }
    }

    /// Build an unindexed mesh from triangles, using face normals.
    pub fn from_triangles(id: &str, triangles: &[[[f32; 3]; 3]]) -> Self {
        let facets: Vec<([f32; 3], [[f32; 3]; 3])> = triangles
            .iter()
            .map(|tri| (face_normal(tri), *tri))
            .collect();
        Self::from_facets(id, &facets)
    }

    fn from_facets(id: &str, facets: &[([f32; 3], [[f32; 3]; 3])]) -> Self {
        let mut vertices = Vec::with_capacity(facets.len() * 3);
        for (normal, corners) in facets {
            // STL writers frequently leave the stored normal zeroed.
            let normal = if normal.iter().all(|c| *c == 0.0) {
                face_normal(corners)
            } else {
                *normal
            };
            for corner in corners {
                vertices.push(Vertex::new(*corner, normal, [1.0; 4]));
            }
        }
        let indices = (0..vertices.len() as u32).collect();
        let mut asset = Self::new(id.to_string(), vertices, indices);
        asset.apply_coloring(Coloring::DebugNormals);
        asset
    }

    /// Parse STL content, detecting binary versus ASCII.
    pub fn from_stl(id: &str, bytes: &[u8]) -> Result<Self, MeshError> {
        let facets = if is_binary_stl(bytes) {
            parse_binary_stl(bytes)?
        } else if bytes.trim_ascii_start().starts_with(b"solid") {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| MeshError::Stl("ASCII STL is not valid UTF-8".to_string()))?;
            parse_ascii_stl(text)?
        } else {
            return Err(MeshError::Stl("neither binary nor ASCII STL".to_string()));
        };

        if facets.is_empty() {
            return Err(MeshError::Empty);
        }
        Ok(Self::from_facets(id, &facets))
    }

    /// Parse OBJ content. Normals are used when present, otherwise computed.
    pub fn from_obj(id: &str, obj_content: &str) -> Result<Self, MeshError> {
        let mut cursor = std::io::Cursor::new(obj_content.as_bytes());

        let load_options = tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        };

        let (models, _materials) =
            tobj::load_obj_buf(&mut cursor, &load_options, |_| Ok((vec![], HashMap::new())))
                .map_err(|e| MeshError::Obj(e.to_string()))?;

        let mut positions: Vec<[f32; 3]> = Vec::new();
        let mut normals: Vec<[f32; 3]> = Vec::new();
        let mut indices: Vec<u32> = Vec::new();
        let mut has_normals = true;

        for model in &models {
            let mesh = &model.mesh;
            if mesh.positions.is_empty() {
                continue;
            }

            let offset = positions.len() as u32;
            let vertex_count = mesh.positions.len() / 3;
            let model_has_normals = mesh.normals.len() == mesh.positions.len();
            has_normals &= model_has_normals;

            for i in 0..vertex_count {
                positions.push([
                    mesh.positions[i * 3],
                    mesh.positions[i * 3 + 1],
                    mesh.positions[i * 3 + 2],
                ]);
                if model_has_normals {
                    normals.push([
                        mesh.normals[i * 3],
                        mesh.normals[i * 3 + 1],
                        mesh.normals[i * 3 + 2],
                    ]);
                }
            }
            indices.extend(mesh.indices.iter().map(|idx| offset + idx));
        }

        if positions.is_empty() || indices.is_empty() {
            return Err(MeshError::Empty);
        }

        if !has_normals || normals.len() != positions.len() {
            normals = compute_vertex_normals(&positions, &indices);
        }

        let vertices = positions
            .iter()
            .zip(&normals)
            .map(|(p, n)| Vertex::new(*p, *n, [1.0; 4]))
            .collect();
        let mut asset = Self::new(id.to_string(), vertices, indices);
        asset.apply_coloring(Coloring::DebugNormals);
        Ok(asset)
    }

    pub fn apply_coloring(&mut self, coloring: Coloring) {
        for v in &mut self.vertices {
            v.color = coloring.color_for(v.normal);
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Raw vertex bytes for GPU upload.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }
}

/// Decoder seam for model payloads.
pub trait MeshDecoder {
    fn decode(&self, id: &str, bytes: &[u8]) -> Result<MeshAsset, MeshError>;
}

pub struct StlDecoder;

impl MeshDecoder for StlDecoder {
    fn decode(&self, id: &str, bytes: &[u8]) -> Result<MeshAsset, MeshError> {
        MeshAsset::from_stl(id, bytes)
    }
}

pub struct ObjDecoder;

impl MeshDecoder for ObjDecoder {
    fn decode(&self, id: &str, bytes: &[u8]) -> Result<MeshAsset, MeshError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| MeshError::Obj("OBJ is not valid UTF-8".to_string()))?;
        MeshAsset::from_obj(id, text)
    }
}

/// Pick a decoder from the model file name's extension.
pub fn decoder_for(model: &str) -> Result<&'static dyn MeshDecoder, MeshError> {
    let extension = model
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "stl" => Ok(&StlDecoder),
        "obj" => Ok(&ObjDecoder),
        _ => Err(MeshError::UnsupportedFormat(model.to_string())),
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.size();
        write!(f, "{:.2} x {:.2} x {:.2}", x, y, z)
    }
}

// === STL ===

const STL_HEADER_LEN: usize = 80;
const STL_FACET_LEN: usize = 50;

fn is_binary_stl(bytes: &[u8]) -> bool {
    if bytes.len() < STL_HEADER_LEN + 4 {
        return false;
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    // Binary files may also start with "solid", so the length is the real test.
    count
        .checked_mul(STL_FACET_LEN)
        .and_then(|body| body.checked_add(STL_HEADER_LEN + 4))
        .is_some_and(|expected| bytes.len() == expected)
}

fn parse_binary_stl(bytes: &[u8]) -> Result<Vec<([f32; 3], [[f32; 3]; 3])>, MeshError> {
    let body = &bytes[STL_HEADER_LEN + 4..];
    let read_vec = |chunk: &[u8]| -> [f32; 3] {
        let f = |i: usize| f32::from_le_bytes([chunk[i], chunk[i + 1], chunk[i + 2], chunk[i + 3]]);
        [f(0), f(4), f(8)]
    };

    let facets = body
        .chunks_exact(STL_FACET_LEN)
        .map(|facet| {
            (
                read_vec(&facet[0..12]),
                [
                    read_vec(&facet[12..24]),
                    read_vec(&facet[24..36]),
                    read_vec(&facet[36..48]),
                ],
            )
        })
        .collect();
    Ok(facets)
}

fn parse_ascii_stl(text: &str) -> Result<Vec<([f32; 3], [[f32; 3]; 3])>, MeshError> {
    let mut words = text.split_whitespace();
    let mut facets = Vec::new();
    let mut normal = [0.0; 3];
    let mut corners: Vec<[f32; 3]> = Vec::with_capacity(3);

    let read_triplet = |words: &mut std::str::SplitWhitespace, what: &str| {
        let mut out = [0.0f32; 3];
        for slot in &mut out {
            *slot = words
                .next()
                .and_then(|w| w.parse().ok())
                .ok_or_else(|| MeshError::Stl(format!("bad {} coordinates", what)))?;
        }
        Ok::<_, MeshError>(out)
    };

    while let Some(word) = words.next() {
        match word {
            "normal" => normal = read_triplet(&mut words, "normal")?,
            "vertex" => corners.push(read_triplet(&mut words, "vertex")?),
            "endfacet" => {
                let [a, b, c] = corners[..] else {
                    return Err(MeshError::Stl(format!(
                        "facet {} has {} vertices",
                        facets.len(),
                        corners.len()
                    )));
                };
                facets.push((normal, [a, b, c]));
                corners.clear();
                normal = [0.0; 3];
            }
            _ => {}
        }
    }
    Ok(facets)
}

fn face_normal(tri: &[[f32; 3]; 3]) -> [f32; 3] {
    let [p0, p1, p2] = tri;
    let e1 = [p1[0] - p0[0], p1[1] - p0[1], p1[2] - p0[2]];
    let e2 = [p2[0] - p0[0], p2[1] - p0[1], p2[2] - p0[2]];
    normalize([
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ])
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if len > 1e-6 {
        [v[0] / len, v[1] / len, v[2] / len]
    } else {
        // Degenerate normal, use Z-up as fallback
        [0.0, 0.0, 1.0]
    }
}

/// Compute area-weighted vertex normals from face normals.
fn compute_vertex_normals(positions: &[[f32; 3]], indices: &[u32]) -> Vec<[f32; 3]> {
    let mut normals = vec![[0.0f32; 3]; positions.len()];

    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        if i0 >= positions.len() || i1 >= positions.len() || i2 >= positions.len() {
            continue;
        }

        let (p0, p1, p2) = (positions[i0], positions[i1], positions[i2]);
        let e1 = [p1[0] - p0[0], p1[1] - p0[1], p1[2] - p0[2]];
        let e2 = [p2[0] - p0[0], p2[1] - p0[1], p2[2] - p0[2]];

        // Unnormalized cross product, magnitude = 2 * triangle area
        let face = [
            e1[1] * e2[2] - e1[2] * e2[1],
            e1[2] * e2[0] - e1[0] * e2[2],
            e1[0] * e2[1] - e1[1] * e2[0],
        ];

        for idx in [i0, i1, i2] {
            for k in 0..3 {
                normals[idx][k] += face[k];
            }
        }
    }

    normals.into_iter().map(normalize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_stl(triangles: &[[[f32; 3]; 3]]) -> Vec<u8> {
        let mut bytes = vec![0u8; STL_HEADER_LEN];
        bytes[..5].copy_from_slice(b"solid");
        bytes.extend_from_slice(&(triangles.len() as u32).to_le_bytes());
        for tri in triangles {
            bytes.extend(std::iter::repeat(0u8).take(12));
            for corner in tri {
                for c in corner {
                    bytes.extend_from_slice(&c.to_le_bytes());
                }
            }
            bytes.extend_from_slice(&[0, 0]);
        }
        bytes
    }

    const TRIANGLE: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];

    #[test]
    fn test_binary_stl_starting_with_solid() {
        let bytes = binary_stl(&[TRIANGLE, TRIANGLE]);
        let asset = MeshAsset::from_stl("part", &bytes).unwrap();
        assert_eq!(asset.triangle_count(), 2);
        assert_eq!(asset.vertices.len(), 6);
        // Zeroed normals are recomputed from the winding order.
        assert_eq!(asset.vertices[0].normal, [0.0, 0.0, 1.0]);
        assert_eq!(asset.bounds.max, [1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_huge_facet_count_is_not_binary() {
        let mut bytes = binary_stl(&[TRIANGLE]);
        bytes[80..84].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(!is_binary_stl(&bytes));
        assert!(MeshAsset::from_stl("part", &bytes).is_err());
    }

    #[test]
    fn test_ascii_stl() {
        let text = "solid part\n facet normal 0 0 1\n  outer loop\n   vertex 0 0 0\n   vertex 2 0 0\n   vertex 0 3 0\n  endloop\n endfacet\nendsolid part\n";
        let asset = MeshAsset::from_stl("part", text.as_bytes()).unwrap();
        assert_eq!(asset.triangle_count(), 1);
        assert_eq!(asset.bounds.size(), [2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_malformed_stl() {
        assert!(MeshAsset::from_stl("x", b"not a mesh").is_err());
        let text = "solid x\nfacet normal 0 0 1\nouter loop\nvertex 0 0 0\nendloop\nendfacet\nendsolid";
        assert!(matches!(MeshAsset::from_stl("x", text.as_bytes()), Err(MeshError::Stl(_))));
        assert_eq!(MeshAsset::from_stl("x", b"solid empty\nendsolid empty").unwrap_err(), MeshError::Empty);
    }

    #[test]
    fn test_obj_parsing() {
        let obj_content = "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3";
        let asset = MeshAsset::from_obj("test", obj_content).unwrap();
        assert_eq!(asset.vertices.len(), 3);
        assert_eq!(asset.triangle_count(), 1);
        assert_eq!(asset.vertices[0].normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_coloring() {
        let mut asset = MeshAsset::from_triangles("tri", &[TRIANGLE]);
        // Debug normals: +Z maps to (0.5, 0.5, 1.0)
        assert_eq!(asset.vertices[0].color, [0.5, 0.5, 1.0, 1.0]);

        let hint = ColorHint::Name("#ff000080".to_string());
        asset.apply_coloring(Coloring::from_hint(Some(&hint)));
        assert_eq!(asset.vertices[2].color[0], 1.0);
        assert!((asset.vertices[2].color[3] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_color_hints() {
        assert_eq!(ColorHint::Name("#0f0".into()).rgba(), Some([0.0, 1.0, 0.0, 1.0]));
        assert_eq!(ColorHint::Name("Blue".into()).rgba(), Some([0.0, 0.0, 1.0, 1.0]));
        assert_eq!(ColorHint::Components(vec![0.1, 0.2, 0.3]).rgba(), Some([0.1, 0.2, 0.3, 1.0]));
        assert_eq!(ColorHint::Name("#12345".into()).rgba(), None);
        assert_eq!(Coloring::from_hint(Some(&ColorHint::Name("mauve-ish".into()))), Coloring::DebugNormals);

        let parsed: ColorHint = serde_json::from_str("[1, 0.5, 0]").unwrap();
        assert_eq!(parsed.rgba(), Some([1.0, 0.5, 0.0, 1.0]));
    }

    #[test]
    fn test_decoder_by_extension() {
        assert!(decoder_for("part.STL").is_ok());
        assert!(decoder_for("part.obj").is_ok());
        assert!(matches!(decoder_for("part.3mf"), Err(MeshError::UnsupportedFormat(_))));
    }
}
