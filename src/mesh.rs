//! Iso-surface extraction and binary glTF export.
//!
//! The reconstruction model produces an implicit density field; this module
//! turns a sampled grid of that field into an indexed triangle mesh (surface
//! nets: one vertex per sign-changing cell, quads across sign-changing grid
//! edges) and serializes the result as a self-contained GLB byte stream.

use serde_json::json;

const GLB_MAGIC: u32 = 0x4654_6C67;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

/// Indexed triangle mesh in the `[-1, 1]^3` reconstruction volume.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Drop degenerate triangles and compact away unreferenced vertices.
    pub fn cleanup(&mut self) {
        let mut kept = Vec::with_capacity(self.indices.len());
        for tri in self.indices.chunks_exact(3) {
            let (a, b, c) = (tri[0], tri[1], tri[2]);
            if a == b || b == c || a == c {
                continue;
            }
            let area_sq = triangle_area_sq(
                self.positions[a as usize],
                self.positions[b as usize],
                self.positions[c as usize],
            );
            if area_sq <= f32::EPSILON {
                continue;
            }
            kept.extend_from_slice(tri);
        }
        self.indices = kept;

        let mut remap = vec![u32::MAX; self.positions.len()];
        let mut packed = Vec::new();
        for index in &mut self.indices {
            let slot = &mut remap[*index as usize];
            if *slot == u32::MAX {
                *slot = packed.len() as u32;
                packed.push(self.positions[*index as usize]);
            }
            *index = *slot;
        }
        self.positions = packed;
    }

    fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        if self.positions.is_empty() {
            return ([0.0; 3], [0.0; 3]);
        }
        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];
        for p in &self.positions {
            for k in 0..3 {
                min[k] = min[k].min(p[k]);
                max[k] = max[k].max(p[k]);
            }
        }
        (min, max)
    }

    /// Serialize as binary glTF: a 12-byte header, a JSON chunk describing
    /// one POSITION/indices primitive, and a BIN chunk with the packed
    /// vertex and index data.
    pub fn to_glb(&self) -> Vec<u8> {
        let mut bin = Vec::with_capacity(self.positions.len() * 12 + self.indices.len() * 4);
        for p in &self.positions {
            for c in p {
                bin.extend_from_slice(&c.to_le_bytes());
            }
        }
        let pos_len = bin.len();
        for i in &self.indices {
            bin.extend_from_slice(&i.to_le_bytes());
        }
        let idx_len = bin.len() - pos_len;
        while bin.len() % 4 != 0 {
            bin.push(0);
        }

        let (min, max) = self.bounds();
        let document = json!({
            "asset": {"version": "2.0", "generator": "img2mesh"},
            "scene": 0,
            "scenes": [{"nodes": [0]}],
            "nodes": [{"mesh": 0}],
            "meshes": [{"primitives": [{"attributes": {"POSITION": 0}, "indices": 1, "mode": 4}]}],
            "accessors": [
                {
                    "bufferView": 0,
                    "componentType": 5126,
                    "count": self.positions.len(),
                    "type": "VEC3",
                    "min": min,
                    "max": max
                },
                {
                    "bufferView": 1,
                    "componentType": 5125,
                    "count": self.indices.len(),
                    "type": "SCALAR"
                }
            ],
            "bufferViews": [
                {"buffer": 0, "byteOffset": 0, "byteLength": pos_len, "target": 34962},
                {"buffer": 0, "byteOffset": pos_len, "byteLength": idx_len, "target": 34963}
            ],
            "buffers": [{"byteLength": bin.len()}]
        });
        let mut json_bytes = serde_json::to_vec(&document).expect("glTF JSON encoding");
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
        out
    }
}

fn triangle_area_sq(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> f32 {
    let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let n = [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ];
    (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]) * 0.25
}

// Corner order: bit 0 = x, bit 1 = y, bit 2 = z.
const CORNERS: [(usize, usize, usize); 8] = [
    (0, 0, 0),
    (1, 0, 0),
    (0, 1, 0),
    (1, 1, 0),
    (0, 0, 1),
    (1, 0, 1),
    (0, 1, 1),
    (1, 1, 1),
];

const EDGES: [(usize, usize); 12] = [
    (0, 1),
    (2, 3),
    (4, 5),
    (6, 7),
    (0, 2),
    (1, 3),
    (4, 6),
    (5, 7),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

/// Extract the `density > threshold` surface from a `res^3` grid sampled
/// over `[-1, 1]^3` with index layout `(x * res + y) * res + z`.
///
/// A degenerate field (entirely inside or entirely outside) yields an empty
/// mesh rather than an error.
pub fn extract_isosurface(density: &[f32], res: usize, threshold: f32) -> Mesh {
    debug_assert_eq!(density.len(), res * res * res);
    let sample = |x: usize, y: usize, z: usize| density[(x * res + y) * res + z];
    let coord = |i: usize| 2.0 * i as f32 / (res - 1) as f32 - 1.0;
    let inside = |v: f32| v > threshold;

    let cells = res - 1;
    let cell_idx = |x: usize, y: usize, z: usize| (x * cells + y) * cells + z;
    let mut cell_vertex = vec![u32::MAX; cells * cells * cells];
    let mut mesh = Mesh::default();

    // One vertex per cell with a sign change: the mean of its edge crossings.
    for x in 0..cells {
        for y in 0..cells {
            for z in 0..cells {
                let d: [f32; 8] = core::array::from_fn(|i| {
                    let (dx, dy, dz) = CORNERS[i];
                    sample(x + dx, y + dy, z + dz)
                });
                let inside_count = d.iter().filter(|&&v| inside(v)).count();
                if inside_count == 0 || inside_count == 8 {
                    continue;
                }

                let mut acc = [0.0f32; 3];
                let mut crossings = 0u32;
                for &(a, b) in &EDGES {
                    if inside(d[a]) == inside(d[b]) {
                        continue;
                    }
                    let t = (threshold - d[a]) / (d[b] - d[a]);
                    let (ax, ay, az) = CORNERS[a];
                    let (bx, by, bz) = CORNERS[b];
                    let pa = [coord(x + ax), coord(y + ay), coord(z + az)];
                    let pb = [coord(x + bx), coord(y + by), coord(z + bz)];
                    for k in 0..3 {
                        acc[k] += pa[k] + t * (pb[k] - pa[k]);
                    }
                    crossings += 1;
                }

                cell_vertex[cell_idx(x, y, z)] = mesh.positions.len() as u32;
                let n = crossings as f32;
                mesh.positions.push([acc[0] / n, acc[1] / n, acc[2] / n]);
            }
        }
    }

    // One quad per interior grid edge that crosses the surface, connecting
    // the vertices of the four cells sharing that edge. Winding flips with
    // the side of the surface the edge start lies on.
    let push_quad = |indices: &mut Vec<u32>, q: [u32; 4], flip: bool| {
        if q.iter().any(|&v| v == u32::MAX) {
            return;
        }
        let [a, b, c, d] = if flip { [q[3], q[2], q[1], q[0]] } else { q };
        indices.extend_from_slice(&[a, b, c, a, c, d]);
    };

    for x in 0..res - 1 {
        for y in 1..res - 1 {
            for z in 1..res - 1 {
                let (d0, d1) = (sample(x, y, z), sample(x + 1, y, z));
                if inside(d0) == inside(d1) {
                    continue;
                }
                let q = [
                    cell_vertex[cell_idx(x, y - 1, z - 1)],
                    cell_vertex[cell_idx(x, y, z - 1)],
                    cell_vertex[cell_idx(x, y, z)],
                    cell_vertex[cell_idx(x, y - 1, z)],
                ];
                push_quad(&mut mesh.indices, q, inside(d1));
            }
        }
    }
    for y in 0..res - 1 {
        for z in 1..res - 1 {
            for x in 1..res - 1 {
                let (d0, d1) = (sample(x, y, z), sample(x, y + 1, z));
                if inside(d0) == inside(d1) {
                    continue;
                }
                let q = [
                    cell_vertex[cell_idx(x - 1, y, z - 1)],
                    cell_vertex[cell_idx(x - 1, y, z)],
                    cell_vertex[cell_idx(x, y, z)],
                    cell_vertex[cell_idx(x, y, z - 1)],
                ];
                push_quad(&mut mesh.indices, q, inside(d1));
            }
        }
    }
    for z in 0..res - 1 {
        for x in 1..res - 1 {
            for y in 1..res - 1 {
                let (d0, d1) = (sample(x, y, z), sample(x, y, z + 1));
                if inside(d0) == inside(d1) {
                    continue;
                }
                let q = [
                    cell_vertex[cell_idx(x - 1, y - 1, z)],
                    cell_vertex[cell_idx(x, y - 1, z)],
                    cell_vertex[cell_idx(x, y, z)],
                    cell_vertex[cell_idx(x - 1, y, z)],
                ];
                push_quad(&mut mesh.indices, q, inside(d1));
            }
        }
    }

    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere_field(res: usize, radius: f32) -> Vec<f32> {
        let coord = |i: usize| 2.0 * i as f32 / (res - 1) as f32 - 1.0;
        let mut field = Vec::with_capacity(res * res * res);
        for x in 0..res {
            for y in 0..res {
                for z in 0..res {
                    let (px, py, pz) = (coord(x), coord(y), coord(z));
                    let dist = (px * px + py * py + pz * pz).sqrt();
                    field.push(radius - dist);
                }
            }
        }
        field
    }

    #[test]
    fn sphere_field_produces_closed_mesh() {
        let res = 24;
        let mesh = extract_isosurface(&sphere_field(res, 0.6), res, 0.0);

        assert!(!mesh.is_empty());
        assert_eq!(mesh.indices.len() % 3, 0);
        for &i in &mesh.indices {
            assert!((i as usize) < mesh.positions.len());
        }
        for p in &mesh.positions {
            for &c in p {
                assert!((-1.0..=1.0).contains(&c));
            }
            // vertices sit near the iso-surface radius
            let dist = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
            assert!((dist - 0.6).abs() < 0.2, "vertex at distance {dist}");
        }
    }

    #[test]
    fn uniform_field_produces_empty_mesh() {
        let res = 8;
        let field = vec![1.0f32; res * res * res];
        assert!(extract_isosurface(&field, res, 0.0).is_empty());
    }

    #[test]
    fn cleanup_drops_degenerates_and_unused_vertices() {
        let mut mesh = Mesh {
            positions: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [9.0, 9.0, 9.0], // never referenced
            ],
            // one real triangle, one collapsed to a repeated index
            indices: vec![0, 1, 2, 0, 1, 1],
        };
        mesh.cleanup();

        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.positions.len(), 3);
    }

    #[test]
    fn glb_container_is_well_formed() {
        let res = 16;
        let mesh = extract_isosurface(&sphere_field(res, 0.5), res, 0.0);
        let glb = mesh.to_glb();

        assert_eq!(&glb[0..4], b"glTF");
        let version = u32::from_le_bytes(glb[4..8].try_into().unwrap());
        assert_eq!(version, 2);
        let total = u32::from_le_bytes(glb[8..12].try_into().unwrap());
        assert_eq!(total as usize, glb.len());
        let json_len = u32::from_le_bytes(glb[12..16].try_into().unwrap());
        assert_eq!(&glb[16..20], b"JSON");
        let json: serde_json::Value =
            serde_json::from_slice(&glb[20..20 + json_len as usize]).unwrap();
        assert_eq!(json["asset"]["version"], "2.0");
        assert_eq!(json["accessors"][0]["count"], mesh.positions.len());
    }

    #[test]
    fn empty_mesh_still_exports() {
        let glb = Mesh::default().to_glb();
        assert_eq!(&glb[0..4], b"glTF");
    }
}
