use std::collections::{BTreeMap, HashMap};

use glam::{Mat4, Vec3};
use solidtree_scene::{face_normal, MeshVertex, RenderMesh};

/// Indexed triangle solid. Colors are optional per triangle, with an
/// optional whole-solid color as the next fallback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Solid {
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
    pub colors: Option<Vec<[f32; 4]>>,
    pub color: Option<[f32; 4]>,
}

impl Solid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_positions_indices(positions: Vec<[f32; 3]>, indices: Vec<u32>) -> Self {
        Self {
            positions,
            indices,
            colors: None,
            color: None,
        }
    }

    pub fn with_color(mut self, color: [f32; 4]) -> Self {
        self.color = Some(color);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.indices.len() < 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn triangle(&self, index: usize) -> [Vec3; 3] {
        let base = index * 3;
        [
            Vec3::from(self.positions[self.indices[base] as usize]),
            Vec3::from(self.positions[self.indices[base + 1] as usize]),
            Vec3::from(self.positions[self.indices[base + 2] as usize]),
        ]
    }

    pub fn triangle_color(&self, index: usize) -> Option<[f32; 4]> {
        self.colors
            .as_ref()
            .and_then(|colors| colors.get(index).copied())
            .or(self.color)
    }

    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = Vec3::from(*self.positions.first()?);
        let (min, max) = self
            .positions
            .iter()
            .fold((first, first), |(min, max), p| {
                (min.min(Vec3::from(*p)), max.max(Vec3::from(*p)))
            });
        Some((min.to_array(), max.to_array()))
    }

    pub fn signed_volume(&self) -> f32 {
        let mut volume = 0.0f64;
        for tri in 0..self.triangle_count() {
            let [a, b, c] = self.triangle(tri);
            volume += a.as_dvec3().dot(b.as_dvec3().cross(c.as_dvec3()));
        }
        (volume / 6.0) as f32
    }

    /// True when every directed edge is matched by exactly one opposite edge.
    pub fn is_closed(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        let mut edges: HashMap<(u32, u32), i32> = HashMap::new();
        for tri in self.indices.chunks_exact(3) {
            for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
                *edges.entry((a, b)).or_insert(0) += 1;
            }
        }
        edges
            .iter()
            .all(|(&(a, b), &count)| count == 1 && edges.get(&(b, a)) == Some(&1))
    }

    /// Bakes a matrix into the positions. Winding is reversed when the
    /// matrix mirrors so faces keep pointing outward.
    pub fn transformed(&self, matrix: Mat4) -> Solid {
        let mut out = self.clone();
        for p in &mut out.positions {
            *p = matrix.transform_point3(Vec3::from(*p)).to_array();
        }
        if matrix.determinant() < 0.0 {
            out.flip_winding();
        }
        out
    }

    pub fn mirrored(&self, flip: Vec3) -> Solid {
        self.transformed(Mat4::from_scale(flip))
    }

    pub fn flip_winding(&mut self) {
        for tri in self.indices.chunks_exact_mut(3) {
            tri.swap(1, 2);
        }
    }

    /// Reorients every triangle when the solid encloses negative volume.
    pub fn orient_outward(&mut self) {
        if self.signed_volume() < 0.0 {
            self.flip_winding();
        }
    }

    /// Merges coincident vertices and drops triangles that collapse.
    pub fn welded(&self, tolerance: f32) -> Solid {
        let tolerance = if tolerance > 0.0 { tolerance } else { 1.0e-5 };
        let mut lookup: HashMap<(i64, i64, i64), u32> = HashMap::new();
        let mut remap = Vec::with_capacity(self.positions.len());
        let mut positions = Vec::new();
        for p in &self.positions {
            let key = quantize_position(*p, tolerance);
            let index = *lookup.entry(key).or_insert_with(|| {
                positions.push(*p);
                (positions.len() - 1) as u32
            });
            remap.push(index);
        }

        let mut indices = Vec::with_capacity(self.indices.len());
        let mut colors = self.colors.as_ref().map(|_| Vec::new());
        for (tri_index, tri) in self.indices.chunks_exact(3).enumerate() {
            let a = remap[tri[0] as usize];
            let b = remap[tri[1] as usize];
            let c = remap[tri[2] as usize];
            if a == b || b == c || a == c {
                continue;
            }
            indices.extend_from_slice(&[a, b, c]);
            if let (Some(out), Some(source)) = (colors.as_mut(), self.colors.as_ref()) {
                out.push(source.get(tri_index).copied().unwrap_or([1.0; 4]));
            }
        }

        Solid {
            positions,
            indices,
            colors,
            color: self.color,
        }
    }

    pub fn from_triangle_soup(soup: &[[f32; 3]], tolerance: f32) -> Solid {
        let usable = soup.len() - soup.len() % 3;
        let positions = soup[..usable].to_vec();
        let indices = (0..usable as u32).collect();
        Solid::with_positions_indices(positions, indices).welded(tolerance)
    }

    /// Concatenates solids. Per-triangle colors are kept when any input
    /// carries color information.
    pub fn merge(solids: &[&Solid]) -> Solid {
        let any_color = solids
            .iter()
            .any(|solid| solid.colors.is_some() || solid.color.is_some());
        let mut out = Solid::new();
        let mut colors = Vec::new();
        for solid in solids {
            let offset = out.positions.len() as u32;
            out.positions.extend_from_slice(&solid.positions);
            out.indices
                .extend(solid.indices.iter().map(|index| index + offset));
            if any_color {
                for tri in 0..solid.triangle_count() {
                    colors.push(solid.triangle_color(tri).unwrap_or([1.0; 4]));
                }
            }
        }
        if any_color {
            out.colors = Some(colors);
        }
        out
    }

    /// Flat-shaded triangle list. Color falls back from triangle to solid to
    /// the supplied fallback.
    pub fn to_render_mesh(&self, fallback: [f32; 4]) -> RenderMesh {
        let mut mesh = RenderMesh::new();
        mesh.vertices.reserve(self.indices.len());
        mesh.source_indices.reserve(self.indices.len());
        for tri in 0..self.triangle_count() {
            let [p0, p1, p2] = self.triangle(tri);
            let normal = face_normal(p0, p1, p2);
            let color = self.triangle_color(tri).unwrap_or(fallback);
            for corner in 0..3 {
                let index = self.indices[tri * 3 + corner];
                mesh.vertices.push(MeshVertex {
                    position: self.positions[index as usize],
                    normal,
                    color,
                });
                mesh.source_indices.push(index);
            }
        }
        mesh
    }
}

/// Symmetry key for the mirror cache. Flip components are snapped to
/// their sign so equivalent mirrors share one cached solid.
pub fn symmetry_key(flip: Vec3) -> [i8; 3] {
    let sign = |v: f32| if v < 0.0 { -1 } else { 1 };
    [sign(flip.x), sign(flip.y), sign(flip.z)]
}

/// Cache of derived mirror solids keyed by symmetry.
pub type MirrorCache = BTreeMap<[i8; 3], std::sync::Arc<Solid>>;

fn quantize_position(position: [f32; 3], epsilon: f32) -> (i64, i64, i64) {
    (
        (position[0] / epsilon).round() as i64,
        (position[1] / epsilon).round() as i64,
        (position[2] / epsilon).round() as i64,
    )
}

#[cfg(test)]
pub(crate) fn unit_cube(center: [f32; 3], size: [f32; 3]) -> Solid {
    let hx = size[0] * 0.5;
    let hy = size[1] * 0.5;
    let hz = size[2] * 0.5;
    let [cx, cy, cz] = center;
    let positions = vec![
        [cx - hx, cy - hy, cz - hz],
        [cx + hx, cy - hy, cz - hz],
        [cx + hx, cy + hy, cz - hz],
        [cx - hx, cy + hy, cz - hz],
        [cx - hx, cy - hy, cz + hz],
        [cx + hx, cy - hy, cz + hz],
        [cx + hx, cy + hy, cz + hz],
        [cx - hx, cy + hy, cz + hz],
    ];
    let indices = vec![
        0, 2, 1, 0, 3, 2, //
        4, 5, 6, 4, 6, 7, //
        0, 1, 5, 0, 5, 4, //
        2, 3, 7, 2, 7, 6, //
        1, 2, 6, 1, 6, 5, //
        3, 0, 4, 3, 4, 7, //
    ];
    Solid::with_positions_indices(positions, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_is_closed_with_unit_volume() {
        let cube = unit_cube([0.0; 3], [1.0; 3]);
        assert!(cube.is_closed());
        assert!((cube.signed_volume() - 1.0).abs() < 1.0e-5);
    }

    #[test]
    fn mirroring_keeps_volume_positive() {
        let cube = unit_cube([2.0, 0.0, 0.0], [1.0; 3]);
        let mirrored = cube.mirrored(Vec3::new(-1.0, 1.0, 1.0));
        assert!((mirrored.signed_volume() - 1.0).abs() < 1.0e-5);
        let (min, _) = mirrored.bounds().expect("bounds");
        assert!((min[0] + 2.5).abs() < 1.0e-5);
    }

    #[test]
    fn weld_collapses_soup_into_shared_vertices() {
        let cube = unit_cube([0.0; 3], [1.0; 3]);
        let soup: Vec<[f32; 3]> = cube
            .indices
            .iter()
            .map(|index| cube.positions[*index as usize])
            .collect();
        let welded = Solid::from_triangle_soup(&soup, 1.0e-5);
        assert_eq!(welded.positions.len(), 8);
        assert_eq!(welded.triangle_count(), 12);
        assert!(welded.is_closed());
    }

    #[test]
    fn render_colors_fall_back_in_order() {
        let mut cube = unit_cube([0.0; 3], [1.0; 3]);
        let white = cube.to_render_mesh([1.0; 4]);
        assert_eq!(white.vertices[0].color, [1.0; 4]);

        cube.color = Some([0.0, 0.0, 1.0, 1.0]);
        let blue = cube.to_render_mesh([1.0; 4]);
        assert_eq!(blue.vertices[0].color, [0.0, 0.0, 1.0, 1.0]);

        let mut colors = vec![[0.0, 0.0, 1.0, 1.0]; 12];
        colors[0] = [1.0, 0.0, 0.0, 1.0];
        cube.colors = Some(colors);
        let mixed = cube.to_render_mesh([1.0; 4]);
        assert_eq!(mixed.vertices[0].color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(mixed.vertices[3].color, [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn merge_keeps_colors_of_each_part() {
        let a = unit_cube([0.0; 3], [1.0; 3]).with_color([1.0, 0.0, 0.0, 1.0]);
        let b = unit_cube([3.0, 0.0, 0.0], [1.0; 3]).with_color([0.0, 1.0, 0.0, 1.0]);
        let merged = Solid::merge(&[&a, &b]);
        assert_eq!(merged.triangle_count(), 24);
        assert_eq!(merged.triangle_color(0), Some([1.0, 0.0, 0.0, 1.0]));
        assert_eq!(merged.triangle_color(12), Some([0.0, 1.0, 0.0, 1.0]));
    }

    #[test]
    fn symmetry_key_snaps_to_signs() {
        assert_eq!(symmetry_key(Vec3::new(-0.5, 2.0, 1.0)), [-1, 1, 1]);
    }
}
