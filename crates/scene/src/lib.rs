use std::sync::Arc;

use glam::{Mat4, Vec3};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 4],
}

/// Flat triangle list ready for upload. Every three vertices form one
/// triangle; `source_indices` maps each vertex back to the solid vertex it
/// was generated from so partial edits can patch the buffer in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderMesh {
    pub vertices: Vec<MeshVertex>,
    pub source_indices: Vec<u32>,
}

impl RenderMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        let first = self.vertices.first()?;
        let mut min = first.position;
        let mut max = first.position;
        for vertex in &self.vertices[1..] {
            for i in 0..3 {
                min[i] = min[i].min(vertex.position[i]);
                max[i] = max[i].max(vertex.position[i]);
            }
        }
        Some((min, max))
    }

    /// Recomputes the face normal of one triangle from its current positions.
    pub fn refresh_triangle_normal(&mut self, triangle: usize) {
        let base = triangle * 3;
        if base + 2 >= self.vertices.len() {
            return;
        }
        let p0 = Vec3::from(self.vertices[base].position);
        let p1 = Vec3::from(self.vertices[base + 1].position);
        let p2 = Vec3::from(self.vertices[base + 2].position);
        let normal = face_normal(p0, p1, p2);
        for vertex in &mut self.vertices[base..base + 3] {
            vertex.normal = normal;
        }
    }

    pub fn box_preview(min: [f32; 3], max: [f32; 3], color: [f32; 4]) -> Self {
        let corners = [
            [min[0], min[1], min[2]],
            [max[0], min[1], min[2]],
            [max[0], max[1], min[2]],
            [min[0], max[1], min[2]],
            [min[0], min[1], max[2]],
            [max[0], min[1], max[2]],
            [max[0], max[1], max[2]],
            [min[0], max[1], max[2]],
        ];
        let triangles: [[usize; 3]; 12] = [
            [0, 2, 1],
            [0, 3, 2],
            [4, 5, 6],
            [4, 6, 7],
            [0, 1, 5],
            [0, 5, 4],
            [2, 3, 7],
            [2, 7, 6],
            [1, 2, 6],
            [1, 6, 5],
            [3, 0, 4],
            [3, 4, 7],
        ];

        let mut mesh = RenderMesh::new();
        for tri in triangles {
            let p0 = Vec3::from(corners[tri[0]]);
            let p1 = Vec3::from(corners[tri[1]]);
            let p2 = Vec3::from(corners[tri[2]]);
            let normal = face_normal(p0, p1, p2);
            for &index in &tri {
                mesh.vertices.push(MeshVertex {
                    position: corners[index],
                    normal,
                    color,
                });
                mesh.source_indices.push(index as u32);
            }
        }
        mesh
    }
}

pub fn face_normal(p0: Vec3, p1: Vec3, p2: Vec3) -> [f32; 3] {
    let normal = (p1 - p0).cross(p2 - p0);
    if normal.length_squared() > 0.0 {
        normal.normalize().to_array()
    } else {
        [0.0, 1.0, 0.0]
    }
}

#[derive(Debug, Clone)]
pub struct SceneDrawable {
    pub node: u64,
    pub mesh: Arc<RenderMesh>,
    pub matrix: Mat4,
    pub opacity: f32,
    pub preview: bool,
}

#[derive(Debug, Clone)]
pub struct SceneSnapshot {
    pub drawables: Vec<SceneDrawable>,
    pub base_color: [f32; 3],
}

impl SceneSnapshot {
    pub fn new(base_color: [f32; 3]) -> Self {
        Self {
            drawables: Vec::new(),
            base_color,
        }
    }

    pub fn drawable(&self, node: u64) -> Option<&SceneDrawable> {
        self.drawables.iter().find(|drawable| drawable.node == node)
    }

    pub fn triangle_count(&self) -> usize {
        self.drawables
            .iter()
            .map(|drawable| drawable.mesh.triangle_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_preview_is_closed_triangle_list() {
        let mesh = RenderMesh::box_preview([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0], [1.0; 4]);
        assert_eq!(mesh.triangle_count(), 12);
        assert_eq!(mesh.source_indices.len(), mesh.vertices.len());
        let (min, max) = mesh.bounds().expect("bounds");
        assert_eq!(min, [-1.0, -1.0, -1.0]);
        assert_eq!(max, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn box_preview_normals_point_outward() {
        let mesh = RenderMesh::box_preview([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0], [1.0; 4]);
        for tri in mesh.vertices.chunks_exact(3) {
            let centroid = (Vec3::from(tri[0].position)
                + Vec3::from(tri[1].position)
                + Vec3::from(tri[2].position))
                / 3.0;
            assert!(Vec3::from(tri[0].normal).dot(centroid) > 0.0);
        }
    }

    #[test]
    fn bytes_cover_every_vertex() {
        let mesh = RenderMesh::box_preview([0.0; 3], [1.0; 3], [1.0; 4]);
        assert_eq!(
            mesh.as_bytes().len(),
            mesh.vertices.len() * std::mem::size_of::<MeshVertex>()
        );
    }

    #[test]
    fn refresh_normal_follows_moved_vertex() {
        let mut mesh = RenderMesh {
            vertices: vec![
                MeshVertex {
                    position: [0.0, 0.0, 0.0],
                    normal: [0.0; 3],
                    color: [1.0; 4],
                },
                MeshVertex {
                    position: [1.0, 0.0, 0.0],
                    normal: [0.0; 3],
                    color: [1.0; 4],
                },
                MeshVertex {
                    position: [0.0, 1.0, 0.0],
                    normal: [0.0; 3],
                    color: [1.0; 4],
                },
            ],
            source_indices: vec![0, 1, 2],
        };
        mesh.refresh_triangle_normal(0);
        assert!((mesh.vertices[0].normal[2] - 1.0).abs() < 1.0e-6);
    }
}
