use std::collections::{HashMap, HashSet};

use glam::DVec3;

use crate::csg;
use crate::solid::Solid;

/// Incremental 3D convex hull of a point cloud. Fails on clouds with no
/// volume (fewer than four non-coplanar points).
pub fn convex_hull(points: &[[f32; 3]]) -> Result<Solid, String> {
    let points = unique_points(points);
    if points.len() < 4 {
        return Err("convex hull needs at least four distinct points".to_string());
    }
    let scale = points
        .iter()
        .fold(0.0f64, |acc, p| acc.max(p.abs().max_element()))
        .max(1.0);
    let eps = 1.0e-9 * scale;

    let seed = initial_tetrahedron(&points, eps)?;
    let mut faces: Vec<[usize; 3]> = Vec::new();
    let interior = (points[seed[0]] + points[seed[1]] + points[seed[2]] + points[seed[3]]) / 4.0;
    for [a, b, c] in [
        [seed[0], seed[1], seed[2]],
        [seed[0], seed[3], seed[1]],
        [seed[1], seed[3], seed[2]],
        [seed[2], seed[3], seed[0]],
    ] {
        let normal = face_normal(&points, [a, b, c]);
        if normal.dot(points[a] - interior) < 0.0 {
            faces.push([a, c, b]);
        } else {
            faces.push([a, b, c]);
        }
    }

    for (index, point) in points.iter().enumerate() {
        if seed.contains(&index) {
            continue;
        }
        let visible: Vec<bool> = faces
            .iter()
            .map(|face| face_normal(&points, *face).dot(*point - points[face[0]]) > eps)
            .collect();
        if !visible.iter().any(|v| *v) {
            continue;
        }

        let mut visible_edges = HashSet::new();
        for (face, _) in faces.iter().zip(&visible).filter(|(_, v)| **v) {
            for edge in face_edges(*face) {
                visible_edges.insert(edge);
            }
        }
        let horizon: Vec<(usize, usize)> = visible_edges
            .iter()
            .filter(|(a, b)| !visible_edges.contains(&(*b, *a)))
            .copied()
            .collect();

        let mut kept: Vec<[usize; 3]> = faces
            .iter()
            .zip(&visible)
            .filter(|(_, v)| !**v)
            .map(|(face, _)| *face)
            .collect();
        for (a, b) in horizon {
            kept.push([a, b, index]);
        }
        faces = kept;
    }

    Ok(compact(&points, &faces))
}

/// Union of the hulls of each consecutive pair of point clouds.
pub fn hull_chain(clouds: &[Vec<[f32; 3]>]) -> Result<Option<Solid>, String> {
    match clouds {
        [] => Ok(None),
        [single] => convex_hull(single).map(Some),
        _ => {
            let mut hulls = Vec::with_capacity(clouds.len() - 1);
            for pair in clouds.windows(2) {
                let mut points = pair[0].clone();
                points.extend_from_slice(&pair[1]);
                hulls.push(convex_hull(&points)?);
            }
            csg::union_all(&hulls)
        }
    }
}

fn unique_points(points: &[[f32; 3]]) -> Vec<DVec3> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for p in points {
        let key = (p[0].to_bits(), p[1].to_bits(), p[2].to_bits());
        if seen.insert(key) {
            out.push(DVec3::new(p[0] as f64, p[1] as f64, p[2] as f64));
        }
    }
    out
}

fn initial_tetrahedron(points: &[DVec3], eps: f64) -> Result<[usize; 4], String> {
    let p0 = 0;
    let p1 = farthest(points, |p| (p - points[p0]).length_squared());
    let axis = points[p1] - points[p0];
    if axis.length_squared() <= eps * eps {
        return Err("convex hull input is a single point".to_string());
    }
    let p2 = farthest(points, |p| axis.cross(p - points[p0]).length_squared());
    let normal = axis.cross(points[p2] - points[p0]);
    if normal.length_squared() <= eps * eps {
        return Err("convex hull input is collinear".to_string());
    }
    let p3 = farthest(points, |p| normal.dot(p - points[p0]).abs());
    if normal.normalize().dot(points[p3] - points[p0]).abs() <= eps {
        return Err("convex hull input is coplanar".to_string());
    }
    Ok([p0, p1, p2, p3])
}

fn farthest(points: &[DVec3], metric: impl Fn(DVec3) -> f64) -> usize {
    let mut best = 0;
    let mut best_value = f64::MIN;
    for (index, point) in points.iter().enumerate() {
        let value = metric(*point);
        if value > best_value {
            best = index;
            best_value = value;
        }
    }
    best
}

fn face_normal(points: &[DVec3], face: [usize; 3]) -> DVec3 {
    let [a, b, c] = face;
    (points[b] - points[a])
        .cross(points[c] - points[a])
        .normalize_or_zero()
}

fn face_edges(face: [usize; 3]) -> [(usize, usize); 3] {
    [(face[0], face[1]), (face[1], face[2]), (face[2], face[0])]
}

fn compact(points: &[DVec3], faces: &[[usize; 3]]) -> Solid {
    let mut remap: HashMap<usize, u32> = HashMap::new();
    let mut positions = Vec::new();
    let mut indices = Vec::with_capacity(faces.len() * 3);
    for face in faces {
        for index in face {
            let mapped = *remap.entry(*index).or_insert_with(|| {
                positions.push(points[*index].as_vec3().to_array());
                (positions.len() - 1) as u32
            });
            indices.push(mapped);
        }
    }
    Solid::with_positions_indices(positions, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solid::unit_cube;

    #[test]
    fn hull_of_cube_corners_is_the_cube() {
        let cube = unit_cube([0.0; 3], [2.0; 3]);
        let mut points = cube.positions.clone();
        points.push([0.0, 0.0, 0.0]);
        points.push([0.5, 0.2, -0.3]);
        let hull = convex_hull(&points).expect("hull");
        assert!(hull.is_closed());
        assert_eq!(hull.positions.len(), 8);
        assert!((hull.signed_volume() - 8.0).abs() < 1.0e-4);
    }

    #[test]
    fn flat_input_is_rejected() {
        let points = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
        ];
        assert!(convex_hull(&points).is_err());
    }

    #[test]
    fn chain_of_one_cloud_is_its_hull() {
        let cube = unit_cube([0.0; 3], [1.0; 3]);
        let hull = hull_chain(&[cube.positions.clone()])
            .expect("chain")
            .expect("solid");
        assert!((hull.signed_volume() - 1.0).abs() < 1.0e-4);
        assert_eq!(hull_chain(&[]).expect("chain"), None);
    }
}
