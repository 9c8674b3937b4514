use boolmesh::prelude::{compute_boolean, Manifold, OpType};
use glam::Vec3;
use tracing::debug;

use crate::solid::Solid;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BooleanOp {
    Union,
    Subtract,
    Intersect,
}

/// Operations ordered run merging needs. Kept abstract so the merge order
/// can be checked without running mesh booleans.
pub trait Composable: Sized + Clone {
    fn union(&self, other: &Self) -> Result<Self, String>;
    fn subtract(&self, other: &Self) -> Result<Self, String>;
}

impl Composable for Solid {
    fn union(&self, other: &Self) -> Result<Self, String> {
        boolean(self, other, BooleanOp::Union)
    }

    fn subtract(&self, other: &Self) -> Result<Self, String> {
        boolean(self, other, BooleanOp::Subtract)
    }
}

/// Folds signed operands in sequence order. Each maximal run of equal sign
/// is unioned; additive runs are unioned into the accumulator and
/// subtractive runs are subtracted from it. A subtractive run with nothing
/// accumulated yet is dropped.
pub fn merge_runs<T: Composable>(operands: &[(bool, T)]) -> Result<Option<T>, String> {
    let mut accumulated: Option<T> = None;
    let mut index = 0;
    while index < operands.len() {
        let subtract = operands[index].0;
        let mut run = operands[index].1.clone();
        index += 1;
        while index < operands.len() && operands[index].0 == subtract {
            run = run.union(&operands[index].1)?;
            index += 1;
        }
        accumulated = match (accumulated, subtract) {
            (None, false) => Some(run),
            (Some(acc), false) => Some(acc.union(&run)?),
            (Some(acc), true) => Some(acc.subtract(&run)?),
            (None, true) => {
                debug!("discarding subtractive run with nothing to subtract from");
                None
            }
        };
    }
    Ok(accumulated)
}

pub fn intersect_all(solids: &[Solid]) -> Result<Option<Solid>, String> {
    let mut iter = solids.iter();
    let Some(first) = iter.next() else {
        return Ok(None);
    };
    let mut result = first.clone();
    for solid in iter {
        result = boolean(&result, solid, BooleanOp::Intersect)?;
    }
    Ok(Some(result))
}

pub fn union_all(solids: &[Solid]) -> Result<Option<Solid>, String> {
    let operands: Vec<(bool, Solid)> = solids.iter().map(|s| (false, s.clone())).collect();
    merge_runs(&operands)
}

pub fn boolean(a: &Solid, b: &Solid, op: BooleanOp) -> Result<Solid, String> {
    match op {
        BooleanOp::Union if b.is_empty() => return Ok(a.clone()),
        BooleanOp::Union if a.is_empty() => return Ok(b.clone()),
        BooleanOp::Subtract if a.is_empty() || b.is_empty() => return Ok(a.clone()),
        BooleanOp::Intersect if a.is_empty() || b.is_empty() => return Ok(Solid::new()),
        _ => {}
    }

    let op_type = match op {
        BooleanOp::Union => OpType::Add,
        BooleanOp::Subtract => OpType::Subtract,
        BooleanOp::Intersect => OpType::Intersect,
    };

    let pos_a = flatten_positions(a);
    let pos_b = flatten_positions(b);
    let idx_a = a.indices.iter().map(|i| *i as usize).collect::<Vec<_>>();
    let idx_b = b.indices.iter().map(|i| *i as usize).collect::<Vec<_>>();

    let manifold_a = Manifold::new(&pos_a, &idx_a)?;
    let manifold_b = Manifold::new(&pos_b, &idx_b)?;
    let manifold = compute_boolean(&manifold_a, &manifold_b, op_type)?;

    let mut positions = Vec::with_capacity(manifold.ps.len());
    for p in &manifold.ps {
        positions.push(p.to_array());
    }
    let indices = manifold
        .get_indices()
        .into_iter()
        .map(|idx| idx as u32)
        .collect::<Vec<_>>();
    let mut solid = Solid::with_positions_indices(positions, indices);
    transfer_colors(&mut solid, &[a, b]);
    Ok(solid)
}

fn flatten_positions(solid: &Solid) -> Vec<f64> {
    let mut flat = Vec::with_capacity(solid.positions.len() * 3);
    for p in &solid.positions {
        flat.push(p[0] as f64);
        flat.push(p[1] as f64);
        flat.push(p[2] as f64);
    }
    flat
}

struct SourceTriangles {
    triangles: Vec<[Vec3; 3]>,
    bounds: Vec<[Vec3; 2]>,
    colors: Vec<Option<[f32; 4]>>,
}

impl SourceTriangles {
    fn new(solid: &Solid) -> Self {
        let mut triangles = Vec::with_capacity(solid.triangle_count());
        let mut bounds = Vec::with_capacity(solid.triangle_count());
        let mut colors = Vec::with_capacity(solid.triangle_count());
        for tri in 0..solid.triangle_count() {
            let [a, b, c] = solid.triangle(tri);
            triangles.push([a, b, c]);
            bounds.push([a.min(b).min(c), a.max(b).max(c)]);
            colors.push(solid.triangle_color(tri));
        }
        Self {
            triangles,
            bounds,
            colors,
        }
    }
}

/// Gives each result triangle the color of the nearest source triangle.
fn transfer_colors(result: &mut Solid, sources: &[&Solid]) {
    if sources
        .iter()
        .all(|source| source.colors.is_none() && source.color.is_none())
    {
        return;
    }
    let sources = sources
        .iter()
        .map(|source| SourceTriangles::new(source))
        .collect::<Vec<_>>();
    let mut colors = Vec::with_capacity(result.triangle_count());
    for tri in 0..result.triangle_count() {
        let [a, b, c] = result.triangle(tri);
        let centroid = (a + b + c) / 3.0;
        let color = nearest_triangle(centroid, &sources)
            .and_then(|(source, index)| sources[source].colors[index])
            .unwrap_or([1.0; 4]);
        colors.push(color);
    }
    result.colors = Some(colors);
}

fn nearest_triangle(point: Vec3, sources: &[SourceTriangles]) -> Option<(usize, usize)> {
    let mut best: Option<((usize, usize), f32)> = None;
    for (source_idx, source) in sources.iter().enumerate() {
        for (tri_idx, tri) in source.triangles.iter().enumerate() {
            let bounds = source.bounds[tri_idx];
            let bound_dist = distance2_point_aabb(point, bounds[0], bounds[1]);
            if let Some((_, best_dist)) = best {
                if bound_dist >= best_dist {
                    continue;
                }
            }
            let closest = closest_point_on_triangle(point, tri[0], tri[1], tri[2]);
            let dist = (point - closest).length_squared();
            if best.map(|(_, best_dist)| dist < best_dist).unwrap_or(true) {
                best = Some(((source_idx, tri_idx), dist));
            }
        }
    }
    best.map(|(found, _)| found)
}

fn distance2_point_aabb(point: Vec3, min: Vec3, max: Vec3) -> f32 {
    let clamped = point.clamp(min, max);
    (point - clamped).length_squared()
}

fn closest_point_on_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    let ab = b - a;
    let ac = c - a;
    if ab.cross(ac).length_squared() <= 1.0e-12 {
        return [a, b, c]
            .into_iter()
            .min_by(|x, y| (p - *x).length_squared().total_cmp(&(p - *y).length_squared()))
            .unwrap_or(a);
    }

    let ap = p - a;
    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::solid::unit_cube;

    impl Composable for BTreeSet<i32> {
        fn union(&self, other: &Self) -> Result<Self, String> {
            Ok(self.union(other).copied().collect())
        }

        fn subtract(&self, other: &Self) -> Result<Self, String> {
            Ok(self.difference(other).copied().collect())
        }
    }

    fn set(values: &[i32]) -> BTreeSet<i32> {
        values.iter().copied().collect()
    }

    #[test]
    fn runs_merge_in_sequence_order() {
        let a = set(&[1, 2]);
        let b = set(&[3]);
        let c = set(&[2, 3, 4]);
        let d = set(&[3, 9]);
        let result = merge_runs(&[
            (false, a.clone()),
            (false, b.clone()),
            (true, c.clone()),
            (false, d.clone()),
        ])
        .expect("merge");
        // union(union(A, B) - C, D)
        assert_eq!(result, Some(set(&[1, 3, 9])));
    }

    #[test]
    fn adjacent_subtractive_run_is_unioned_first() {
        let result = merge_runs(&[
            (false, set(&[1, 2, 3, 4])),
            (true, set(&[1])),
            (true, set(&[2])),
        ])
        .expect("merge");
        assert_eq!(result, Some(set(&[3, 4])));
    }

    #[test]
    fn leading_subtractive_run_is_discarded() {
        let result =
            merge_runs(&[(true, set(&[1, 2])), (false, set(&[2, 3]))]).expect("merge");
        assert_eq!(result, Some(set(&[2, 3])));

        let only_subtractive = merge_runs(&[(true, set(&[1]))]).expect("merge");
        assert_eq!(only_subtractive, None);
    }

    #[test]
    fn empty_operands_short_circuit() {
        let cube = unit_cube([0.0; 3], [1.0; 3]);
        let empty = Solid::new();
        assert_eq!(boolean(&cube, &empty, BooleanOp::Union).expect("union"), cube);
        assert_eq!(boolean(&empty, &cube, BooleanOp::Union).expect("union"), cube);
        assert_eq!(
            boolean(&cube, &empty, BooleanOp::Subtract).expect("subtract"),
            cube
        );
        assert!(boolean(&cube, &empty, BooleanOp::Intersect)
            .expect("intersect")
            .is_empty());
    }

    #[test]
    fn re_added_cube_fills_the_bite() {
        let a = unit_cube([0.0; 3], [1.0; 3]);
        let b = unit_cube([0.5, 0.0, 0.0], [1.0, 1.2, 1.2]);
        let c = unit_cube([0.75, 0.0, 0.0], [1.0, 0.8, 0.8]);
        let result = merge_runs(&[(false, a), (true, b), (false, c)])
            .expect("merge")
            .expect("solid");
        // Grouping all positives before subtracting would give 0.66.
        let volume = result.signed_volume();
        assert!((volume - 1.14).abs() < 1.0e-2, "volume {volume}");
    }

    #[test]
    fn subtraction_takes_cutter_color_on_cut_faces() {
        let a = unit_cube([0.0; 3], [1.0; 3]).with_color([1.0, 0.0, 0.0, 1.0]);
        let b = unit_cube([0.5, 0.5, 0.5], [1.0; 3]).with_color([0.0, 0.0, 1.0, 1.0]);
        let result = boolean(&a, &b, BooleanOp::Subtract).expect("subtract");
        let colors = result.colors.as_ref().expect("colors");
        assert!(colors.iter().any(|c| *c == [1.0, 0.0, 0.0, 1.0]));
        assert!(colors.iter().any(|c| *c == [0.0, 0.0, 1.0, 1.0]));
        assert!((result.signed_volume() - 0.875).abs() < 1.0e-3);
    }

    #[test]
    fn closest_point_clamps_to_triangle() {
        let p = closest_point_on_triangle(
            Vec3::new(2.0, 2.0, 1.0),
            Vec3::ZERO,
            Vec3::X,
            Vec3::Y,
        );
        assert!((p - Vec3::new(0.5, 0.5, 0.0)).length() < 1.0e-5);
    }
}
