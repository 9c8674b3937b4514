use std::f32::consts::{FRAC_PI_2, PI, TAU};

use glam::{Vec2, Vec3};

use crate::solid::Solid;

pub const MIN_SEGMENTS: u32 = 4;
pub const MIN_TORUS_SEGMENTS: u32 = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Caps {
    None,
    /// Fan from the first vertex of the ring. Rings must be convex or star
    /// shaped around that vertex.
    Fan,
    /// Fan from an added centroid vertex.
    Centroid,
}

/// Rows of rings stitched into quads. Columns always wrap; rows wrap when
/// `wrap_rows` is set, otherwise the first and last rows are capped.
pub(crate) struct Grid {
    pub rows: Vec<Vec<Vec3>>,
    pub wrap_rows: bool,
    pub caps: Caps,
}

impl Grid {
    pub fn into_solid(self, weld_tolerance: f32) -> Option<Solid> {
        let cols = self.rows.first()?.len();
        if cols < 3 || self.rows.len() < 2 || self.rows.iter().any(|row| row.len() != cols) {
            return None;
        }
        let mut positions: Vec<[f32; 3]> = Vec::with_capacity(self.rows.len() * cols + 2);
        for row in &self.rows {
            positions.extend(row.iter().map(|p| p.to_array()));
        }
        let index = |row: usize, col: usize| (row * cols + col % cols) as u32;
        let row_count = self.rows.len();
        let mut indices = Vec::new();
        let stitched_rows = if self.wrap_rows { row_count } else { row_count - 1 };
        for r in 0..stitched_rows {
            let next = (r + 1) % row_count;
            for c in 0..cols {
                let a0 = index(r, c);
                let a1 = index(r, c + 1);
                let b0 = index(next, c);
                let b1 = index(next, c + 1);
                indices.extend_from_slice(&[a0, a1, b1, a0, b1, b0]);
            }
        }

        if !self.wrap_rows {
            let last = row_count - 1;
            match self.caps {
                Caps::None => {}
                Caps::Fan => {
                    for c in 1..cols - 1 {
                        indices.extend_from_slice(&[index(0, 0), index(0, c + 1), index(0, c)]);
                        indices.extend_from_slice(&[
                            index(last, 0),
                            index(last, c),
                            index(last, c + 1),
                        ]);
                    }
                }
                Caps::Centroid => {
                    let first_center = positions.len() as u32;
                    positions.push(centroid(&self.rows[0]).to_array());
                    let last_center = positions.len() as u32;
                    positions.push(centroid(&self.rows[last]).to_array());
                    for c in 0..cols {
                        indices.extend_from_slice(&[first_center, index(0, c + 1), index(0, c)]);
                        indices.extend_from_slice(&[
                            last_center,
                            index(last, c),
                            index(last, c + 1),
                        ]);
                    }
                }
            }
        }

        let mut solid = Solid::with_positions_indices(positions, indices).welded(weld_tolerance);
        if solid.is_empty() {
            return None;
        }
        solid.orient_outward();
        Some(solid)
    }
}

fn centroid(ring: &[Vec3]) -> Vec3 {
    ring.iter().copied().sum::<Vec3>() / ring.len().max(1) as f32
}

pub fn ellipsoid(radii: Vec3, segments: u32, weld_tolerance: f32) -> Option<Solid> {
    if radii.min_element() <= 0.0 {
        return None;
    }
    let cols = segments.max(MIN_SEGMENTS);
    let rows = (cols / 2).max(2);
    let grid_rows = (0..=rows)
        .map(|r| {
            let theta = r as f32 / rows as f32 * PI;
            (0..cols)
                .map(|c| {
                    let phi = c as f32 / cols as f32 * TAU;
                    Vec3::new(
                        theta.sin() * phi.cos(),
                        theta.cos(),
                        theta.sin() * phi.sin(),
                    ) * radii
                })
                .collect()
        })
        .collect();
    Grid {
        rows: grid_rows,
        wrap_rows: false,
        caps: Caps::Fan,
    }
    .into_solid(weld_tolerance)
}

/// Round radius actually used for a box, kept strictly inside the smallest
/// half extent.
pub fn effective_round_radius(size: Vec3, round_radius: f32, epsilon: f32) -> f32 {
    let limit = size.min_element() * 0.5 - epsilon;
    round_radius.min(limit).max(0.0)
}

pub fn cuboid(
    size: Vec3,
    round_radius: f32,
    segments: u32,
    epsilon: f32,
    weld_tolerance: f32,
) -> Option<Solid> {
    if size.min_element() <= 0.0 {
        return None;
    }
    let half = size * 0.5;
    let radius = effective_round_radius(size, round_radius, epsilon);
    if radius <= 0.0 {
        return Some(box_solid(half));
    }

    // A sphere split at the three axis planes, each octant pushed out to
    // its corner. Duplicated seam rings become the flat faces.
    let per_quadrant = (segments.max(MIN_SEGMENTS) / 4).max(1);
    let inner = half - Vec3::splat(radius);
    let mut rows = Vec::new();
    for hemisphere in [1.0f32, -1.0] {
        for r in 0..=per_quadrant {
            let t = r as f32 / per_quadrant as f32;
            let theta = if hemisphere > 0.0 {
                t * FRAC_PI_2
            } else {
                FRAC_PI_2 + t * FRAC_PI_2
            };
            let mut ring = Vec::new();
            for quadrant in 0..4 {
                let (sx, sz) = match quadrant {
                    0 => (1.0, 1.0),
                    1 => (-1.0, 1.0),
                    2 => (-1.0, -1.0),
                    _ => (1.0, -1.0),
                };
                for c in 0..=per_quadrant {
                    let phi = (quadrant as f32 + c as f32 / per_quadrant as f32) * FRAC_PI_2;
                    let direction =
                        Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
                    let offset = Vec3::new(sx * inner.x, hemisphere * inner.y, sz * inner.z);
                    ring.push(offset + direction * radius);
                }
            }
            rows.push(ring);
        }
    }
    Grid {
        rows,
        wrap_rows: false,
        caps: Caps::Fan,
    }
    .into_solid(weld_tolerance)
}

fn box_solid(half: Vec3) -> Solid {
    let (hx, hy, hz) = (half.x, half.y, half.z);
    let positions = vec![
        [-hx, -hy, -hz],
        [hx, -hy, -hz],
        [hx, hy, -hz],
        [-hx, hy, -hz],
        [-hx, -hy, hz],
        [hx, -hy, hz],
        [hx, hy, hz],
        [-hx, hy, hz],
    ];
    let indices = vec![
        0, 2, 1, 0, 3, 2, // -Z
        4, 5, 6, 4, 6, 7, // +Z
        0, 1, 5, 0, 5, 4, // -Y
        2, 3, 7, 2, 7, 6, // +Y
        1, 2, 6, 1, 6, 5, // +X
        3, 0, 4, 3, 4, 7, // -X
    ];
    Solid::with_positions_indices(positions, indices)
}

pub fn cylinder(
    radius: f32,
    height: f32,
    round_radius: f32,
    segments: u32,
    epsilon: f32,
    weld_tolerance: f32,
) -> Option<Solid> {
    if radius <= 0.0 || height <= 0.0 {
        return None;
    }
    let cols = segments.max(MIN_SEGMENTS);
    let half_height = height * 0.5;
    let round = round_radius
        .min(radius - epsilon)
        .min(half_height - epsilon)
        .max(0.0);

    // Lathe profile as (radial distance, height), bottom to top.
    let mut profile = Vec::new();
    if round > 0.0 {
        let arc_steps = (cols / 4).max(1);
        for s in 0..=arc_steps {
            let angle = -FRAC_PI_2 + s as f32 / arc_steps as f32 * FRAC_PI_2;
            profile.push(Vec2::new(
                radius - round + round * angle.cos(),
                -half_height + round + round * angle.sin(),
            ));
        }
        for s in 0..=arc_steps {
            let angle = s as f32 / arc_steps as f32 * FRAC_PI_2;
            profile.push(Vec2::new(
                radius - round + round * angle.cos(),
                half_height - round + round * angle.sin(),
            ));
        }
    } else {
        profile.push(Vec2::new(radius, -half_height));
        profile.push(Vec2::new(radius, half_height));
    }
    lathe(&profile, cols, false, weld_tolerance)
}

pub fn elliptic_cylinder(
    radii: Vec2,
    height: f32,
    start_angle: f32,
    end_angle: f32,
    segments: u32,
    weld_tolerance: f32,
) -> Option<Solid> {
    let sweep = end_angle - start_angle;
    if radii.min_element() <= 0.0 || height <= 0.0 || sweep <= 0.0 {
        return None;
    }
    let sweep = sweep.min(TAU);
    let full = sweep >= TAU - 1.0e-5;
    let half_height = height * 0.5;
    let cols = segments.max(MIN_SEGMENTS);

    let mut outline = Vec::new();
    if full {
        for c in 0..cols {
            let angle = start_angle + c as f32 / cols as f32 * TAU;
            outline.push(Vec2::new(radii.x * angle.cos(), radii.y * angle.sin()));
        }
    } else {
        // Wedge outline: the axis point, then the arc. Wrapping the columns
        // closes the two flat sides.
        let steps = ((cols as f32 * sweep / TAU).ceil() as u32).max(1);
        outline.push(Vec2::ZERO);
        for s in 0..=steps {
            let angle = start_angle + s as f32 / steps as f32 * sweep;
            outline.push(Vec2::new(radii.x * angle.cos(), radii.y * angle.sin()));
        }
    }

    let rows = [-half_height, half_height]
        .into_iter()
        .map(|y| outline.iter().map(|p| Vec3::new(p.x, y, p.y)).collect())
        .collect();
    Grid {
        rows,
        wrap_rows: false,
        caps: Caps::Fan,
    }
    .into_solid(weld_tolerance)
}

/// `radius` is the outer extent and `inner_radius` the hole radius.
pub fn torus(
    radius: f32,
    inner_radius: f32,
    segments: u32,
    ring_segments: u32,
    weld_tolerance: f32,
) -> Option<Solid> {
    if inner_radius < 0.0 || radius <= inner_radius {
        return None;
    }
    let tube = (radius - inner_radius) * 0.5;
    let center = inner_radius + tube;
    let cols = segments.max(MIN_TORUS_SEGMENTS);
    let ring_cols = ring_segments.max(MIN_TORUS_SEGMENTS);
    let profile: Vec<Vec2> = (0..ring_cols)
        .map(|s| {
            let angle = s as f32 / ring_cols as f32 * TAU;
            Vec2::new(center + tube * angle.cos(), tube * angle.sin())
        })
        .collect();
    lathe(&profile, cols, true, weld_tolerance)
}

fn lathe(profile: &[Vec2], cols: u32, closed: bool, weld_tolerance: f32) -> Option<Solid> {
    let rows = profile
        .iter()
        .map(|p| {
            (0..cols)
                .map(|c| {
                    let angle = c as f32 / cols as f32 * TAU;
                    Vec3::new(p.x * angle.cos(), p.y, p.x * angle.sin())
                })
                .collect()
        })
        .collect();
    Grid {
        rows,
        wrap_rows: closed,
        caps: if closed { Caps::None } else { Caps::Fan },
    }
    .into_solid(weld_tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1.0e-3;
    const WELD: f32 = 1.0e-5;

    #[test]
    fn zero_dimension_cuboid_is_null() {
        assert!(cuboid(Vec3::new(0.0, 1.0, 1.0), 0.0, 8, EPS, WELD).is_none());
        assert!(cuboid(Vec3::new(1.0, -1.0, 1.0), 0.2, 8, EPS, WELD).is_none());
    }

    #[test]
    fn round_radius_stays_inside_half_extent() {
        let size = Vec3::splat(2.0);
        assert_eq!(effective_round_radius(size, 0.5, EPS), 0.5);
        let clamped = effective_round_radius(size, 5.0, EPS);
        assert!(clamped < 1.0 - EPS * 0.5);
        assert!(clamped > 0.9);
    }

    #[test]
    fn rounded_cuboid_is_closed_and_inside_its_box() {
        let solid = cuboid(Vec3::splat(2.0), 0.5, 16, EPS, WELD).expect("solid");
        assert!(solid.is_closed());
        let (min, max) = solid.bounds().expect("bounds");
        for axis in 0..3 {
            assert!((min[axis] + 1.0).abs() < 1.0e-4);
            assert!((max[axis] - 1.0).abs() < 1.0e-4);
        }
        let volume = solid.signed_volume();
        assert!(volume > 0.0 && volume < 8.0);
    }

    #[test]
    fn sharp_cuboid_has_eight_corners() {
        let solid = cuboid(Vec3::new(1.0, 2.0, 3.0), 0.0, 4, EPS, WELD).expect("solid");
        assert_eq!(solid.positions.len(), 8);
        assert!((solid.signed_volume() - 6.0).abs() < 1.0e-4);
    }

    #[test]
    fn ellipsoid_volume_approaches_analytic() {
        let radii = Vec3::new(1.0, 2.0, 0.5);
        let solid = ellipsoid(radii, 64, WELD).expect("solid");
        assert!(solid.is_closed());
        let analytic = 4.0 / 3.0 * PI * radii.x * radii.y * radii.z;
        assert!((solid.signed_volume() - analytic).abs() / analytic < 0.02);
    }

    #[test]
    fn low_segment_counts_are_raised() {
        let solid = ellipsoid(Vec3::ONE, 1, WELD).expect("solid");
        assert!(solid.is_closed());
        let torus = torus(1.0, 0.5, 1, 1, WELD).expect("torus");
        assert!(torus.is_closed());
        assert_eq!(torus.positions.len(), 9);
    }

    #[test]
    fn torus_requires_outer_beyond_inner() {
        assert!(torus(1.0, 1.0, 16, 8, WELD).is_none());
        assert!(torus(0.5, 1.0, 16, 8, WELD).is_none());
    }

    #[test]
    fn cylinder_volume_and_closure() {
        let solid = cylinder(1.0, 2.0, 0.0, 128, EPS, WELD).expect("solid");
        assert!(solid.is_closed());
        assert!((solid.signed_volume() - 2.0 * PI).abs() < 0.01);
        let rounded = cylinder(1.0, 2.0, 0.3, 32, EPS, WELD).expect("rounded");
        assert!(rounded.is_closed());
        assert!(rounded.signed_volume() < solid.signed_volume());
    }

    #[test]
    fn wedge_needs_positive_angle_range() {
        assert!(elliptic_cylinder(Vec2::ONE, 1.0, 1.0, 1.0, 16, WELD).is_none());
        let half = elliptic_cylinder(Vec2::ONE, 1.0, 0.0, PI, 128, WELD).expect("wedge");
        assert!(half.is_closed());
        assert!((half.signed_volume() - PI * 0.5).abs() < 0.01);
    }
}
