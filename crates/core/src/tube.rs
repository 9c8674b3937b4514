//! Freeform tube meshing: a chain of (radius, position) samples becomes a
//! closed triangle list by sweeping a fixed cut face through them.

use glam::{Vec2, Vec3};

use crate::solid::Solid;

const MIN_PAIR_ANGLE: f32 = 15.0;
const MAX_PAIR_ANGLE: f32 = 165.0;
const COINCIDENT_DISTANCE: f32 = 1.0e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TubeSample {
    pub radius: f32,
    pub position: Vec3,
}

impl TubeSample {
    pub fn new(radius: f32, position: Vec3) -> Self {
        Self { radius, position }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TubeOptions {
    pub cut_face: Vec<Vec2>,
    pub interpolate: bool,
    pub rounded_ends: bool,
}

impl Default for TubeOptions {
    fn default() -> Self {
        Self {
            cut_face: regular_polygon(6),
            interpolate: true,
            rounded_ends: true,
        }
    }
}

impl TubeOptions {
    pub fn with_sides(sides: u32) -> Self {
        Self {
            cut_face: regular_polygon(sides),
            ..Self::default()
        }
    }
}

/// Unit-radius regular polygon, counter-clockwise.
pub fn regular_polygon(sides: u32) -> Vec<Vec2> {
    let sides = sides.max(3);
    (0..sides)
        .map(|i| {
            let angle = i as f32 / sides as f32 * std::f32::consts::TAU;
            Vec2::new(angle.cos(), angle.sin())
        })
        .collect()
}

/// Triangle list (three positions per triangle). Empty when there is
/// nothing to sweep.
pub fn build_tube(samples: &[TubeSample], options: &TubeOptions) -> Vec<[f32; 3]> {
    let cut_face = counter_clockwise(&options.cut_face);
    if cut_face.len() < 3 {
        return Vec::new();
    }
    let mut samples = distinct_samples(samples);
    if samples.is_empty() {
        return Vec::new();
    }
    if samples.len() == 1 {
        samples = split_single(samples[0]);
    }
    if options.interpolate {
        samples = interpolate(&samples);
    }
    if options.rounded_ends {
        samples = add_rounded_ends(&samples);
    }

    let segments = segment_directions(&samples);
    let forwards = forward_directions(&samples, &segments);
    let base_normal = base_normal(&segments);
    let rings: Vec<Vec<Vec3>> = samples
        .iter()
        .zip(&forwards)
        .map(|(sample, forward)| cross_section(sample, *forward, base_normal, &cut_face))
        .collect();

    stitch(&rings, &segments)
}

pub fn tube_solid(samples: &[TubeSample], options: &TubeOptions, weld_tolerance: f32) -> Option<Solid> {
    let soup = build_tube(samples, options);
    if soup.is_empty() {
        return None;
    }
    let solid = Solid::from_triangle_soup(&soup, weld_tolerance);
    (!solid.is_empty()).then_some(solid)
}

fn counter_clockwise(polygon: &[Vec2]) -> Vec<Vec2> {
    let area: f32 = polygon
        .iter()
        .zip(polygon.iter().cycle().skip(1))
        .map(|(a, b)| a.perp_dot(*b))
        .sum();
    let mut out = polygon.to_vec();
    if area < 0.0 {
        out.reverse();
    }
    out
}

fn distinct_samples(samples: &[TubeSample]) -> Vec<TubeSample> {
    let mut out: Vec<TubeSample> = Vec::with_capacity(samples.len());
    for sample in samples.iter().filter(|s| s.radius > 0.0) {
        match out.last_mut() {
            Some(last) if last.position.distance(sample.position) < COINCIDENT_DISTANCE => {
                last.radius = last.radius.max(sample.radius);
            }
            _ => out.push(*sample),
        }
    }
    out
}

fn split_single(sample: TubeSample) -> Vec<TubeSample> {
    let offset = Vec3::X * (sample.radius / 3.0);
    vec![
        TubeSample::new(sample.radius, sample.position - offset),
        TubeSample::new(sample.radius, sample.position + offset),
    ]
}

fn interpolate(samples: &[TubeSample]) -> Vec<TubeSample> {
    let mut out = Vec::with_capacity(samples.len());
    for pair in samples.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        out.push(a);
        let distance = a.position.distance(b.position);
        let radius_sum = a.radius + b.radius;
        if radius_sum <= 0.0 || radius_sum > distance {
            continue;
        }
        let count = (distance / radius_sum).floor() as usize;
        let inserted = count.saturating_sub(1);
        for k in 1..=inserted {
            let t = k as f32 / (inserted + 1) as f32;
            out.push(TubeSample::new(
                a.radius + (b.radius - a.radius) * t,
                a.position.lerp(b.position, t),
            ));
        }
    }
    if let Some(last) = samples.last() {
        out.push(*last);
    }
    out
}

fn add_rounded_ends(samples: &[TubeSample]) -> Vec<TubeSample> {
    if samples.len() < 2 {
        return samples.to_vec();
    }
    let cap = |end: TubeSample, inner: TubeSample| {
        let outward = (end.position - inner.position).normalize_or_zero();
        TubeSample::new(
            end.radius * 0.5,
            end.position + outward * end.radius * 3.0f32.sqrt() * 0.5,
        )
    };
    let last = samples.len() - 1;
    let mut out = Vec::with_capacity(samples.len() + 2);
    out.push(cap(samples[0], samples[1]));
    out.extend_from_slice(samples);
    out.push(cap(samples[last], samples[last - 1]));
    out
}

fn segment_directions(samples: &[TubeSample]) -> Vec<Vec3> {
    samples
        .windows(2)
        .map(|pair| (pair[1].position - pair[0].position).normalize_or_zero())
        .collect()
}

/// Ends copy their segment; interior samples blend both neighbours
/// weighted by segment length.
fn forward_directions(samples: &[TubeSample], segments: &[Vec3]) -> Vec<Vec3> {
    let count = samples.len();
    (0..count)
        .map(|i| {
            if i == 0 {
                return segments[0];
            }
            if i == count - 1 {
                return segments[count - 2];
            }
            let blended = samples[i + 1].position - samples[i - 1].position;
            blended.try_normalize().unwrap_or(segments[i])
        })
        .collect()
}

fn base_normal(segments: &[Vec3]) -> Vec3 {
    let min_angle = MIN_PAIR_ANGLE.to_radians();
    let max_angle = MAX_PAIR_ANGLE.to_radians();
    let mut normal = Vec3::ZERO;
    for pair in segments.windows(2) {
        let angle = pair[0].angle_between(pair[1]);
        if angle > min_angle && angle < max_angle {
            normal += pair[0].cross(pair[1]);
        }
    }
    if let Some(normal) = normal.try_normalize() {
        return normal;
    }

    let mut fallback = Vec3::ZERO;
    for segment in segments {
        let axis = dominant_axis(*segment);
        let next = next_axis(axis);
        fallback += axis.cross(next);
    }
    fallback
        .try_normalize()
        .or_else(|| segments.first().map(|s| s.any_orthonormal_vector()))
        .unwrap_or(Vec3::Y)
}

fn dominant_axis(direction: Vec3) -> Vec3 {
    let abs = direction.abs();
    if abs.x >= abs.y && abs.x >= abs.z {
        Vec3::X * direction.x.signum()
    } else if abs.y >= abs.z {
        Vec3::Y * direction.y.signum()
    } else {
        Vec3::Z * direction.z.signum()
    }
}

fn next_axis(axis: Vec3) -> Vec3 {
    if axis.x != 0.0 {
        Vec3::Y
    } else if axis.y != 0.0 {
        Vec3::Z
    } else {
        Vec3::X
    }
}

fn cross_section(sample: &TubeSample, forward: Vec3, normal: Vec3, cut_face: &[Vec2]) -> Vec<Vec3> {
    let r1 = forward
        .cross(normal)
        .try_normalize()
        .unwrap_or_else(|| forward.any_orthonormal_vector());
    let r2 = forward.cross(r1).normalize_or_zero();
    cut_face
        .iter()
        .map(|c| sample.position + (r1 * c.x + r2 * c.y) * sample.radius)
        .collect()
}

/// Offset of `next` that best lines up each vertex of `ring` with its
/// partner along `direction`.
fn best_offset(ring: &[Vec3], next: &[Vec3], direction: Vec3) -> usize {
    let n = ring.len();
    let mut best = 0;
    let mut best_score = f32::MIN;
    for offset in 0..n {
        let score: f32 = (0..n)
            .map(|k| (next[(k + offset) % n] - ring[k]).normalize_or_zero().dot(direction))
            .sum();
        if score > best_score {
            best_score = score;
            best = offset;
        }
    }
    best
}

fn stitch(rings: &[Vec<Vec3>], segments: &[Vec3]) -> Vec<[f32; 3]> {
    let Some(first) = rings.first() else {
        return Vec::new();
    };
    let Some(last) = rings.last() else {
        return Vec::new();
    };
    let n = first.len();
    let mut out = Vec::new();
    let mut push = |a: Vec3, b: Vec3, c: Vec3| {
        out.push(a.to_array());
        out.push(b.to_array());
        out.push(c.to_array());
    };

    for i in 1..n - 1 {
        push(first[0], first[i + 1], first[i]);
    }

    for (pair, direction) in rings.windows(2).zip(segments) {
        let (a, b) = (&pair[0], &pair[1]);
        let offset = best_offset(a, b, *direction);
        for k in 0..n {
            let a0 = a[k];
            let a1 = a[(k + 1) % n];
            let b0 = b[(k + offset) % n];
            let b1 = b[(k + 1 + offset) % n];
            push(a0, a1, b1);
            push(a0, b1, b0);
        }
    }

    for i in 1..n - 1 {
        push(last[0], last[i], last[i + 1]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_frills(sides: u32) -> TubeOptions {
        TubeOptions {
            cut_face: regular_polygon(sides),
            interpolate: false,
            rounded_ends: false,
        }
    }

    #[test]
    fn single_sample_becomes_closed_solid() {
        let samples = [TubeSample::new(1.0, Vec3::ZERO)];
        let options = no_frills(6);
        let soup = build_tube(&samples, &options);
        let triangles: Vec<&[[f32; 3]]> = soup.chunks_exact(3).collect();
        // Two caps of n - 2 triangles around one band of 2n.
        assert_eq!(triangles.len(), 2 * (6 - 2) + 2 * 6);
        for tri in &triangles[..4] {
            assert!(tri.iter().all(|p| (p[0] + 1.0 / 3.0).abs() < 1.0e-5));
        }
        for tri in &triangles[triangles.len() - 4..] {
            assert!(tri.iter().all(|p| (p[0] - 1.0 / 3.0).abs() < 1.0e-5));
        }

        let solid = tube_solid(&samples, &TubeOptions::default(), 1.0e-5).expect("solid");
        assert!(solid.is_closed());
        assert!(solid.signed_volume() > 0.0);
    }

    #[test]
    fn cap_count_follows_cut_face_sides() {
        let samples = [
            TubeSample::new(0.5, Vec3::ZERO),
            TubeSample::new(0.5, Vec3::new(0.0, 0.0, 0.8)),
        ];
        let soup = build_tube(&samples, &no_frills(8));
        assert_eq!(soup.len() / 3, 2 * (8 - 2) + 2 * 8);
    }

    #[test]
    fn long_segments_get_interpolated() {
        let samples = [
            TubeSample::new(0.5, Vec3::ZERO),
            TubeSample::new(0.5, Vec3::new(5.0, 0.0, 0.0)),
        ];
        let out = interpolate(&samples);
        // floor(5 / 1) - 1 = 4 inserted samples.
        assert_eq!(out.len(), 6);
        assert!((out[1].position.x - 1.0).abs() < 1.0e-5);
    }

    #[test]
    fn close_samples_are_not_interpolated() {
        let samples = [
            TubeSample::new(1.0, Vec3::ZERO),
            TubeSample::new(1.0, Vec3::new(1.5, 0.0, 0.0)),
        ];
        assert_eq!(interpolate(&samples).len(), 2);
    }

    #[test]
    fn rounded_ends_add_half_radius_caps() {
        let samples = [
            TubeSample::new(1.0, Vec3::ZERO),
            TubeSample::new(1.0, Vec3::new(0.0, 2.0, 0.0)),
        ];
        let out = add_rounded_ends(&samples);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].radius, 0.5);
        assert!(out[0].position.y < 0.0);
        assert!(out[3].position.y > 2.0);
    }

    #[test]
    fn base_normal_ignores_straight_runs() {
        let straight = [Vec3::X, Vec3::X, Vec3::X];
        let normal = base_normal(&straight);
        assert!(normal.dot(Vec3::X).abs() < 1.0e-5);
        assert!((normal.length() - 1.0).abs() < 1.0e-5);

        let bent = [Vec3::X, Vec3::Y];
        assert!((base_normal(&bent) - Vec3::Z).length() < 1.0e-5);
    }

    #[test]
    fn bent_tube_is_closed_and_outward() {
        let samples = [
            TubeSample::new(0.3, Vec3::ZERO),
            TubeSample::new(0.4, Vec3::new(1.0, 0.0, 0.0)),
            TubeSample::new(0.3, Vec3::new(1.5, 1.0, 0.5)),
            TubeSample::new(0.2, Vec3::new(1.0, 2.0, 1.0)),
        ];
        let solid = tube_solid(&samples, &TubeOptions::default(), 1.0e-5).expect("solid");
        assert!(solid.is_closed());
        assert!(solid.signed_volume() > 0.0);
    }

    #[test]
    fn clockwise_cut_face_is_reversed() {
        let mut cut_face = regular_polygon(5);
        cut_face.reverse();
        let fixed = counter_clockwise(&cut_face);
        assert_eq!(fixed, regular_polygon(5));
    }
}
