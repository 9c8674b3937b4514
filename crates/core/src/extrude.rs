use std::f32::consts::TAU;

use glam::{Quat, Vec2, Vec3};

use crate::primitives::{Caps, Grid, MIN_SEGMENTS};
use crate::solid::Solid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Profile {
    Ellipse,
    Rectangle,
    Star { points: u32, inner_ratio: f32 },
}

impl Profile {
    pub fn from_name(name: &str, star_points: i32, star_inner_ratio: f32) -> Option<Profile> {
        match name.trim().to_lowercase().as_str() {
            "ellipse" | "circle" => Some(Profile::Ellipse),
            "rectangle" | "rect" | "square" => Some(Profile::Rectangle),
            "star" => Some(Profile::Star {
                points: star_points.max(2) as u32,
                inner_ratio: star_inner_ratio,
            }),
            _ => None,
        }
    }

    /// Counter-clockwise outline scaled to `size` (full width, full height).
    pub fn outline(&self, size: Vec2, segments: u32) -> Option<Vec<Vec2>> {
        if size.min_element() <= 0.0 {
            return None;
        }
        let half = size * 0.5;
        let outline = match *self {
            Profile::Ellipse => {
                let count = segments.max(MIN_SEGMENTS);
                (0..count)
                    .map(|i| {
                        let angle = i as f32 / count as f32 * TAU;
                        Vec2::new(angle.cos(), angle.sin()) * half
                    })
                    .collect()
            }
            Profile::Rectangle => vec![
                Vec2::new(-half.x, -half.y),
                Vec2::new(half.x, -half.y),
                Vec2::new(half.x, half.y),
                Vec2::new(-half.x, half.y),
            ],
            Profile::Star {
                points,
                inner_ratio,
            } => {
                if inner_ratio <= 0.0 {
                    return None;
                }
                let count = points * 2;
                (0..count)
                    .map(|i| {
                        let angle = i as f32 / count as f32 * TAU;
                        let scale = if i % 2 == 0 { 1.0 } else { inner_ratio };
                        Vec2::new(angle.cos(), angle.sin()) * half * scale
                    })
                    .collect()
            }
        };
        Some(outline)
    }
}

/// Cubic bezier segments passing through every control point, with
/// Catmull-Rom tangents and clamped ends.
pub fn fit_bezier(points: &[Vec3]) -> Vec<[Vec3; 4]> {
    if points.len() < 2 {
        return Vec::new();
    }
    let last = points.len() - 1;
    (0..last)
        .map(|i| {
            let p0 = points[i.saturating_sub(1)];
            let p1 = points[i];
            let p2 = points[i + 1];
            let p3 = points[(i + 2).min(last)];
            [p1, p1 + (p2 - p0) / 6.0, p2 - (p3 - p1) / 6.0, p2]
        })
        .collect()
}

fn bezier_point(segment: &[Vec3; 4], t: f32) -> Vec3 {
    let u = 1.0 - t;
    segment[0] * (u * u * u)
        + segment[1] * (3.0 * u * u * t)
        + segment[2] * (3.0 * u * t * t)
        + segment[3] * (t * t * t)
}

fn bezier_tangent(segment: &[Vec3; 4], t: f32) -> Vec3 {
    let u = 1.0 - t;
    (segment[1] - segment[0]) * (3.0 * u * u)
        + (segment[2] - segment[1]) * (6.0 * u * t)
        + (segment[3] - segment[2]) * (3.0 * t * t)
}

/// `slices + 1` evenly spaced samples over the whole curve as
/// (position, unit tangent).
pub fn sample_path(segments: &[[Vec3; 4]], slices: u32) -> Vec<(Vec3, Vec3)> {
    if segments.is_empty() {
        return Vec::new();
    }
    let slices = slices.max(1);
    let mut samples = Vec::with_capacity(slices as usize + 1);
    let mut last_tangent = Vec3::Z;
    for s in 0..=slices {
        let global = s as f32 / slices as f32 * segments.len() as f32;
        let index = (global.floor() as usize).min(segments.len() - 1);
        let t = global - index as f32;
        let segment = &segments[index];
        let mut tangent = bezier_tangent(segment, t);
        if tangent.length_squared() <= 1.0e-12 {
            tangent = segment[3] - segment[0];
        }
        let tangent = tangent.try_normalize().unwrap_or(last_tangent);
        last_tangent = tangent;
        samples.push((bezier_point(segment, t), tangent));
    }
    samples
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoftOptions {
    pub start_size: Vec2,
    pub end_size: Vec2,
    pub slices: u32,
    pub segments: u32,
    pub prevent_twist: bool,
}

/// Sweeps the profile along the curve through `control_points`, scaling
/// linearly from start to end size, and caps both ends.
pub fn curve_extrusion(
    profile: Profile,
    control_points: &[Vec3],
    options: &LoftOptions,
    weld_tolerance: f32,
) -> Option<Solid> {
    if control_points.len() < 2 {
        return None;
    }
    let outline = profile.outline(Vec2::ONE, options.segments)?;
    if options.start_size.min_element() <= 0.0 || options.end_size.min_element() <= 0.0 {
        return None;
    }
    let path = fit_bezier(control_points);
    let samples = sample_path(&path, options.slices);
    if samples.len() < 2 {
        return None;
    }

    let frames = slice_frames(&samples, options.prevent_twist);
    let last = (samples.len() - 1) as f32;
    let rows = samples
        .iter()
        .zip(&frames)
        .enumerate()
        .map(|(i, ((position, _), rotation))| {
            let size = options.start_size.lerp(options.end_size, i as f32 / last);
            outline
                .iter()
                .map(|p| *position + *rotation * (*p * size).extend(0.0))
                .collect()
        })
        .collect();

    Grid {
        rows,
        wrap_rows: false,
        caps: Caps::Centroid,
    }
    .into_solid(weld_tolerance)
}

fn slice_frames(samples: &[(Vec3, Vec3)], prevent_twist: bool) -> Vec<Quat> {
    if !prevent_twist {
        return samples
            .iter()
            .map(|(_, tangent)| Quat::from_rotation_arc(Vec3::Z, *tangent))
            .collect();
    }
    // Parallel transport of the first segment's frame.
    let mut frames = Vec::with_capacity(samples.len());
    let mut current = Quat::from_rotation_arc(Vec3::Z, samples[0].1);
    let mut previous = samples[0].1;
    for (_, tangent) in samples {
        current = (Quat::from_rotation_arc(previous, *tangent) * current).normalize();
        previous = *tangent;
        frames.push(current);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> LoftOptions {
        LoftOptions {
            start_size: Vec2::ONE,
            end_size: Vec2::ONE,
            slices: 8,
            segments: 16,
            prevent_twist: true,
        }
    }

    #[test]
    fn bezier_passes_through_control_points() {
        let points = [Vec3::ZERO, Vec3::new(1.0, 1.0, 0.0), Vec3::new(2.0, 0.0, 1.0)];
        let path = fit_bezier(&points);
        assert_eq!(path.len(), 2);
        assert_eq!(path[0][0], points[0]);
        assert_eq!(path[0][3], points[1]);
        assert_eq!(path[1][3], points[2]);
    }

    #[test]
    fn straight_rectangle_extrusion_is_a_box() {
        let points = [Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0)];
        let solid =
            curve_extrusion(Profile::Rectangle, &points, &options(), 1.0e-5).expect("solid");
        assert!(solid.is_closed());
        assert!((solid.signed_volume() - 2.0).abs() < 1.0e-3);
    }

    #[test]
    fn sizes_interpolate_along_the_curve() {
        let points = [Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0)];
        let mut opts = options();
        opts.end_size = Vec2::splat(3.0);
        let solid = curve_extrusion(Profile::Rectangle, &points, &opts, 1.0e-5).expect("solid");
        let (min, max) = solid.bounds().expect("bounds");
        assert!((max[0] - 1.5).abs() < 1.0e-4);
        assert!((min[0] + 1.5).abs() < 1.0e-4);
    }

    #[test]
    fn needs_two_control_points() {
        assert!(curve_extrusion(Profile::Ellipse, &[Vec3::ZERO], &options(), 1.0e-5).is_none());
    }

    #[test]
    fn star_without_inner_ratio_is_null() {
        let star = Profile::from_name("star", 5, 0.0).expect("profile");
        let points = [Vec3::ZERO, Vec3::Z];
        assert!(curve_extrusion(star, &points, &options(), 1.0e-5).is_none());

        let star = Profile::from_name("star", 5, 0.5).expect("profile");
        let solid = curve_extrusion(star, &points, &options(), 1.0e-5).expect("solid");
        assert!(solid.is_closed());
    }

    #[test]
    fn twist_free_frames_keep_orientation_on_a_bend() {
        let points = [
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 4.0),
        ];
        let samples = sample_path(&fit_bezier(&points), 16);
        let frames = slice_frames(&samples, true);
        for ((_, tangent), frame) in samples.iter().zip(&frames) {
            assert!((*frame * Vec3::Z - *tangent).length() < 1.0e-3);
        }
        // The bend stays in the XZ plane, so the profile's Y axis never rolls.
        for frame in &frames {
            assert!((*frame * Vec3::Y - Vec3::Y).length() < 1.0e-3);
        }
    }
}
