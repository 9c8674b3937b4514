use std::collections::BTreeSet;
use std::sync::Arc;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;

use glam::{EulerRot, Mat3, Mat4, Quat, Vec2, Vec3};
use solidtree_scene::RenderMesh;
use tracing::{debug, warn};
#[cfg(target_arch = "wasm32")]
use web_time::Instant;

use crate::component::{ComponentKind, ComponentValue};
use crate::csg::{intersect_all, merge_runs};
use crate::extrude::{curve_extrusion, LoftOptions, Profile};
use crate::hull::{convex_hull, hull_chain};
use crate::model::{Model, ModelError, SceneTree};
use crate::node::{Node, NodeId, NodeKind};
use crate::primitives;
use crate::settings::EngineSettings;
use crate::solid::{symmetry_key, Solid};
use crate::throttle::RebuildThrottle;
use crate::tube::{regular_polygon, tube_solid, TubeOptions, TubeSample};
use crate::watchers::{DirtyMarks, PoseWatcher};

use ComponentKind as C;

#[derive(Debug, Default)]
pub struct RebuildReport {
    pub passes: u32,
    pub transformed: Vec<NodeId>,
    pub rebuilt: Vec<NodeId>,
    pub partial: Vec<NodeId>,
    pub mirrored: Vec<NodeId>,
    pub deferred: Vec<NodeId>,
    pub failed: Vec<(NodeId, String)>,
    pub duration_ms: f32,
}

impl RebuildReport {
    pub fn is_empty(&self) -> bool {
        self.transformed.is_empty()
            && self.rebuilt.is_empty()
            && self.partial.is_empty()
            && self.mirrored.is_empty()
            && self.deferred.is_empty()
    }
}

/// Everything one geometry node needs to produce its solid, read from its
/// components up front.
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryRule {
    Group,
    Intersect,
    Hull,
    HullChain,
    Ellipsoid {
        radii: Vec3,
        segments: u32,
    },
    Cuboid {
        size: Vec3,
        round_radius: f32,
        segments: u32,
    },
    Cylinder {
        radius: f32,
        height: f32,
        round_radius: f32,
        segments: u32,
    },
    EllipticCylinder {
        radii: Vec2,
        height: f32,
        start_angle: f32,
        end_angle: f32,
        segments: u32,
    },
    Torus {
        radius: f32,
        inner_radius: f32,
        segments: u32,
        ring_segments: u32,
    },
    CurveExtrusion {
        profile: Option<Profile>,
        options: LoftOptions,
    },
    Tube {
        options: TubeOptions,
    },
    Mesh {
        positions: Vec<[f32; 3]>,
        indices: Vec<u32>,
        vertex_colors: Vec<[f32; 4]>,
    },
}

fn count(node: &Node, component: ComponentKind) -> Result<u32, ModelError> {
    Ok(node.int(component)?.max(0) as u32)
}

impl GeometryRule {
    pub fn from_node(node: &Node) -> Result<GeometryRule, ModelError> {
        let rule = match node.kind() {
            NodeKind::Group => GeometryRule::Group,
            NodeKind::Intersect => GeometryRule::Intersect,
            NodeKind::Hull => GeometryRule::Hull,
            NodeKind::HullChain => GeometryRule::HullChain,
            NodeKind::Ellipsoid => GeometryRule::Ellipsoid {
                radii: node.vec3(C::Radii)?,
                segments: count(node, C::Segments)?,
            },
            NodeKind::Cuboid => GeometryRule::Cuboid {
                size: node.vec3(C::Size)?,
                round_radius: node.float(C::RoundRadius)?,
                segments: count(node, C::Segments)?,
            },
            NodeKind::Cylinder => GeometryRule::Cylinder {
                radius: node.float(C::Radius)?,
                height: node.float(C::Height)?,
                round_radius: node.float(C::RoundRadius)?,
                segments: count(node, C::Segments)?,
            },
            NodeKind::EllipticCylinder => GeometryRule::EllipticCylinder {
                radii: node.vec2(C::EllipseRadii)?,
                height: node.float(C::Height)?,
                start_angle: node.float(C::StartAngle)?,
                end_angle: node.float(C::EndAngle)?,
                segments: count(node, C::Segments)?,
            },
            NodeKind::Torus => GeometryRule::Torus {
                radius: node.float(C::Radius)?,
                inner_radius: node.float(C::InnerRadius)?,
                segments: count(node, C::Segments)?,
                ring_segments: count(node, C::RingSegments)?,
            },
            NodeKind::CurveExtrusion => GeometryRule::CurveExtrusion {
                profile: Profile::from_name(
                    node.string(C::Profile)?,
                    node.int(C::StarPoints)?,
                    node.float(C::StarInnerRatio)?,
                ),
                options: LoftOptions {
                    start_size: node.vec2(C::StartSize)?,
                    end_size: node.vec2(C::EndSize)?,
                    slices: count(node, C::Slices)?,
                    segments: count(node, C::Segments)?,
                    prevent_twist: node.bool(C::PreventTwist)?,
                },
            },
            NodeKind::Tube => GeometryRule::Tube {
                options: TubeOptions {
                    // Fewer than three sides falls back to the engine default.
                    cut_face: match count(node, C::CutFaceSides)? {
                        sides if sides >= 3 => regular_polygon(sides),
                        _ => Vec::new(),
                    },
                    interpolate: node.bool(C::Interpolate)?,
                    rounded_ends: node.bool(C::RoundedEnds)?,
                },
            },
            NodeKind::Mesh => GeometryRule::Mesh {
                positions: node
                    .bytes(C::Vertices)?
                    .chunks_exact(12)
                    .map(bytemuck::pod_read_unaligned::<[f32; 3]>)
                    .collect(),
                indices: node
                    .bytes(C::Faces)?
                    .chunks_exact(4)
                    .map(bytemuck::pod_read_unaligned::<u32>)
                    .collect(),
                vertex_colors: node
                    .bytes(C::VertexColors)?
                    .chunks_exact(4)
                    .map(|c| [c[0], c[1], c[2], c[3]].map(|v| v as f32 / 255.0))
                    .collect(),
            },
            NodeKind::Null
            | NodeKind::ControlPoint
            | NodeKind::TubePoint
            | NodeKind::Target
            | NodeKind::Chain
            | NodeKind::ChainLink
            | NodeKind::Pose
            | NodeKind::Keypoint => return Err(ModelError::NotGeometry(node.id())),
        };
        Ok(rule)
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(
            self,
            GeometryRule::Group | GeometryRule::Intersect | GeometryRule::Hull | GeometryRule::HullChain
        )
    }
}

/// Per-frame driver that turns dirty flags into transforms, solids and
/// render meshes.
#[derive(Debug, Clone)]
pub struct RebuildEngine {
    settings: EngineSettings,
    throttle: RebuildThrottle,
}

impl Default for RebuildEngine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl RebuildEngine {
    pub fn new(settings: EngineSettings) -> Self {
        let throttle = RebuildThrottle::new(settings.throttle_window());
        Self { settings, throttle }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: EngineSettings) {
        self.throttle.set_window(settings.throttle_window());
        self.settings = settings;
    }

    pub fn run_frame(&mut self, model: &mut Model) -> Result<RebuildReport, ModelError> {
        self.run_frame_at(model, Instant::now())
    }

    /// Runs transform and geometry passes until no cascade leaves work
    /// behind or the pass limit is hit. Deferred nodes keep the model dirty
    /// for the next frame.
    pub fn run_frame_at(
        &mut self,
        model: &mut Model,
        now: Instant,
    ) -> Result<RebuildReport, ModelError> {
        let mut report = RebuildReport::default();
        if !model.dirty {
            return Ok(report);
        }
        let start = Instant::now();
        self.throttle.retain(|id| model.tree.contains(id));

        let mut deferred = false;
        for _ in 0..self.settings.max_passes.max(1) {
            if !model.dirty {
                break;
            }
            report.passes += 1;
            model.dirty = false;
            model.instance_dirty = false;

            let roots = model.tree.roots.clone();
            let mut pose_roots = BTreeSet::new();
            for root in &roots {
                transform_pass(
                    &mut model.tree,
                    *root,
                    Mat4::IDENTITY,
                    false,
                    None,
                    &mut pose_roots,
                    &mut report,
                );
            }
            for pose_root in pose_roots {
                refresh_keypoints(&mut model.tree, pose_root);
            }

            deferred = false;
            for root in &roots {
                deferred |= self.geometry_pass(model, *root, now, &mut report)?;
            }
            if deferred && !model.dirty {
                break;
            }
        }
        if deferred {
            model.dirty = true;
        }
        report.duration_ms = start.elapsed().as_secs_f32() * 1000.0;
        Ok(report)
    }

    /// Children before parent. Returns true when something in the subtree
    /// is still waiting for a rebuild.
    fn geometry_pass(
        &mut self,
        model: &mut Model,
        id: NodeId,
        now: Instant,
        report: &mut RebuildReport,
    ) -> Result<bool, ModelError> {
        let Some(node) = model.tree.node(id) else {
            return Ok(false);
        };
        if !node.dirty {
            return Ok(false);
        }
        let children = node.children.clone();
        let mut pending = false;
        for child in &children {
            pending |= self.geometry_pass(model, *child, now, report)?;
        }

        let Some(node) = model.tree.node(id) else {
            return Ok(pending);
        };
        if node.is_geometry() {
            if node.is_mirror() {
                if node.instance_mesh_dirty || node.geometry_dirty() {
                    self.resolve_mirror(model, id, report)?;
                }
            } else if node.geometry_dirty() {
                if pending {
                    debug!("node {id} waiting on deferred children");
                } else if self.throttle.should_defer(id, now) {
                    debug!("rebuild of node {id} deferred by throttle");
                    report.deferred.push(id);
                    pending = true;
                } else {
                    self.rebuild(model, id, now, report)?;
                }
            }
        }
        // A rebuild later in this visit can cascade into a child that was
        // already visited; keep the path open for the next pass.
        let revisit = children
            .iter()
            .any(|child| model.tree.node(*child).is_some_and(|child| child.dirty));
        if let Some(node) = model.tree.node_mut(id) {
            node.dirty = pending || revisit;
        }
        Ok(pending)
    }

    fn rebuild(
        &mut self,
        model: &mut Model,
        id: NodeId,
        now: Instant,
        report: &mut RebuildReport,
    ) -> Result<(), ModelError> {
        let node = model.node(id)?;
        let rule = GeometryRule::from_node(node)?;
        let color = node.color(C::Color)?;
        let kind = node.kind();

        if matches!(rule, GeometryRule::Mesh { .. }) && node.mesh.is_some() && is_partial(node) {
            return self.rebuild_partial(model, id, rule, color, now, report);
        }

        let solid = match self.build(&model.tree, node, &rule) {
            Ok(solid) => solid,
            Err(err) => {
                warn!("{} {id}: geometry failed, using empty solid: {err}", kind.name());
                report.failed.push((id, err));
                None
            }
        };
        let solid = solid
            .filter(|solid| !solid.is_empty())
            .map(|solid| Arc::new(solid.with_color(color)));
        let fallback = self.settings.fallback_color;
        let mesh = solid
            .as_ref()
            .map(|solid| Arc::new(solid.to_render_mesh(fallback)));
        let preview = solid.as_ref().and_then(|solid| preview_mesh(solid, color));
        let triangles = solid.as_ref().map(|solid| solid.triangle_count()).unwrap_or(0);

        let node = model
            .tree
            .node_mut(id)
            .ok_or(ModelError::MissingNode(id))?;
        store_solid(node, solid)?;
        node.mesh = mesh;
        node.preview = preview;
        self.throttle.record(id, now);
        report.rebuilt.push(id);
        debug!("rebuilt {} {id} ({triangles} triangles)", kind.name());
        model.instance_mesh_updated(id, true);
        Ok(())
    }

    /// Clay fast path: the render mesh was already patched in place, so
    /// only the solid is refreshed and mirrors reuse their meshes.
    fn rebuild_partial(
        &mut self,
        model: &mut Model,
        id: NodeId,
        rule: GeometryRule,
        color: [f32; 4],
        now: Instant,
        report: &mut RebuildReport,
    ) -> Result<(), ModelError> {
        let solid = match build_mesh(&rule) {
            Ok(solid) => solid.map(|solid| Arc::new(solid.with_color(color))),
            Err(err) => {
                warn!("mesh {id}: clay update failed, using empty solid: {err}");
                report.failed.push((id, err));
                None
            }
        };
        let preview = solid.as_ref().and_then(|solid| preview_mesh(solid, color));
        let node = model
            .tree
            .node_mut(id)
            .ok_or(ModelError::MissingNode(id))?;
        if solid.is_none() {
            node.mesh = None;
        }
        store_solid(node, solid)?;
        node.preview = preview;
        self.throttle.record(id, now);
        report.partial.push(id);
        debug!("applied partial vertex update to {id}");
        model.instance_mesh_updated(id, false);
        Ok(())
    }

    fn build(
        &self,
        tree: &SceneTree,
        node: &Node,
        rule: &GeometryRule,
    ) -> Result<Option<Solid>, String> {
        let weld = self.settings.weld_tolerance;
        let epsilon = self.settings.round_epsilon;
        let solid = match rule {
            GeometryRule::Group => {
                let operands: Vec<(bool, Solid)> = child_solids(tree, node)
                    .into_iter()
                    .map(|(child, solid)| (child.subtract(), solid))
                    .collect();
                merge_runs(&operands)?
            }
            GeometryRule::Intersect => {
                let solids = plain_child_solids(tree, node);
                match solids.len() {
                    0 => None,
                    1 => solids.into_iter().next(),
                    _ => intersect_all(&solids)?,
                }
            }
            GeometryRule::Hull => {
                let solids = plain_child_solids(tree, node);
                match solids.len() {
                    0 => None,
                    1 => solids.into_iter().next(),
                    _ => {
                        let points: Vec<[f32; 3]> = solids
                            .iter()
                            .flat_map(|solid| solid.positions.iter().copied())
                            .collect();
                        Some(convex_hull(&points)?)
                    }
                }
            }
            GeometryRule::HullChain => {
                let solids = plain_child_solids(tree, node);
                match solids.len() {
                    0 => None,
                    1 => solids.into_iter().next(),
                    _ => {
                        let clouds: Vec<Vec<[f32; 3]>> =
                            solids.into_iter().map(|solid| solid.positions).collect();
                        hull_chain(&clouds)?
                    }
                }
            }
            GeometryRule::Ellipsoid { radii, segments } => {
                primitives::ellipsoid(*radii, *segments, weld)
            }
            GeometryRule::Cuboid {
                size,
                round_radius,
                segments,
            } => primitives::cuboid(*size, *round_radius, *segments, epsilon, weld),
            GeometryRule::Cylinder {
                radius,
                height,
                round_radius,
                segments,
            } => primitives::cylinder(*radius, *height, *round_radius, *segments, epsilon, weld),
            GeometryRule::EllipticCylinder {
                radii,
                height,
                start_angle,
                end_angle,
                segments,
            } => primitives::elliptic_cylinder(
                *radii,
                *height,
                *start_angle,
                *end_angle,
                *segments,
                weld,
            ),
            GeometryRule::Torus {
                radius,
                inner_radius,
                segments,
                ring_segments,
            } => primitives::torus(*radius, *inner_radius, *segments, *ring_segments, weld),
            GeometryRule::CurveExtrusion { profile, options } => {
                let Some(profile) = profile else {
                    return Err(format!(
                        "unknown profile '{}'",
                        node.string(C::Profile).unwrap_or_default()
                    ));
                };
                let points = child_positions(tree, node, NodeKind::ControlPoint);
                curve_extrusion(*profile, &points, options, weld)
            }
            GeometryRule::Tube { options } => {
                let samples: Vec<TubeSample> = node
                    .children()
                    .iter()
                    .filter_map(|child| tree.node(*child))
                    .filter(|child| child.kind() == NodeKind::TubePoint)
                    .map(|child| {
                        TubeSample::new(
                            child.float(C::Radius).unwrap_or(1.0),
                            child.vec3(C::Position).unwrap_or(Vec3::ZERO),
                        )
                    })
                    .collect();
                let mut options = options.clone();
                if options.cut_face.len() < 3 {
                    options.cut_face = regular_polygon(self.settings.tube_sides);
                }
                tube_solid(&samples, &options, weld)
            }
            GeometryRule::Mesh { .. } => build_mesh(rule)?,
        };
        Ok(solid)
    }

    fn resolve_mirror(
        &mut self,
        model: &mut Model,
        id: NodeId,
        report: &mut RebuildReport,
    ) -> Result<(), ModelError> {
        let node = model.node(id)?;
        let Some(source) = node.instance_id else {
            return Ok(());
        };
        let key = symmetry_key(node.vec3(C::FlipDirection).unwrap_or(Vec3::ONE));
        let rebuild = node.instance_mesh_rebuild || node.mesh.is_none();
        let source_node = model.node(source)?;
        let source_solid = source_node.solid().cloned();
        let source_mesh = source_node.mesh.clone();
        let identity = key == [1, 1, 1];

        let cached = source_node.mirror_geometry.get(&key).cloned();

        let solid = match source_solid {
            None => None,
            Some(solid) if identity => Some(solid),
            Some(solid) => match cached {
                Some(cached) => Some(cached),
                None => {
                    let flip = Vec3::new(key[0] as f32, key[1] as f32, key[2] as f32);
                    let mirrored = Arc::new(solid.mirrored(flip));
                    if let Some(source_node) = model.tree.node_mut(source) {
                        source_node.mirror_geometry.insert(key, mirrored.clone());
                    }
                    Some(mirrored)
                }
            },
        };

        let mesh = match (&solid, identity && !rebuild) {
            (None, _) => None,
            (Some(_), true) => source_mesh,
            (Some(solid), false) => Some(Arc::new(solid.to_render_mesh(self.settings.fallback_color))),
        };
        let color = solid.as_ref().and_then(|solid| solid.color).unwrap_or(self.settings.fallback_color);
        let preview = solid.as_ref().and_then(|solid| preview_mesh(solid, color));

        let node = model
            .tree
            .node_mut(id)
            .ok_or(ModelError::MissingNode(id))?;
        store_solid(node, solid)?;
        node.mesh = mesh;
        node.preview = preview;
        node.instance_mesh_dirty = false;
        node.instance_mesh_rebuild = false;
        let parent = node.parent;
        mark_composites(&mut model.tree, parent);
        report.mirrored.push(id);
        debug!("refreshed mirror {id} from {source}");
        Ok(())
    }
}

/// Flags the composites above a refreshed mirror. They are all still ahead
/// of the current children-first walk, so the model flag is left alone.
fn mark_composites(tree: &mut SceneTree, from: Option<NodeId>) {
    let mut marks = DirtyMarks::new();
    marks.geometry_upwards(tree, from);
    for id in marks.geometry {
        if let Some(node) = tree.node_mut(id) {
            node.dirty = true;
            if let Some(slot) = node.components.get_mut(&C::Geometry) {
                slot.dirty = true;
            }
        }
    }
}

fn is_partial(node: &Node) -> bool {
    [C::Vertices, C::VertexColors].into_iter().any(|kind| {
        node.slot(kind)
            .map(|slot| slot.partial_update)
            .unwrap_or(false)
    })
}

fn store_solid(node: &mut Node, solid: Option<Arc<Solid>>) -> Result<(), ModelError> {
    let slot = node.slot_mut(C::Geometry)?;
    slot.value = ComponentValue::Solid(solid);
    slot.dirty = false;
    for kind in [C::Vertices, C::VertexColors] {
        if let Some(slot) = node.components.get_mut(&kind) {
            slot.partial_update = false;
        }
    }
    Ok(())
}

fn preview_mesh(solid: &Solid, color: [f32; 4]) -> Option<Arc<RenderMesh>> {
    let (min, max) = solid.bounds()?;
    Some(Arc::new(RenderMesh::box_preview(min, max, color)))
}

fn build_mesh(rule: &GeometryRule) -> Result<Option<Solid>, String> {
    let GeometryRule::Mesh {
        positions,
        indices,
        vertex_colors,
    } = rule
    else {
        return Ok(None);
    };
    let usable = indices.len() - indices.len() % 3;
    if positions.is_empty() || usable == 0 {
        return Ok(None);
    }
    let indices = indices[..usable].to_vec();
    if let Some(bad) = indices.iter().find(|index| **index as usize >= positions.len()) {
        return Err(format!(
            "face index {bad} out of range for {} vertices",
            positions.len()
        ));
    }
    let mut solid = Solid::with_positions_indices(positions.clone(), indices);
    if vertex_colors.len() == positions.len() {
        let colors = solid
            .indices
            .chunks_exact(3)
            .map(|tri| {
                let mut sum = [0.0f32; 4];
                for index in tri {
                    for (channel, value) in sum.iter_mut().zip(vertex_colors[*index as usize]) {
                        *channel += value / 3.0;
                    }
                }
                sum
            })
            .collect();
        solid.colors = Some(colors);
    }
    Ok(Some(solid))
}

/// Visible geometry children with their solids baked into this node's
/// space, in child order.
fn child_solids<'a>(tree: &'a SceneTree, node: &Node) -> Vec<(&'a Node, Solid)> {
    node.children()
        .iter()
        .filter_map(|child| tree.node(*child))
        .filter(|child| child.is_geometry() && child.visible())
        .filter_map(|child| {
            let solid = child.solid()?;
            Some((child, solid.transformed(child.transform.local)))
        })
        .collect()
}

fn plain_child_solids(tree: &SceneTree, node: &Node) -> Vec<Solid> {
    child_solids(tree, node)
        .into_iter()
        .map(|(_, solid)| solid)
        .collect()
}

fn child_positions(tree: &SceneTree, node: &Node, kind: NodeKind) -> Vec<Vec3> {
    node.children()
        .iter()
        .filter_map(|child| tree.node(*child))
        .filter(|child| child.kind() == kind)
        .map(|child| child.vec3(C::Position).unwrap_or(Vec3::ZERO))
        .collect()
}

fn euler(rotation: Vec3) -> Quat {
    Quat::from_euler(EulerRot::XYZ, rotation.x, rotation.y, rotation.z)
}

/// Rotation and scale of a node, including look-at aiming and mirror
/// reflection, plus its (possibly reflected) translation.
fn basis(tree: &SceneTree, node: &Node) -> (Vec3, Quat, Vec3) {
    let position = node.vec3(C::Position).unwrap_or(Vec3::ZERO);
    let mut rotation = node.vec3(C::Rotation).map(euler).unwrap_or(Quat::IDENTITY);
    let scale = node.float(C::Scale).unwrap_or(1.0) * node.vec3(C::NonUniformScale).unwrap_or(Vec3::ONE);
    if let Some(aim) = aim_rotation(tree, node) {
        rotation = aim * rotation;
    }
    if !node.is_mirror() {
        return (position, rotation, scale);
    }
    let key = symmetry_key(node.vec3(C::FlipDirection).unwrap_or(Vec3::ONE));
    let flip = Vec3::new(key[0] as f32, key[1] as f32, key[2] as f32);
    let reflect = Mat3::from_diagonal(flip);
    let reflected = reflect * Mat3::from_quat(rotation) * reflect;
    (position * flip, Quat::from_mat3(&reflected).normalize(), scale)
}

/// Turns the node's +Z axis toward its first Target child.
fn aim_rotation(tree: &SceneTree, node: &Node) -> Option<Quat> {
    let target = node
        .children()
        .iter()
        .filter_map(|child| tree.node(*child))
        .find(|child| child.kind() == NodeKind::Target)?;
    let direction = target.vec3(C::Position).ok()?.try_normalize()?;
    Some(Quat::from_rotation_arc(Vec3::Z, direction))
}

fn chain_link_matrix(tree: &SceneTree, node: &Node) -> Mat4 {
    let mut matrix = Mat4::IDENTITY;
    let mut previous_length = 0.0;
    for sibling in tree.siblings(node.parent()) {
        let Some(link) = tree.node(*sibling) else {
            continue;
        };
        if link.kind() != NodeKind::ChainLink {
            continue;
        }
        let rotation = link.vec3(C::Rotation).map(euler).unwrap_or(Quat::IDENTITY);
        matrix = matrix
            * Mat4::from_translation(Vec3::new(0.0, previous_length, 0.0))
            * Mat4::from_quat(rotation);
        if link.id() == node.id() {
            break;
        }
        previous_length = link.float(C::Length).unwrap_or(0.0);
    }
    matrix
}

pub(crate) fn local_matrix(tree: &SceneTree, node: &Node) -> Mat4 {
    match node.kind() {
        NodeKind::ChainLink => chain_link_matrix(tree, node),
        NodeKind::Target => {
            // Targets are placed relative to the parent's origin, unaffected
            // by the rotation they induce.
            let offset = Mat4::from_translation(node.vec3(C::Position).unwrap_or(Vec3::ZERO));
            let Some(parent) = node.parent().and_then(|parent| tree.node(parent)) else {
                return offset;
            };
            let (_, rotation, scale) = basis(tree, parent);
            let frame = Mat4::from_scale_rotation_translation(scale, rotation, Vec3::ZERO);
            if frame.determinant().abs() <= f32::EPSILON {
                return offset;
            }
            frame.inverse() * offset
        }
        _ => {
            let (position, rotation, scale) = basis(tree, node);
            Mat4::from_scale_rotation_translation(scale, rotation, position)
        }
    }
}

fn is_pose_root(node: &Node) -> bool {
    node.kind() == NodeKind::Pose && node.bool(C::PoseRoot).unwrap_or(false)
}

/// Parent before child. `parent_changed` forces world recomputation below a
/// node whose world matrix moved.
fn transform_pass(
    tree: &mut SceneTree,
    id: NodeId,
    parent_world: Mat4,
    parent_changed: bool,
    pose: Option<NodeId>,
    pose_roots: &mut BTreeSet<NodeId>,
    report: &mut RebuildReport,
) {
    let Some(node) = tree.node(id) else {
        return;
    };
    if !node.dirty && !parent_changed {
        return;
    }
    let mut changed = parent_changed;
    let own_dirty = node.transform.dirty;
    let local = own_dirty.then(|| local_matrix(tree, node));
    let targets: Vec<NodeId> = node
        .children()
        .iter()
        .copied()
        .filter(|child| {
            tree.node(*child)
                .map(|child| child.kind() == NodeKind::Target)
                .unwrap_or(false)
        })
        .collect();
    let pose_root = is_pose_root(node);
    let clear_keypoints = node.kind() == NodeKind::Pose && !pose_root && own_dirty;
    let children = node.children.clone();

    let Some(node) = tree.node_mut(id) else {
        return;
    };
    if let Some(local) = local {
        node.transform.local = local;
        node.transform.dirty = false;
        changed = true;
        report.transformed.push(id);
    }
    if changed {
        node.transform.world = parent_world * node.transform.local;
    }
    if clear_keypoints {
        node.keypoints.clear();
    }
    let world = node.transform.world;

    let pose = if pose_root { Some(id) } else { pose };
    if let (true, Some(pose)) = (changed, pose) {
        pose_roots.insert(pose);
    }
    if local.is_some() {
        for target in targets {
            if let Some(target) = tree.node_mut(target) {
                target.transform.dirty = true;
                target.dirty = true;
            }
        }
    }
    for child in children {
        transform_pass(tree, child, world, changed, pose, pose_roots, report);
    }
}

fn refresh_keypoints(tree: &mut SceneTree, root: NodeId) {
    let Some(root_node) = tree.node(root) else {
        return;
    };
    if !is_pose_root(root_node) {
        return;
    }
    let root_world = root_node.transform.world;
    let to_root = if root_world.determinant().abs() > f32::EPSILON {
        root_world.inverse()
    } else {
        Mat4::IDENTITY
    };
    let keypoints = tree
        .subtree(root)
        .into_iter()
        .filter_map(|id| tree.node(id))
        .filter(|node| node.kind() == NodeKind::Keypoint)
        .filter(|node| PoseWatcher::pose_root(tree, node.parent()) == Some(root))
        .map(|node| {
            let name = match node.name() {
                "" => format!("keypoint_{}", node.id().raw()),
                name => name.to_string(),
            };
            let position = to_root.transform_point3(node.transform.world.w_axis.truncate());
            (name, position)
        })
        .collect();
    if let Some(root_node) = tree.node_mut(root) {
        root_node.keypoints = keypoints;
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_PI_2;
    use std::time::Duration;

    use super::*;
    use crate::model::{NewNode, VertexData};
    use crate::watchers::test_support::{add, id};

    fn engine() -> RebuildEngine {
        RebuildEngine::default()
    }

    fn translation(model: &Model, raw: u64) -> Vec3 {
        model
            .node(id(raw))
            .expect("node")
            .transform()
            .world
            .w_axis
            .truncate()
    }

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1.0e-4
    }

    fn mesh_bytes(model: &Model, raw: u64) -> Vec<u8> {
        model
            .node(id(raw))
            .expect("node")
            .mesh()
            .expect("mesh")
            .as_bytes()
            .to_vec()
    }

    #[test]
    fn clean_model_is_left_alone() {
        let mut model = Model::new();
        let report = engine().run_frame(&mut model).expect("frame");
        assert_eq!(report.passes, 0);
        assert!(report.is_empty());
    }

    #[test]
    fn cuboid_builds_mesh_and_preview() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Cuboid, None);
        model
            .set_value(id(1), C::Color, ComponentValue::Color([1.0, 0.0, 0.0, 1.0]))
            .expect("color");
        let report = engine().run_frame(&mut model).expect("frame");
        assert_eq!(report.rebuilt, vec![id(1)]);

        let node = model.node(id(1)).expect("node");
        let solid = node.solid().expect("solid");
        assert_eq!(solid.triangle_count(), 12);
        let mesh = node.mesh().expect("mesh");
        assert_eq!(mesh.triangle_count(), 12);
        assert!(mesh.vertices.iter().all(|v| v.color == [1.0, 0.0, 0.0, 1.0]));
        assert!(node.preview().is_some());
        assert!(!node.geometry_dirty());
        assert!(!node.is_dirty());
        assert!(!model.is_dirty());
    }

    #[test]
    fn degenerate_cuboid_resolves_to_no_solid() {
        let mut model = Model::new();
        model
            .create_node(
                NewNode::new(id(1), NodeKind::Cuboid)
                    .with(C::Size, ComponentValue::Vec3([0.0, 1.0, 1.0])),
            )
            .expect("create");
        let report = engine().run_frame(&mut model).expect("frame");
        assert!(report.failed.is_empty());
        let node = model.node(id(1)).expect("node");
        assert!(node.solid().is_none());
        assert!(node.mesh().is_none());
    }

    #[test]
    fn torus_with_inverted_radii_is_empty() {
        let mut model = Model::new();
        model
            .create_node(
                NewNode::new(id(1), NodeKind::Torus)
                    .with(C::Radius, ComponentValue::Float(0.5))
                    .with(C::InnerRadius, ComponentValue::Float(0.75)),
            )
            .expect("create");
        engine().run_frame(&mut model).expect("frame");
        assert!(model.node(id(1)).expect("node").solid().is_none());
    }

    #[test]
    fn rebuilding_is_byte_identical() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Group, None);
        add(&mut model, 2, NodeKind::Ellipsoid, Some(1));
        model
            .set_value(id(2), C::Position, ComponentValue::Vec3([0.5, 0.0, 0.0]))
            .expect("position");
        let mut engine = engine();
        engine.run_frame(&mut model).expect("frame");
        let first = mesh_bytes(&model, 1);

        let report = engine.run_frame(&mut model).expect("clean frame");
        assert!(report.is_empty());
        assert_eq!(mesh_bytes(&model, 1), first);

        model.invalidate_all();
        engine.run_frame(&mut model).expect("full rebuild");
        assert_eq!(mesh_bytes(&model, 1), first);
    }

    #[test]
    fn group_bakes_child_transform() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Group, None);
        add(&mut model, 2, NodeKind::Cuboid, Some(1));
        model
            .set_value(id(2), C::Position, ComponentValue::Vec3([2.0, 0.0, 0.0]))
            .expect("position");
        engine().run_frame(&mut model).expect("frame");
        let (min, max) = model
            .node(id(1))
            .expect("group")
            .solid()
            .expect("solid")
            .bounds()
            .expect("bounds");
        assert!((min[0] - 1.5).abs() < 1.0e-5);
        assert!((max[0] - 2.5).abs() < 1.0e-5);
    }

    #[test]
    fn group_of_only_subtractive_children_is_empty() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Group, None);
        add(&mut model, 2, NodeKind::Cuboid, Some(1));
        model
            .set_value(id(2), C::Subtract, ComponentValue::Bool(true))
            .expect("subtract");
        engine().run_frame(&mut model).expect("frame");
        assert!(model.node(id(1)).expect("group").solid().is_none());
    }

    #[test]
    fn hidden_children_do_not_compose() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Intersect, None);
        add(&mut model, 2, NodeKind::Cuboid, Some(1));
        let mut engine = engine();
        engine.run_frame(&mut model).expect("frame");
        assert!(model.node(id(1)).expect("node").solid().is_some());

        model
            .set_value(id(2), C::Visible, ComponentValue::Bool(false))
            .expect("hide");
        engine.run_frame(&mut model).expect("frame");
        assert!(model.node(id(1)).expect("node").solid().is_none());
    }

    #[test]
    fn mirror_reflects_transform_and_caches_geometry() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Cuboid, None);
        model
            .set_value(id(1), C::Position, ComponentValue::Vec3([2.0, 1.0, 0.0]))
            .expect("position");
        model
            .create_node(NewNode::new(id(2), NodeKind::Cuboid).instance_of(id(1)))
            .expect("mirror");
        let report = engine().run_frame(&mut model).expect("frame");
        assert!(report.mirrored.contains(&id(2)));

        assert!(close(translation(&model, 2), Vec3::new(-2.0, 1.0, 0.0)));
        let mirror = model.node(id(2)).expect("mirror");
        assert!(mirror.solid().is_some());
        assert!(mirror.mesh().is_some());
        assert!(!mirror.instance_mesh_dirty());
        let source = model.node(id(1)).expect("source");
        assert!(source.mirror_geometry().contains_key(&[-1, 1, 1]));
    }

    #[test]
    fn identity_flip_shares_source_mesh() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Ellipsoid, None);
        model
            .create_node(
                NewNode::new(id(2), NodeKind::Ellipsoid)
                    .instance_of(id(1))
                    .with(C::FlipDirection, ComponentValue::Vec3([1.0, 1.0, 1.0])),
            )
            .expect("mirror");
        let mut engine = engine();
        engine.run_frame(&mut model).expect("frame");

        model.instance_mesh_updated(id(1), false);
        engine.run_frame(&mut model).expect("frame");
        let source = model.node(id(1)).expect("source").mesh().expect("mesh").clone();
        let mirror = model.node(id(2)).expect("mirror").mesh().expect("mesh").clone();
        assert!(Arc::ptr_eq(&source, &mirror));
    }

    #[test]
    fn source_edit_reaches_mirror_in_the_same_frame() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Cuboid, None);
        add(&mut model, 10, NodeKind::Group, None);
        model
            .create_node(NewNode::new(id(11), NodeKind::Cuboid).parent(id(10)).instance_of(id(1)))
            .expect("mirror");
        let mut engine = engine();
        engine.run_frame(&mut model).expect("frame");

        model
            .set_value(id(1), C::Size, ComponentValue::Vec3([4.0, 1.0, 1.0]))
            .expect("size");
        let report = engine.run_frame(&mut model).expect("frame");
        assert!(report.passes >= 2);
        let (min, max) = model
            .node(id(10))
            .expect("group")
            .solid()
            .expect("solid")
            .bounds()
            .expect("bounds");
        assert!((max[0] - min[0] - 4.0).abs() < 1.0e-4);
        assert!(!model.is_dirty());
    }

    #[test]
    fn mirror_ahead_of_its_source_settles_in_one_frame() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Group, None);
        add(&mut model, 2, NodeKind::Cuboid, Some(1));
        model
            .set_value(id(2), C::Position, ComponentValue::Vec3([2.0, 0.0, 0.0]))
            .expect("position");
        model
            .create_node(
                NewNode::new(id(3), NodeKind::Cuboid)
                    .parent(id(1))
                    .at(0)
                    .instance_of(id(2)),
            )
            .expect("mirror");
        assert_eq!(model.node(id(1)).expect("group").children(), &[id(3), id(2)]);

        let mut engine = engine();
        let report = engine.run_frame(&mut model).expect("frame");
        assert!(report.passes >= 2);
        let mirror = model.node(id(3)).expect("mirror");
        assert!(mirror.solid().is_some());
        assert!(!mirror.instance_mesh_dirty());
        let (min, max) = model
            .node(id(1))
            .expect("group")
            .solid()
            .expect("solid")
            .bounds()
            .expect("bounds");
        assert!((min[0] + 2.5).abs() < 1.0e-4, "min {min:?}");
        assert!((max[0] - 2.5).abs() < 1.0e-4, "max {max:?}");
        assert!(!model.is_dirty());

        model
            .set_value(id(2), C::Size, ComponentValue::Vec3([2.0, 1.0, 1.0]))
            .expect("size");
        engine.run_frame(&mut model).expect("frame");
        let (min, max) = model
            .node(id(1))
            .expect("group")
            .solid()
            .expect("solid")
            .bounds()
            .expect("bounds");
        assert!((min[0] + 3.0).abs() < 1.0e-4, "min {min:?}");
        assert!((max[0] - 3.0).abs() < 1.0e-4, "max {max:?}");
        assert!(!model.node(id(3)).expect("mirror").instance_mesh_dirty());
    }

    #[test]
    fn tube_without_cut_face_sides_uses_engine_default() {
        let mut model = Model::new();
        model
            .create_node(
                NewNode::new(id(1), NodeKind::Tube).with(C::CutFaceSides, ComponentValue::Int(0)),
            )
            .expect("tube");
        for (raw, y) in [(2, 0.0), (3, 2.0)] {
            model
                .create_node(
                    NewNode::new(id(raw), NodeKind::TubePoint)
                        .parent(id(1))
                        .with(C::Position, ComponentValue::Vec3([0.0, y, 0.0]))
                        .with(C::Radius, ComponentValue::Float(0.5)),
                )
                .expect("point");
        }

        let engine = engine();
        let node = model.node(id(1)).expect("tube");
        let rule = GeometryRule::from_node(node).expect("rule");
        let GeometryRule::Tube { options } = &rule else {
            panic!("expected a tube rule");
        };
        assert!(options.cut_face.is_empty());

        let built = engine
            .build(model.tree(), node, &rule)
            .expect("build")
            .expect("solid");
        let mut hexagon = options.clone();
        hexagon.cut_face = regular_polygon(engine.settings().tube_sides);
        assert_eq!(hexagon.cut_face.len(), 6);
        let samples = [
            TubeSample::new(0.5, Vec3::ZERO),
            TubeSample::new(0.5, Vec3::new(0.0, 2.0, 0.0)),
        ];
        let expected = tube_solid(&samples, &hexagon, engine.settings().weld_tolerance)
            .expect("expected solid");
        assert_eq!(built, expected);
    }

    #[test]
    fn chain_links_follow_forward_kinematics() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Chain, None);
        add(&mut model, 2, NodeKind::ChainLink, Some(1));
        add(&mut model, 3, NodeKind::ChainLink, Some(1));
        model
            .set_value(id(2), C::Length, ComponentValue::Float(2.0))
            .expect("length");
        let mut engine = engine();
        engine.run_frame(&mut model).expect("frame");
        assert!(close(translation(&model, 3), Vec3::new(0.0, 2.0, 0.0)));

        model
            .set_value(id(2), C::Rotation, ComponentValue::Vec3([0.0, 0.0, FRAC_PI_2]))
            .expect("rotation");
        engine.run_frame(&mut model).expect("frame");
        assert!(close(translation(&model, 3), Vec3::new(-2.0, 0.0, 0.0)));
    }

    #[test]
    fn target_aims_parent_without_moving_itself() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Null, None);
        add(&mut model, 2, NodeKind::Target, Some(1));
        model
            .set_value(id(1), C::Position, ComponentValue::Vec3([0.0, 0.0, 5.0]))
            .expect("position");
        model
            .set_value(id(2), C::Position, ComponentValue::Vec3([3.0, 0.0, 0.0]))
            .expect("target");
        engine().run_frame(&mut model).expect("frame");

        let world = model.node(id(1)).expect("node").transform().world;
        assert!(close(world.transform_vector3(Vec3::Z), Vec3::X));
        assert!(close(translation(&model, 2), Vec3::new(3.0, 0.0, 5.0)));
    }

    #[test]
    fn pose_root_caches_keypoints_in_its_space() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Pose, None);
        add(&mut model, 2, NodeKind::Null, Some(1));
        add(&mut model, 3, NodeKind::Keypoint, Some(2));
        add(&mut model, 4, NodeKind::Keypoint, Some(1));
        model
            .set_value(id(1), C::Position, ComponentValue::Vec3([5.0, 0.0, 0.0]))
            .expect("root");
        model
            .set_value(id(2), C::Position, ComponentValue::Vec3([0.0, 1.0, 0.0]))
            .expect("null");
        model
            .set_value(id(3), C::Name, ComponentValue::String("hand".to_string()))
            .expect("name");
        model
            .set_value(id(3), C::Position, ComponentValue::Vec3([1.0, 0.0, 0.0]))
            .expect("keypoint");
        let mut engine = engine();
        engine.run_frame(&mut model).expect("frame");

        let keypoints = model.node(id(1)).expect("pose").keypoints().clone();
        assert!(close(keypoints["hand"], Vec3::new(1.0, 1.0, 0.0)));
        assert!(close(keypoints["keypoint_4"], Vec3::ZERO));

        model
            .set_value(id(3), C::Position, ComponentValue::Vec3([2.0, 0.0, 0.0]))
            .expect("keypoint");
        engine.run_frame(&mut model).expect("frame");
        let keypoints = model.node(id(1)).expect("pose").keypoints();
        assert!(close(keypoints["hand"], Vec3::new(2.0, 1.0, 0.0)));
    }

    #[test]
    fn throttle_defers_rapid_rebuilds() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Cuboid, None);
        let mut engine = RebuildEngine::new(EngineSettings {
            throttle_ms: 100,
            ..EngineSettings::default()
        });
        let start = Instant::now();
        engine.run_frame_at(&mut model, start).expect("frame");

        model
            .set_value(id(1), C::Size, ComponentValue::Vec3([2.0, 2.0, 2.0]))
            .expect("size");
        let report = engine
            .run_frame_at(&mut model, start + Duration::from_millis(10))
            .expect("frame");
        assert_eq!(report.deferred, vec![id(1)]);
        assert!(model.node(id(1)).expect("node").geometry_dirty());
        assert!(model.is_dirty());

        let report = engine
            .run_frame_at(&mut model, start + Duration::from_millis(200))
            .expect("frame");
        assert_eq!(report.rebuilt, vec![id(1)]);
        let (min, max) = model
            .node(id(1))
            .expect("node")
            .solid()
            .expect("solid")
            .bounds()
            .expect("bounds");
        assert!((max[0] - min[0] - 2.0).abs() < 1.0e-5);
        assert!(!model.is_dirty());
    }

    #[test]
    fn partial_vertex_update_keeps_the_patched_mesh() {
        let mut model = Model::new();
        let positions: [[f32; 3]; 4] = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        let faces: [u32; 12] = [0, 2, 1, 0, 1, 3, 0, 3, 2, 1, 2, 3];
        model
            .create_node(
                NewNode::new(id(1), NodeKind::Mesh)
                    .with(
                        C::Vertices,
                        ComponentValue::Bytes(bytemuck::cast_slice(&positions).to_vec()),
                    )
                    .with(
                        C::Faces,
                        ComponentValue::Bytes(bytemuck::cast_slice(&faces).to_vec()),
                    ),
            )
            .expect("create");
        let mut engine = engine();
        engine.run_frame(&mut model).expect("frame");

        model
            .update_vertices(
                id(1),
                C::Vertices,
                &[3],
                VertexData::Positions(vec![[0.0, 0.0, 2.0]]),
            )
            .expect("update");
        let patched = model.node(id(1)).expect("node").mesh().expect("mesh").clone();
        assert!(patched
            .vertices
            .iter()
            .zip(&patched.source_indices)
            .filter(|(_, source)| **source == 3)
            .all(|(vertex, _)| vertex.position == [0.0, 0.0, 2.0]));

        let report = engine.run_frame(&mut model).expect("frame");
        assert_eq!(report.partial, vec![id(1)]);
        assert!(report.rebuilt.is_empty());
        let node = model.node(id(1)).expect("node");
        assert!(Arc::ptr_eq(node.mesh().expect("mesh"), &patched));
        assert_eq!(node.solid().expect("solid").positions[3], [0.0, 0.0, 2.0]);
        assert!(!node.slot(C::Vertices).expect("slot").partial_update);
    }

    #[test]
    fn tube_and_extrusion_read_their_point_children() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Tube, None);
        add(&mut model, 2, NodeKind::TubePoint, Some(1));
        add(&mut model, 10, NodeKind::CurveExtrusion, None);
        add(&mut model, 11, NodeKind::ControlPoint, Some(10));
        add(&mut model, 12, NodeKind::ControlPoint, Some(10));
        model
            .set_value(id(12), C::Position, ComponentValue::Vec3([0.0, 0.0, 3.0]))
            .expect("position");
        let mut engine = engine();
        engine.run_frame(&mut model).expect("frame");
        assert!(model.node(id(1)).expect("tube").solid().is_some());
        assert!(model.node(id(10)).expect("extrusion").solid().is_some());

        model.remove_node(id(12));
        engine.run_frame(&mut model).expect("frame");
        assert!(model.node(id(10)).expect("extrusion").solid().is_none());
    }

    #[test]
    fn non_geometry_kinds_have_no_rule() {
        let node = Node::new(id(5), NodeKind::Null);
        assert_eq!(
            GeometryRule::from_node(&node),
            Err(ModelError::NotGeometry(id(5)))
        );
        let node = Node::new(id(6), NodeKind::Cuboid);
        assert!(GeometryRule::from_node(&node).expect("rule").is_leaf());
    }
}
