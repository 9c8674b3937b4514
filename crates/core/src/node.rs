use std::collections::BTreeMap;
use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};
use serde::{Deserialize, Serialize};
use solidtree_scene::RenderMesh;

use crate::component::{ComponentKind, ComponentSlot, ComponentValue, ValueType};
use crate::model::ModelError;
use crate::solid::{MirrorCache, Solid};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

use ComponentKind as C;

const TRANSFORM: [ComponentKind; 6] = [
    C::Name,
    C::Visible,
    C::Position,
    C::Rotation,
    C::Scale,
    C::NonUniformScale,
];

const SOLID: [ComponentKind; 9] = [
    C::Name,
    C::Visible,
    C::Position,
    C::Rotation,
    C::Scale,
    C::NonUniformScale,
    C::Geometry,
    C::Subtract,
    C::Color,
];

macro_rules! solid_with {
    ($($extra:ident),* $(,)?) => {
        &[
            C::Name,
            C::Visible,
            C::Position,
            C::Rotation,
            C::Scale,
            C::NonUniformScale,
            C::Geometry,
            C::Subtract,
            C::Color,
            $(C::$extra),*
        ]
    };
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    Null,
    Group,
    Intersect,
    Hull,
    HullChain,
    Ellipsoid,
    Cuboid,
    Cylinder,
    EllipticCylinder,
    Torus,
    CurveExtrusion,
    ControlPoint,
    Tube,
    TubePoint,
    Mesh,
    Target,
    Chain,
    ChainLink,
    Pose,
    Keypoint,
}

impl NodeKind {
    pub const ALL: [NodeKind; 20] = [
        NodeKind::Null,
        NodeKind::Group,
        NodeKind::Intersect,
        NodeKind::Hull,
        NodeKind::HullChain,
        NodeKind::Ellipsoid,
        NodeKind::Cuboid,
        NodeKind::Cylinder,
        NodeKind::EllipticCylinder,
        NodeKind::Torus,
        NodeKind::CurveExtrusion,
        NodeKind::ControlPoint,
        NodeKind::Tube,
        NodeKind::TubePoint,
        NodeKind::Mesh,
        NodeKind::Target,
        NodeKind::Chain,
        NodeKind::ChainLink,
        NodeKind::Pose,
        NodeKind::Keypoint,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Null => "null",
            NodeKind::Group => "group",
            NodeKind::Intersect => "intersect",
            NodeKind::Hull => "hull",
            NodeKind::HullChain => "hull_chain",
            NodeKind::Ellipsoid => "ellipsoid",
            NodeKind::Cuboid => "cuboid",
            NodeKind::Cylinder => "cylinder",
            NodeKind::EllipticCylinder => "elliptic_cylinder",
            NodeKind::Torus => "torus",
            NodeKind::CurveExtrusion => "curve_extrusion",
            NodeKind::ControlPoint => "control_point",
            NodeKind::Tube => "tube",
            NodeKind::TubePoint => "tube_point",
            NodeKind::Mesh => "mesh",
            NodeKind::Target => "target",
            NodeKind::Chain => "chain",
            NodeKind::ChainLink => "chain_link",
            NodeKind::Pose => "pose",
            NodeKind::Keypoint => "keypoint",
        }
    }

    pub fn from_name(name: &str) -> Option<NodeKind> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Fixed component list for the kind. Mirrors additionally carry
    /// `FlipDirection`.
    pub fn components(self) -> &'static [ComponentKind] {
        match self {
            NodeKind::Null | NodeKind::Chain => &TRANSFORM,
            NodeKind::Group | NodeKind::Intersect | NodeKind::Hull | NodeKind::HullChain => &SOLID,
            NodeKind::Ellipsoid => solid_with!(Radii, Segments),
            NodeKind::Cuboid => solid_with!(Size, RoundRadius, Segments),
            NodeKind::Cylinder => solid_with!(Radius, Height, RoundRadius, Segments),
            NodeKind::EllipticCylinder => {
                solid_with!(EllipseRadii, Height, StartAngle, EndAngle, Segments)
            }
            NodeKind::Torus => solid_with!(Radius, InnerRadius, Segments, RingSegments),
            NodeKind::CurveExtrusion => solid_with!(
                Profile,
                StartSize,
                EndSize,
                StarPoints,
                StarInnerRatio,
                Slices,
                PreventTwist,
                Segments,
            ),
            NodeKind::Tube => solid_with!(Interpolate, RoundedEnds, CutFaceSides),
            NodeKind::Mesh => solid_with!(Vertices, Faces, VertexColors),
            NodeKind::ControlPoint | NodeKind::Target | NodeKind::Keypoint => {
                &[C::Name, C::Visible, C::Position]
            }
            NodeKind::TubePoint => &[C::Name, C::Visible, C::Position, C::Radius],
            NodeKind::ChainLink => &[C::Name, C::Visible, C::Rotation, C::Length],
            NodeKind::Pose => &[
                C::Name,
                C::Visible,
                C::Position,
                C::Rotation,
                C::Scale,
                C::NonUniformScale,
                C::PoseRoot,
            ],
        }
    }

    pub fn is_geometry(self) -> bool {
        self.components().contains(&ComponentKind::Geometry)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformState {
    pub dirty: bool,
    pub local: Mat4,
    pub world: Mat4,
    pub temp: Option<Mat4>,
    pub use_temp_mat: bool,
}

impl Default for TransformState {
    fn default() -> Self {
        Self {
            dirty: true,
            local: Mat4::IDENTITY,
            world: Mat4::IDENTITY,
            temp: None,
            use_temp_mat: false,
        }
    }
}

impl TransformState {
    /// Matrix to draw with: the temporary matrix while a drag preview is
    /// active, otherwise the world matrix.
    pub fn render_matrix(&self) -> Mat4 {
        match (self.use_temp_mat, self.temp) {
            (true, Some(temp)) => temp,
            _ => self.world,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) components: BTreeMap<ComponentKind, ComponentSlot>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) dirty: bool,
    pub(crate) deleted: bool,
    pub(crate) instance_id: Option<NodeId>,
    pub(crate) instance_mesh_dirty: bool,
    pub(crate) instance_mesh_rebuild: bool,
    pub(crate) expanded: bool,
    pub(crate) opacity: f32,
    pub(crate) transform: TransformState,
    pub(crate) mesh: Option<Arc<RenderMesh>>,
    pub(crate) preview: Option<Arc<RenderMesh>>,
    pub(crate) mirror_geometry: MirrorCache,
    pub(crate) keypoints: BTreeMap<String, Vec3>,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind) -> Self {
        let components = kind
            .components()
            .iter()
            .map(|component| (*component, ComponentSlot::with_default(*component)))
            .collect();
        let mut node = Self {
            id,
            kind,
            components,
            parent: None,
            children: Vec::new(),
            dirty: true,
            deleted: false,
            instance_id: None,
            instance_mesh_dirty: false,
            instance_mesh_rebuild: false,
            expanded: false,
            opacity: 1.0,
            transform: TransformState::default(),
            mesh: None,
            preview: None,
            mirror_geometry: MirrorCache::new(),
            keypoints: BTreeMap::new(),
        };
        if let Some(slot) = node.components.get_mut(&ComponentKind::Geometry) {
            slot.dirty = true;
        }
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn instance_id(&self) -> Option<NodeId> {
        self.instance_id
    }

    pub fn is_mirror(&self) -> bool {
        self.instance_id.is_some()
    }

    pub fn instance_mesh_dirty(&self) -> bool {
        self.instance_mesh_dirty
    }

    pub fn instance_mesh_rebuild(&self) -> bool {
        self.instance_mesh_rebuild
    }

    pub fn expanded(&self) -> bool {
        self.expanded
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn transform(&self) -> &TransformState {
        &self.transform
    }

    pub fn mesh(&self) -> Option<&Arc<RenderMesh>> {
        self.mesh.as_ref()
    }

    pub fn preview(&self) -> Option<&Arc<RenderMesh>> {
        self.preview.as_ref()
    }

    pub fn mirror_geometry(&self) -> &MirrorCache {
        &self.mirror_geometry
    }

    /// Keypoint positions in this pose root's space, by keypoint name.
    pub fn keypoints(&self) -> &BTreeMap<String, Vec3> {
        &self.keypoints
    }

    pub fn component_kinds(&self) -> impl Iterator<Item = ComponentKind> + '_ {
        self.components.keys().copied()
    }

    pub fn has_component(&self, component: ComponentKind) -> bool {
        self.components.contains_key(&component)
    }

    pub fn slot(&self, component: ComponentKind) -> Result<&ComponentSlot, ModelError> {
        self.components
            .get(&component)
            .ok_or(ModelError::ComponentMissing {
                node: self.id,
                component,
            })
    }

    pub(crate) fn slot_mut(
        &mut self,
        component: ComponentKind,
    ) -> Result<&mut ComponentSlot, ModelError> {
        let id = self.id;
        self.components
            .get_mut(&component)
            .ok_or(ModelError::ComponentMissing { node: id, component })
    }

    pub fn value(&self, component: ComponentKind) -> Result<&ComponentValue, ModelError> {
        self.slot(component).map(|slot| &slot.value)
    }

    fn mismatch(&self, component: ComponentKind, expected: ValueType) -> ModelError {
        let found = self
            .components
            .get(&component)
            .map(|slot| slot.value.value_type())
            .unwrap_or(expected);
        ModelError::TypeMismatch {
            component,
            expected,
            found,
        }
    }

    pub fn float(&self, component: ComponentKind) -> Result<f32, ModelError> {
        match self.value(component)? {
            ComponentValue::Float(v) => Ok(*v),
            _ => Err(self.mismatch(component, ValueType::Float)),
        }
    }

    pub fn int(&self, component: ComponentKind) -> Result<i32, ModelError> {
        match self.value(component)? {
            ComponentValue::Int(v) => Ok(*v),
            _ => Err(self.mismatch(component, ValueType::Int)),
        }
    }

    pub fn bool(&self, component: ComponentKind) -> Result<bool, ModelError> {
        match self.value(component)? {
            ComponentValue::Bool(v) => Ok(*v),
            _ => Err(self.mismatch(component, ValueType::Bool)),
        }
    }

    pub fn vec2(&self, component: ComponentKind) -> Result<Vec2, ModelError> {
        match self.value(component)? {
            ComponentValue::Vec2(v) => Ok(Vec2::from(*v)),
            _ => Err(self.mismatch(component, ValueType::Vec2)),
        }
    }

    pub fn vec3(&self, component: ComponentKind) -> Result<Vec3, ModelError> {
        match self.value(component)? {
            ComponentValue::Vec3(v) => Ok(Vec3::from(*v)),
            _ => Err(self.mismatch(component, ValueType::Vec3)),
        }
    }

    pub fn color(&self, component: ComponentKind) -> Result<[f32; 4], ModelError> {
        match self.value(component)? {
            ComponentValue::Color(v) => Ok(*v),
            _ => Err(self.mismatch(component, ValueType::Color)),
        }
    }

    pub fn string(&self, component: ComponentKind) -> Result<&str, ModelError> {
        match self.value(component)? {
            ComponentValue::String(v) => Ok(v.as_str()),
            _ => Err(self.mismatch(component, ValueType::String)),
        }
    }

    pub fn bytes(&self, component: ComponentKind) -> Result<&[u8], ModelError> {
        match self.value(component)? {
            ComponentValue::Bytes(v) => Ok(v.as_slice()),
            _ => Err(self.mismatch(component, ValueType::Bytes)),
        }
    }

    pub fn solid(&self) -> Option<&Arc<Solid>> {
        match self.components.get(&ComponentKind::Geometry) {
            Some(ComponentSlot {
                value: ComponentValue::Solid(solid),
                ..
            }) => solid.as_ref(),
            _ => None,
        }
    }

    pub fn geometry_dirty(&self) -> bool {
        self.components
            .get(&ComponentKind::Geometry)
            .map(|slot| slot.dirty)
            .unwrap_or(false)
    }

    pub fn visible(&self) -> bool {
        self.bool(ComponentKind::Visible).unwrap_or(true)
    }

    pub fn subtract(&self) -> bool {
        self.bool(ComponentKind::Subtract).unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        self.string(ComponentKind::Name).unwrap_or("")
    }

    pub fn is_geometry(&self) -> bool {
        self.kind.is_geometry()
    }
}
