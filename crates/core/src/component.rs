use std::sync::Arc;

use base64::Engine as _;
use serde_json::Value as JsonValue;

use crate::model::ModelError;
use crate::solid::Solid;

const FLOAT_TOLERANCE: f32 = 1.0e-6;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    Name,
    Visible,
    Position,
    Rotation,
    Scale,
    NonUniformScale,
    FlipDirection,
    Geometry,
    Subtract,
    Color,
    Radii,
    EllipseRadii,
    Radius,
    InnerRadius,
    Size,
    Height,
    RoundRadius,
    Segments,
    RingSegments,
    StartAngle,
    EndAngle,
    Profile,
    StartSize,
    EndSize,
    StarPoints,
    StarInnerRatio,
    Slices,
    PreventTwist,
    Interpolate,
    RoundedEnds,
    CutFaceSides,
    Vertices,
    Faces,
    VertexColors,
    Length,
    PoseRoot,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 36] = [
        ComponentKind::Name,
        ComponentKind::Visible,
        ComponentKind::Position,
        ComponentKind::Rotation,
        ComponentKind::Scale,
        ComponentKind::NonUniformScale,
        ComponentKind::FlipDirection,
        ComponentKind::Geometry,
        ComponentKind::Subtract,
        ComponentKind::Color,
        ComponentKind::Radii,
        ComponentKind::EllipseRadii,
        ComponentKind::Radius,
        ComponentKind::InnerRadius,
        ComponentKind::Size,
        ComponentKind::Height,
        ComponentKind::RoundRadius,
        ComponentKind::Segments,
        ComponentKind::RingSegments,
        ComponentKind::StartAngle,
        ComponentKind::EndAngle,
        ComponentKind::Profile,
        ComponentKind::StartSize,
        ComponentKind::EndSize,
        ComponentKind::StarPoints,
        ComponentKind::StarInnerRatio,
        ComponentKind::Slices,
        ComponentKind::PreventTwist,
        ComponentKind::Interpolate,
        ComponentKind::RoundedEnds,
        ComponentKind::CutFaceSides,
        ComponentKind::Vertices,
        ComponentKind::Faces,
        ComponentKind::VertexColors,
        ComponentKind::Length,
        ComponentKind::PoseRoot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Name => "name",
            ComponentKind::Visible => "visible",
            ComponentKind::Position => "position",
            ComponentKind::Rotation => "rotation",
            ComponentKind::Scale => "scale",
            ComponentKind::NonUniformScale => "non_uniform_scale",
            ComponentKind::FlipDirection => "flip_direction",
            ComponentKind::Geometry => "geometry",
            ComponentKind::Subtract => "subtract",
            ComponentKind::Color => "color",
            ComponentKind::Radii => "radii",
            ComponentKind::EllipseRadii => "ellipse_radii",
            ComponentKind::Radius => "radius",
            ComponentKind::InnerRadius => "inner_radius",
            ComponentKind::Size => "size",
            ComponentKind::Height => "height",
            ComponentKind::RoundRadius => "round_radius",
            ComponentKind::Segments => "segments",
            ComponentKind::RingSegments => "ring_segments",
            ComponentKind::StartAngle => "start_angle",
            ComponentKind::EndAngle => "end_angle",
            ComponentKind::Profile => "profile",
            ComponentKind::StartSize => "start_size",
            ComponentKind::EndSize => "end_size",
            ComponentKind::StarPoints => "star_points",
            ComponentKind::StarInnerRatio => "star_inner_ratio",
            ComponentKind::Slices => "slices",
            ComponentKind::PreventTwist => "prevent_twist",
            ComponentKind::Interpolate => "interpolate",
            ComponentKind::RoundedEnds => "rounded_ends",
            ComponentKind::CutFaceSides => "cut_face_sides",
            ComponentKind::Vertices => "vertices",
            ComponentKind::Faces => "faces",
            ComponentKind::VertexColors => "vertex_colors",
            ComponentKind::Length => "length",
            ComponentKind::PoseRoot => "pose_root",
        }
    }

    pub fn from_name(name: &str) -> Option<ComponentKind> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn descriptor(self) -> ComponentDescriptor {
        use ComponentKind as K;
        match self {
            K::Name => ComponentDescriptor::new(self, ValueType::String, Affects::Presentation, || {
                ComponentValue::String(String::new())
            }),
            K::Visible => {
                ComponentDescriptor::new(self, ValueType::Bool, Affects::Composition, || {
                    ComponentValue::Bool(true)
                })
                .instanceable()
            }
            K::Position | K::Rotation => {
                ComponentDescriptor::new(self, ValueType::Vec3, Affects::Transform, || {
                    ComponentValue::Vec3([0.0; 3])
                })
                .tolerant()
                .auto_copy()
            }
            K::Scale => ComponentDescriptor::new(self, ValueType::Float, Affects::Transform, || {
                ComponentValue::Float(1.0)
            })
            .tolerant()
            .auto_copy(),
            K::NonUniformScale => {
                ComponentDescriptor::new(self, ValueType::Vec3, Affects::Transform, || {
                    ComponentValue::Vec3([1.0; 3])
                })
                .tolerant()
                .auto_copy()
            }
            K::FlipDirection => {
                ComponentDescriptor::new(self, ValueType::Vec3, Affects::Transform, || {
                    ComponentValue::Vec3([-1.0, 1.0, 1.0])
                })
                .tolerant()
            }
            K::Geometry => {
                let mut descriptor =
                    ComponentDescriptor::new(self, ValueType::Solid, Affects::Cache, || {
                        ComponentValue::Solid(None)
                    });
                descriptor.persisted = false;
                descriptor.scheme = Scheme::Skip;
                descriptor.clone = Some(|_| ComponentValue::Solid(None));
                descriptor.equals = Some(|a, b| match (a, b) {
                    (ComponentValue::Solid(Some(a)), ComponentValue::Solid(Some(b))) => {
                        Arc::ptr_eq(a, b)
                    }
                    (ComponentValue::Solid(None), ComponentValue::Solid(None)) => true,
                    _ => false,
                });
                descriptor
            }
            K::Subtract => ComponentDescriptor::new(self, ValueType::Bool, Affects::Composition, || {
                ComponentValue::Bool(false)
            })
            .auto_copy(),
            K::Color => ComponentDescriptor::new(self, ValueType::Color, Affects::Shape, || {
                ComponentValue::Color([1.0, 1.0, 1.0, 1.0])
            })
            .tolerant()
            .auto_copy(),
            K::Radii => ComponentDescriptor::new(self, ValueType::Vec3, Affects::Shape, || {
                ComponentValue::Vec3([1.0; 3])
            })
            .tolerant()
            .auto_copy(),
            K::EllipseRadii | K::StartSize | K::EndSize => {
                ComponentDescriptor::new(self, ValueType::Vec2, Affects::Shape, || {
                    ComponentValue::Vec2([1.0, 1.0])
                })
                .tolerant()
                .auto_copy()
            }
            K::Radius | K::Height => {
                ComponentDescriptor::new(self, ValueType::Float, Affects::Shape, || {
                    ComponentValue::Float(1.0)
                })
                .tolerant()
                .auto_copy()
            }
            K::InnerRadius => {
                ComponentDescriptor::new(self, ValueType::Float, Affects::Shape, || {
                    ComponentValue::Float(0.25)
                })
                .tolerant()
                .auto_copy()
            }
            K::Size => ComponentDescriptor::new(self, ValueType::Vec3, Affects::Shape, || {
                ComponentValue::Vec3([1.0; 3])
            })
            .tolerant()
            .auto_copy(),
            K::RoundRadius | K::StartAngle => {
                ComponentDescriptor::new(self, ValueType::Float, Affects::Shape, || {
                    ComponentValue::Float(0.0)
                })
                .tolerant()
                .auto_copy()
            }
            K::EndAngle => ComponentDescriptor::new(self, ValueType::Float, Affects::Shape, || {
                ComponentValue::Float(std::f32::consts::TAU)
            })
            .tolerant()
            .auto_copy(),
            K::Segments | K::Slices => {
                ComponentDescriptor::new(self, ValueType::Int, Affects::Shape, || {
                    ComponentValue::Int(16)
                })
                .auto_copy()
            }
            K::RingSegments => ComponentDescriptor::new(self, ValueType::Int, Affects::Shape, || {
                ComponentValue::Int(8)
            })
            .auto_copy(),
            K::StarPoints => ComponentDescriptor::new(self, ValueType::Int, Affects::Shape, || {
                ComponentValue::Int(5)
            })
            .auto_copy(),
            K::CutFaceSides => {
                ComponentDescriptor::new(self, ValueType::Int, Affects::Shape, || {
                    ComponentValue::Int(6)
                })
                .auto_copy()
            }
            K::Profile => ComponentDescriptor::new(self, ValueType::String, Affects::Shape, || {
                ComponentValue::String("ellipse".to_string())
            })
            .auto_copy(),
            K::StarInnerRatio => {
                ComponentDescriptor::new(self, ValueType::Float, Affects::Shape, || {
                    ComponentValue::Float(0.5)
                })
                .tolerant()
                .auto_copy()
            }
            K::PreventTwist | K::Interpolate | K::RoundedEnds => {
                ComponentDescriptor::new(self, ValueType::Bool, Affects::Shape, || {
                    ComponentValue::Bool(true)
                })
                .auto_copy()
            }
            K::Vertices | K::Faces | K::VertexColors => {
                let mut descriptor =
                    ComponentDescriptor::new(self, ValueType::Bytes, Affects::Shape, || {
                        ComponentValue::Bytes(Vec::new())
                    })
                    .auto_copy();
                descriptor.scheme = Scheme::Base64;
                descriptor.clone = Some(|value| match value {
                    ComponentValue::Bytes(bytes) => ComponentValue::Bytes(bytes.to_vec()),
                    other => other.clone(),
                });
                descriptor
            }
            K::Length => ComponentDescriptor::new(self, ValueType::Float, Affects::Transform, || {
                ComponentValue::Float(1.0)
            })
            .tolerant()
            .auto_copy(),
            K::PoseRoot => ComponentDescriptor::new(self, ValueType::Bool, Affects::Cache, || {
                ComponentValue::Bool(true)
            }),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueType {
    Float,
    Int,
    Bool,
    Vec2,
    Vec3,
    Color,
    String,
    Bytes,
    Solid,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Scheme {
    Plain,
    Base64,
    Skip,
}

/// What a component change invalidates. Watchers dispatch on this.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Affects {
    Transform,
    Shape,
    Composition,
    Presentation,
    Cache,
}

#[derive(Debug, Clone, Copy)]
pub struct ComponentDescriptor {
    pub kind: ComponentKind,
    pub value_type: ValueType,
    pub persisted: bool,
    pub scheme: Scheme,
    pub equals: Option<fn(&ComponentValue, &ComponentValue) -> bool>,
    pub clone: Option<fn(&ComponentValue) -> ComponentValue>,
    pub instanceable: bool,
    pub auto_copy: bool,
    pub affects: Affects,
    pub default: fn() -> ComponentValue,
}

impl ComponentDescriptor {
    fn new(
        kind: ComponentKind,
        value_type: ValueType,
        affects: Affects,
        default: fn() -> ComponentValue,
    ) -> Self {
        Self {
            kind,
            value_type,
            persisted: true,
            scheme: Scheme::Plain,
            equals: None,
            clone: None,
            instanceable: false,
            auto_copy: false,
            affects,
            default,
        }
    }

    fn tolerant(mut self) -> Self {
        self.equals = Some(approx_equal);
        self
    }

    fn instanceable(mut self) -> Self {
        self.instanceable = true;
        self
    }

    fn auto_copy(mut self) -> Self {
        self.instanceable = true;
        self.auto_copy = true;
        self
    }

    pub fn values_equal(&self, a: &ComponentValue, b: &ComponentValue) -> bool {
        match self.equals {
            Some(equals) => equals(a, b),
            None => a == b,
        }
    }

    pub fn clone_value(&self, value: &ComponentValue) -> ComponentValue {
        match self.clone {
            Some(clone) => clone(value),
            None => value.clone(),
        }
    }

    pub fn encode(&self, value: &ComponentValue) -> Option<JsonValue> {
        match self.scheme {
            Scheme::Skip => None,
            Scheme::Base64 => match value {
                ComponentValue::Bytes(bytes) => Some(JsonValue::String(
                    base64::engine::general_purpose::STANDARD.encode(bytes),
                )),
                other => Some(encode_plain(other)),
            },
            Scheme::Plain => Some(encode_plain(value)),
        }
    }

    pub fn decode(&self, value: &JsonValue) -> Result<ComponentValue, ModelError> {
        let invalid = |reason: &str| ModelError::InvalidData {
            component: self.kind,
            reason: reason.to_string(),
        };
        match self.value_type {
            ValueType::Float => value
                .as_f64()
                .map(|v| ComponentValue::Float(v as f32))
                .ok_or_else(|| invalid("expected a number")),
            ValueType::Int => value
                .as_i64()
                .map(|v| ComponentValue::Int(v as i32))
                .ok_or_else(|| invalid("expected an integer")),
            ValueType::Bool => value
                .as_bool()
                .map(ComponentValue::Bool)
                .ok_or_else(|| invalid("expected a boolean")),
            ValueType::Vec2 => decode_floats::<2>(value)
                .map(ComponentValue::Vec2)
                .ok_or_else(|| invalid("expected an array of 2 numbers")),
            ValueType::Vec3 => decode_floats::<3>(value)
                .map(ComponentValue::Vec3)
                .ok_or_else(|| invalid("expected an array of 3 numbers")),
            ValueType::Color => decode_floats::<4>(value)
                .map(ComponentValue::Color)
                .ok_or_else(|| invalid("expected an array of 4 numbers")),
            ValueType::String => value
                .as_str()
                .map(|v| ComponentValue::String(v.to_string()))
                .ok_or_else(|| invalid("expected a string")),
            ValueType::Bytes => {
                let text = value.as_str().ok_or_else(|| invalid("expected base64 text"))?;
                base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .map(ComponentValue::Bytes)
                    .map_err(|err| invalid(&err.to_string()))
            }
            ValueType::Solid => Err(invalid("generated solids are not stored")),
        }
    }
}

fn encode_plain(value: &ComponentValue) -> JsonValue {
    match value {
        ComponentValue::Float(v) => JsonValue::from(*v as f64),
        ComponentValue::Int(v) => JsonValue::from(*v),
        ComponentValue::Bool(v) => JsonValue::from(*v),
        ComponentValue::Vec2(v) => JsonValue::from(v.iter().map(|c| *c as f64).collect::<Vec<_>>()),
        ComponentValue::Vec3(v) => JsonValue::from(v.iter().map(|c| *c as f64).collect::<Vec<_>>()),
        ComponentValue::Color(v) => {
            JsonValue::from(v.iter().map(|c| *c as f64).collect::<Vec<_>>())
        }
        ComponentValue::String(v) => JsonValue::from(v.as_str()),
        ComponentValue::Bytes(v) => JsonValue::from(v.clone()),
        ComponentValue::Solid(_) => JsonValue::Null,
    }
}

fn decode_floats<const N: usize>(value: &JsonValue) -> Option<[f32; N]> {
    let array = value.as_array()?;
    if array.len() != N {
        return None;
    }
    let mut out = [0.0f32; N];
    for (slot, item) in out.iter_mut().zip(array) {
        *slot = item.as_f64()? as f32;
    }
    Some(out)
}

fn approx_equal(a: &ComponentValue, b: &ComponentValue) -> bool {
    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len()
            && a
                .iter()
                .zip(b)
                .all(|(x, y)| (x - y).abs() <= FLOAT_TOLERANCE)
    }
    match (a, b) {
        (ComponentValue::Float(a), ComponentValue::Float(b)) => close(&[*a], &[*b]),
        (ComponentValue::Vec2(a), ComponentValue::Vec2(b)) => close(a, b),
        (ComponentValue::Vec3(a), ComponentValue::Vec3(b)) => close(a, b),
        (ComponentValue::Color(a), ComponentValue::Color(b)) => close(a, b),
        _ => a == b,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComponentValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Color([f32; 4]),
    String(String),
    Bytes(Vec<u8>),
    Solid(Option<Arc<Solid>>),
}

impl ComponentValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            ComponentValue::Float(_) => ValueType::Float,
            ComponentValue::Int(_) => ValueType::Int,
            ComponentValue::Bool(_) => ValueType::Bool,
            ComponentValue::Vec2(_) => ValueType::Vec2,
            ComponentValue::Vec3(_) => ValueType::Vec3,
            ComponentValue::Color(_) => ValueType::Color,
            ComponentValue::String(_) => ValueType::String,
            ComponentValue::Bytes(_) => ValueType::Bytes,
            ComponentValue::Solid(_) => ValueType::Solid,
        }
    }
}

/// One typed attribute on a node. `dirty` is only meaningful on the
/// geometry slot, `partial_update` only on per-vertex buffers.
#[derive(Debug, Clone)]
pub struct ComponentSlot {
    pub value: ComponentValue,
    pub dirty: bool,
    pub partial_update: bool,
}

impl ComponentSlot {
    pub fn new(value: ComponentValue) -> Self {
        Self {
            value,
            dirty: false,
            partial_update: false,
        }
    }

    pub fn with_default(kind: ComponentKind) -> Self {
        Self::new((kind.descriptor().default)())
    }

    /// Releases cached engine resources held by the slot.
    pub fn on_removed(&mut self) {
        match &mut self.value {
            ComponentValue::Solid(solid) => {
                solid.take();
            }
            ComponentValue::Bytes(bytes) => {
                bytes.clear();
                bytes.shrink_to_fit();
            }
            _ => {}
        }
        self.dirty = false;
        self.partial_update = false;
    }
}
