mod component;
mod csg;
mod document;
mod extrude;
mod hull;
mod model;
mod node;
mod primitives;
mod rebuild;
mod scene;
mod settings;
mod solid;
mod throttle;
mod tube;
mod watchers;

pub use component::{
    Affects, ComponentDescriptor, ComponentKind, ComponentSlot, ComponentValue, Scheme, ValueType,
};
pub use csg::{boolean, intersect_all, merge_runs, union_all, BooleanOp, Composable};
pub use document::{NodeDescription, SceneDocument, DOCUMENT_VERSION};
pub use extrude::{curve_extrusion, fit_bezier, sample_path, LoftOptions, Profile};
pub use hull::{convex_hull, hull_chain};
pub use model::{Model, ModelError, NewNode, SceneTree, VertexData};
pub use node::{Node, NodeId, NodeKind, TransformState};
pub use primitives::{
    cuboid, cylinder, effective_round_radius, ellipsoid, elliptic_cylinder, torus, MIN_SEGMENTS,
    MIN_TORUS_SEGMENTS,
};
pub use rebuild::{GeometryRule, RebuildEngine, RebuildReport};
pub use scene::scene_snapshot;
pub use settings::EngineSettings;
pub use solid::{symmetry_key, MirrorCache, Solid};
pub use throttle::RebuildThrottle;
pub use tube::{build_tube, regular_polygon, tube_solid, TubeOptions, TubeSample};
pub use watchers::{
    default_watchers, ChainWatcher, CompositionWatcher, DirtyMarks, PoseWatcher, ShapeWatcher,
    TargetWatcher, TransformWatcher, Watcher,
};
