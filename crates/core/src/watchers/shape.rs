use crate::component::{Affects, ComponentKind};
use crate::model::SceneTree;
use crate::node::NodeId;

use super::{DirtyMarks, Watcher};

/// Shape parameters invalidate the node's own solid. Parameter-only nodes
/// such as tube points invalidate the solid they feed instead.
pub struct ShapeWatcher;

impl Watcher for ShapeWatcher {
    fn name(&self) -> &'static str {
        "shape"
    }

    fn on_value_changed(
        &mut self,
        tree: &SceneTree,
        node: NodeId,
        component: ComponentKind,
        marks: &mut DirtyMarks,
    ) {
        if component.descriptor().affects != Affects::Shape {
            return;
        }
        let Some(owner) = tree.node(node) else {
            return;
        };
        if owner.is_geometry() {
            marks.geometry_upwards(tree, Some(node));
        } else {
            marks.geometry_upwards(tree, owner.parent());
        }
    }
}
