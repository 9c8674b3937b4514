use crate::component::{Affects, ComponentKind};
use crate::model::SceneTree;
use crate::node::NodeId;

use super::{DirtyMarks, Watcher};

/// Visibility, sign and child list changes alter how a parent composes its
/// children, so they dirty the parent rather than the child.
pub struct CompositionWatcher;

impl Watcher for CompositionWatcher {
    fn name(&self) -> &'static str {
        "composition"
    }

    fn on_value_changed(
        &mut self,
        tree: &SceneTree,
        node: NodeId,
        component: ComponentKind,
        marks: &mut DirtyMarks,
    ) {
        if component.descriptor().affects != Affects::Composition {
            return;
        }
        let parent = tree.node(node).and_then(|node| node.parent());
        marks.geometry_upwards(tree, parent);
    }

    fn on_moved(
        &mut self,
        tree: &SceneTree,
        _node: NodeId,
        old_parent: Option<NodeId>,
        new_parent: Option<NodeId>,
        marks: &mut DirtyMarks,
    ) {
        marks.geometry_upwards(tree, old_parent);
        marks.geometry_upwards(tree, new_parent);
    }

    fn on_child_added(
        &mut self,
        tree: &SceneTree,
        parent: NodeId,
        _child: NodeId,
        marks: &mut DirtyMarks,
    ) {
        marks.geometry_upwards(tree, Some(parent));
    }

    fn on_before_child_removed(
        &mut self,
        tree: &SceneTree,
        parent: NodeId,
        _child: NodeId,
        marks: &mut DirtyMarks,
    ) {
        marks.geometry_upwards(tree, Some(parent));
    }
}
