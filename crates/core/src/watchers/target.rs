use crate::component::ComponentKind;
use crate::model::SceneTree;
use crate::node::{NodeId, NodeKind};

use super::{DirtyMarks, Watcher};

/// Target nodes steer their parent's orientation, so any change to one
/// re-aims the parent.
pub struct TargetWatcher;

impl TargetWatcher {
    fn aim(tree: &SceneTree, parent: Option<NodeId>, marks: &mut DirtyMarks) {
        let Some(parent) = parent else {
            return;
        };
        marks.mark_transform(parent);
        let grandparent = tree.node(parent).and_then(|node| node.parent());
        marks.geometry_upwards(tree, grandparent);
    }

    fn is_target(tree: &SceneTree, node: NodeId) -> bool {
        tree.node(node)
            .map(|node| node.kind() == NodeKind::Target)
            .unwrap_or(false)
    }
}

impl Watcher for TargetWatcher {
    fn name(&self) -> &'static str {
        "target"
    }

    fn on_value_changed(
        &mut self,
        tree: &SceneTree,
        node: NodeId,
        _component: ComponentKind,
        marks: &mut DirtyMarks,
    ) {
        if Self::is_target(tree, node) {
            let parent = tree.node(node).and_then(|node| node.parent());
            Self::aim(tree, parent, marks);
        }
    }

    fn on_moved(
        &mut self,
        tree: &SceneTree,
        node: NodeId,
        old_parent: Option<NodeId>,
        new_parent: Option<NodeId>,
        marks: &mut DirtyMarks,
    ) {
        if Self::is_target(tree, node) {
            Self::aim(tree, old_parent, marks);
            Self::aim(tree, new_parent, marks);
        }
    }

    fn on_child_added(
        &mut self,
        tree: &SceneTree,
        parent: NodeId,
        child: NodeId,
        marks: &mut DirtyMarks,
    ) {
        if Self::is_target(tree, child) {
            Self::aim(tree, Some(parent), marks);
        }
    }

    fn on_before_child_removed(
        &mut self,
        tree: &SceneTree,
        parent: NodeId,
        child: NodeId,
        marks: &mut DirtyMarks,
    ) {
        if Self::is_target(tree, child) {
            Self::aim(tree, Some(parent), marks);
        }
    }
}
