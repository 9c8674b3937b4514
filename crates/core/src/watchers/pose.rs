use crate::component::ComponentKind;
use crate::model::SceneTree;
use crate::node::{NodeId, NodeKind};

use super::{DirtyMarks, Watcher};

/// Keypoint edits refresh the keypoint cache of the nearest pose root above
/// them.
pub struct PoseWatcher;

impl PoseWatcher {
    fn is_keypoint(tree: &SceneTree, node: NodeId) -> bool {
        tree.node(node)
            .map(|node| node.kind() == NodeKind::Keypoint)
            .unwrap_or(false)
    }

    pub fn pose_root(tree: &SceneTree, from: Option<NodeId>) -> Option<NodeId> {
        let mut current = from;
        while let Some(id) = current {
            let node = tree.node(id)?;
            if node.kind() == NodeKind::Pose && node.bool(ComponentKind::PoseRoot).unwrap_or(false)
            {
                return Some(id);
            }
            current = node.parent();
        }
        None
    }

    fn refresh(tree: &SceneTree, from: Option<NodeId>, marks: &mut DirtyMarks) {
        if let Some(root) = Self::pose_root(tree, from) {
            marks.mark_transform(root);
        }
    }
}

impl Watcher for PoseWatcher {
    fn name(&self) -> &'static str {
        "pose"
    }

    fn on_value_changed(
        &mut self,
        tree: &SceneTree,
        node: NodeId,
        component: ComponentKind,
        marks: &mut DirtyMarks,
    ) {
        if component == ComponentKind::PoseRoot {
            marks.mark_transform(node);
            return;
        }
        if Self::is_keypoint(tree, node) {
            let parent = tree.node(node).and_then(|node| node.parent());
            Self::refresh(tree, parent, marks);
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
        if Self::is_keypoint(tree, node) {
            Self::refresh(tree, old_parent, marks);
            Self::refresh(tree, new_parent, marks);
        }
    }

    fn on_child_added(
        &mut self,
        tree: &SceneTree,
        parent: NodeId,
        child: NodeId,
        marks: &mut DirtyMarks,
    ) {
        if Self::is_keypoint(tree, child) {
            Self::refresh(tree, Some(parent), marks);
        }
    }

    fn on_before_child_removed(
        &mut self,
        tree: &SceneTree,
        parent: NodeId,
        child: NodeId,
        marks: &mut DirtyMarks,
    ) {
        if Self::is_keypoint(tree, child) {
            Self::refresh(tree, Some(parent), marks);
        }
    }
}
