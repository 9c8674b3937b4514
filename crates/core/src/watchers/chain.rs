use crate::component::ComponentKind;
use crate::model::SceneTree;
use crate::node::{NodeId, NodeKind};

use super::{DirtyMarks, Watcher};

/// Chain links are posed by forward kinematics over their siblings, so a
/// change to one link moves every link after it.
pub struct ChainWatcher;

impl ChainWatcher {
    fn is_link(tree: &SceneTree, node: NodeId) -> bool {
        tree.node(node)
            .map(|node| node.kind() == NodeKind::ChainLink)
            .unwrap_or(false)
    }

    fn mark_links_from(
        tree: &SceneTree,
        parent: Option<NodeId>,
        start: usize,
        marks: &mut DirtyMarks,
    ) {
        for sibling in tree.siblings(parent).iter().skip(start) {
            if Self::is_link(tree, *sibling) {
                marks.mark_transform(*sibling);
            }
        }
    }
}

impl Watcher for ChainWatcher {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn on_value_changed(
        &mut self,
        tree: &SceneTree,
        node: NodeId,
        component: ComponentKind,
        marks: &mut DirtyMarks,
    ) {
        if !matches!(component, ComponentKind::Length | ComponentKind::Rotation)
            || !Self::is_link(tree, node)
        {
            return;
        }
        let parent = tree.node(node).and_then(|node| node.parent());
        if let Some(index) = tree.index_in_parent(node) {
            Self::mark_links_from(tree, parent, index, marks);
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
        if !Self::is_link(tree, node) {
            return;
        }
        Self::mark_links_from(tree, old_parent, 0, marks);
        if let Some(index) = tree.index_in_parent(node) {
            Self::mark_links_from(tree, new_parent, index, marks);
        }
    }

    fn on_child_added(
        &mut self,
        tree: &SceneTree,
        parent: NodeId,
        child: NodeId,
        marks: &mut DirtyMarks,
    ) {
        if !Self::is_link(tree, child) {
            return;
        }
        if let Some(index) = tree.index_in_parent(child) {
            Self::mark_links_from(tree, Some(parent), index, marks);
        }
    }

    fn on_before_child_removed(
        &mut self,
        tree: &SceneTree,
        parent: NodeId,
        child: NodeId,
        marks: &mut DirtyMarks,
    ) {
        if !Self::is_link(tree, child) {
            return;
        }
        if let Some(index) = tree.index_in_parent(child) {
            Self::mark_links_from(tree, Some(parent), index + 1, marks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::watchers::test_support::{add, id};

    fn chain() -> Model {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Chain, None);
        for link in 2..=5 {
            add(&mut model, link, NodeKind::ChainLink, Some(1));
        }
        model
    }

    #[test]
    fn length_change_marks_later_links_only() {
        let model = chain();
        let mut marks = DirtyMarks::new();
        ChainWatcher.on_value_changed(model.tree(), id(3), ComponentKind::Length, &mut marks);
        assert_eq!(marks.transform, [id(3), id(4), id(5)].into_iter().collect());
    }

    #[test]
    fn removal_marks_links_after_the_gap() {
        let model = chain();
        let mut marks = DirtyMarks::new();
        ChainWatcher.on_before_child_removed(model.tree(), id(1), id(4), &mut marks);
        assert_eq!(marks.transform, [id(5)].into_iter().collect());
    }

    #[test]
    fn name_change_is_ignored() {
        let model = chain();
        let mut marks = DirtyMarks::new();
        ChainWatcher.on_value_changed(model.tree(), id(2), ComponentKind::Name, &mut marks);
        assert!(marks.is_empty());
    }
}
