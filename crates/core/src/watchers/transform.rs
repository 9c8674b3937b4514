use crate::component::{Affects, ComponentKind};
use crate::model::SceneTree;
use crate::node::NodeId;

use super::{DirtyMarks, Watcher};

/// Transform edits flag the node's own matrix and invalidate the geometry
/// of the composites that embed it.
pub struct TransformWatcher;

impl Watcher for TransformWatcher {
    fn name(&self) -> &'static str {
        "transform"
    }

    fn on_value_changed(
        &mut self,
        tree: &SceneTree,
        node: NodeId,
        component: ComponentKind,
        marks: &mut DirtyMarks,
    ) {
        if component.descriptor().affects != Affects::Transform {
            return;
        }
        marks.mark_transform(node);
        let parent = tree.node(node).and_then(|node| node.parent());
        marks.geometry_upwards(tree, parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::node::NodeKind;
    use crate::watchers::test_support::{add, id};

    #[test]
    fn position_marks_own_transform_and_composite_parents() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Group, None);
        add(&mut model, 2, NodeKind::Group, Some(1));
        add(&mut model, 3, NodeKind::Cuboid, Some(2));

        let mut marks = DirtyMarks::new();
        TransformWatcher.on_value_changed(model.tree(), id(3), ComponentKind::Position, &mut marks);
        assert_eq!(marks.transform, [id(3)].into_iter().collect());
        assert_eq!(marks.geometry, [id(1), id(2)].into_iter().collect());
    }

    #[test]
    fn shape_components_are_ignored() {
        let mut model = Model::new();
        add(&mut model, 1, NodeKind::Cuboid, None);
        let mut marks = DirtyMarks::new();
        TransformWatcher.on_value_changed(model.tree(), id(1), ComponentKind::Size, &mut marks);
        assert!(marks.is_empty());
    }
}
