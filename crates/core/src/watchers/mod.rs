use std::collections::BTreeSet;

use crate::component::ComponentKind;
use crate::model::SceneTree;
use crate::node::NodeId;

mod chain;
mod composition;
mod pose;
mod shape;
mod target;
mod transform;

pub use chain::ChainWatcher;
pub use composition::CompositionWatcher;
pub use pose::PoseWatcher;
pub use shape::ShapeWatcher;
pub use target::TargetWatcher;
pub use transform::TransformWatcher;

/// Dirty flags requested by watchers for one mutation. The model applies
/// them once every watcher has run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyMarks {
    pub transform: BTreeSet<NodeId>,
    pub geometry: BTreeSet<NodeId>,
}

impl DirtyMarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.transform.is_empty() && self.geometry.is_empty()
    }

    pub fn mark_transform(&mut self, node: NodeId) {
        self.transform.insert(node);
    }

    pub fn mark_geometry(&mut self, node: NodeId) {
        self.geometry.insert(node);
    }

    /// Marks `from` and its ancestors for geometry rebuild, stopping at the
    /// first node that has no geometry slot or that mirrors another node.
    pub fn geometry_upwards(&mut self, tree: &SceneTree, from: Option<NodeId>) {
        let mut current = from;
        while let Some(id) = current {
            let Some(node) = tree.node(id) else {
                break;
            };
            if !node.is_geometry() || node.is_mirror() {
                break;
            }
            self.geometry.insert(id);
            current = node.parent();
        }
    }

    pub fn merge(&mut self, other: DirtyMarks) {
        self.transform.extend(other.transform);
        self.geometry.extend(other.geometry);
    }
}

/// Observer invoked synchronously, in registration order, for every model
/// mutation. Watchers only request dirty marks; they never reshape the tree
/// or write component values.
pub trait Watcher {
    fn name(&self) -> &'static str;

    fn on_value_changed(
        &mut self,
        _tree: &SceneTree,
        _node: NodeId,
        _component: ComponentKind,
        _marks: &mut DirtyMarks,
    ) {
    }

    fn on_moved(
        &mut self,
        _tree: &SceneTree,
        _node: NodeId,
        _old_parent: Option<NodeId>,
        _new_parent: Option<NodeId>,
        _marks: &mut DirtyMarks,
    ) {
    }

    fn on_child_added(
        &mut self,
        _tree: &SceneTree,
        _parent: NodeId,
        _child: NodeId,
        _marks: &mut DirtyMarks,
    ) {
    }

    fn on_before_child_removed(
        &mut self,
        _tree: &SceneTree,
        _parent: NodeId,
        _child: NodeId,
        _marks: &mut DirtyMarks,
    ) {
    }
}

pub fn default_watchers() -> Vec<Box<dyn Watcher>> {
    vec![
        Box::new(TransformWatcher),
        Box::new(ShapeWatcher),
        Box::new(CompositionWatcher),
        Box::new(TargetWatcher),
        Box::new(ChainWatcher),
        Box::new(PoseWatcher),
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::model::{Model, NewNode};
    use crate::node::{NodeId, NodeKind};

    pub fn id(raw: u64) -> NodeId {
        NodeId::new(raw)
    }

    pub fn add(model: &mut Model, raw: u64, kind: NodeKind, parent: Option<u64>) {
        let mut new = NewNode::new(id(raw), kind);
        if let Some(parent) = parent {
            new = new.parent(id(parent));
        }
        model.create_node(new).expect("create node");
    }
}
