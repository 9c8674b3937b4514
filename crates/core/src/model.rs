use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use glam::Mat4;
use tracing::{debug, warn};

use crate::component::{ComponentKind, ComponentSlot, ComponentValue, ValueType};
use crate::node::{Node, NodeId, NodeKind};
use crate::watchers::{default_watchers, DirtyMarks, Watcher};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    DuplicateNode(NodeId),
    MissingNode(NodeId),
    ComponentMissing {
        node: NodeId,
        component: ComponentKind,
    },
    TypeMismatch {
        component: ComponentKind,
        expected: ValueType,
        found: ValueType,
    },
    UnknownNodeType(String),
    UnknownComponent(String),
    InvalidData {
        component: ComponentKind,
        reason: String,
    },
    InvalidMove {
        node: NodeId,
        parent: Option<NodeId>,
    },
    InstanceKindMismatch {
        node: NodeKind,
        source: NodeKind,
    },
    IndexOutOfRange {
        component: ComponentKind,
        index: usize,
        len: usize,
    },
    NotGeometry(NodeId),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::DuplicateNode(id) => write!(f, "node {id} already exists"),
            ModelError::MissingNode(id) => write!(f, "node {id} does not exist"),
            ModelError::ComponentMissing { node, component } => {
                write!(f, "node {node} has no '{}' component", component.name())
            }
            ModelError::TypeMismatch {
                component,
                expected,
                found,
            } => write!(
                f,
                "component '{}' expects {expected:?}, got {found:?}",
                component.name()
            ),
            ModelError::UnknownNodeType(name) => write!(f, "unknown node type '{name}'"),
            ModelError::UnknownComponent(name) => write!(f, "unknown component '{name}'"),
            ModelError::InvalidData { component, reason } => {
                write!(f, "invalid data for '{}': {reason}", component.name())
            }
            ModelError::InvalidMove { node, parent } => match parent {
                Some(parent) => write!(f, "cannot move node {node} under {parent}"),
                None => write!(f, "cannot move node {node} to the root list"),
            },
            ModelError::InstanceKindMismatch { node, source } => write!(
                f,
                "a {} node cannot mirror a {} node",
                node.name(),
                source.name()
            ),
            ModelError::IndexOutOfRange {
                component,
                index,
                len,
            } => write!(
                f,
                "index {index} out of range for '{}' with {len} entries",
                component.name()
            ),
            ModelError::NotGeometry(id) => write!(f, "node {id} has no geometry rule"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Node arena plus the ordered root list. Parent and child links are ids
/// into the arena.
#[derive(Debug, Clone, Default)]
pub struct SceneTree {
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    pub(crate) roots: Vec<NodeId>,
}

impl SceneTree {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Children of `parent`, or the root list when `parent` is `None`.
    pub fn siblings(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            None => &self.roots,
            Some(parent) => self
                .nodes
                .get(&parent)
                .map(|node| node.children.as_slice())
                .unwrap_or(&[]),
        }
    }

    pub fn index_in_parent(&self, id: NodeId) -> Option<usize> {
        let parent = self.nodes.get(&id)?.parent;
        self.siblings(parent).iter().position(|sibling| *sibling == id)
    }

    /// `id` and all of its descendants, parents before children.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = self.nodes.get(&id).and_then(|node| node.parent);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.nodes.get(&parent).and_then(|node| node.parent);
        }
        false
    }

    fn list_mut(&mut self, parent: Option<NodeId>) -> Option<&mut Vec<NodeId>> {
        match parent {
            None => Some(&mut self.roots),
            Some(parent) => self.nodes.get_mut(&parent).map(|node| &mut node.children),
        }
    }

    fn detach(&mut self, id: NodeId, parent: Option<NodeId>) {
        if let Some(list) = self.list_mut(parent) {
            list.retain(|child| *child != id);
        }
    }

    fn attach(&mut self, id: NodeId, parent: Option<NodeId>, index: usize) {
        if let Some(list) = self.list_mut(parent) {
            let index = index.min(list.len());
            list.insert(index, id);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = parent;
        }
    }

    pub(crate) fn mark_dirty_upwards(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let Some(node) = self.nodes.get_mut(&node_id) else {
                break;
            };
            node.dirty = true;
            current = node.parent;
        }
    }
}

/// Arguments for [`Model::create_node`].
#[derive(Debug, Clone)]
pub struct NewNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub index: Option<usize>,
    pub data: BTreeMap<ComponentKind, ComponentValue>,
    pub instance_of: Option<NodeId>,
}

impl NewNode {
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            parent: None,
            index: None,
            data: BTreeMap::new(),
            instance_of: None,
        }
    }

    pub fn parent(mut self, parent: NodeId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with(mut self, component: ComponentKind, value: ComponentValue) -> Self {
        self.data.insert(component, value);
        self
    }

    pub fn data(mut self, data: BTreeMap<ComponentKind, ComponentValue>) -> Self {
        self.data.extend(data);
        self
    }

    pub fn instance_of(mut self, source: NodeId) -> Self {
        self.instance_of = Some(source);
        self
    }
}

/// Replacement values for a partial per-vertex update.
#[derive(Debug, Clone, PartialEq)]
pub enum VertexData {
    Positions(Vec<[f32; 3]>),
    Colors(Vec<[u8; 4]>),
}

impl VertexData {
    fn len(&self) -> usize {
        match self {
            VertexData::Positions(values) => values.len(),
            VertexData::Colors(values) => values.len(),
        }
    }
}

pub struct Model {
    pub(crate) tree: SceneTree,
    pub(crate) reference_map: BTreeMap<NodeId, Vec<NodeId>>,
    pub(crate) selected: Vec<NodeId>,
    pub(crate) dirty: bool,
    pub(crate) instance_dirty: bool,
    watchers: Vec<Box<dyn Watcher>>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("nodes", &self.tree.len())
            .field("roots", &self.tree.roots)
            .field("selected", &self.selected)
            .field("dirty", &self.dirty)
            .field("instance_dirty", &self.instance_dirty)
            .field(
                "watchers",
                &self.watchers.iter().map(|w| w.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Self::with_watchers(default_watchers())
    }

    pub fn with_watchers(watchers: Vec<Box<dyn Watcher>>) -> Self {
        Self {
            tree: SceneTree::default(),
            reference_map: BTreeMap::new(),
            selected: Vec::new(),
            dirty: false,
            instance_dirty: false,
            watchers,
        }
    }

    pub fn tree(&self) -> &SceneTree {
        &self.tree
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, ModelError> {
        self.tree.node(id).ok_or(ModelError::MissingNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.tree.contains(id)
    }

    pub fn roots(&self) -> &[NodeId] {
        self.tree.roots()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_instance_dirty(&self) -> bool {
        self.instance_dirty
    }

    pub fn mirrors_of(&self, source: NodeId) -> &[NodeId] {
        self.reference_map
            .get(&source)
            .map(|mirrors| mirrors.as_slice())
            .unwrap_or(&[])
    }

    pub fn next_free_id(&self) -> NodeId {
        let last = self
            .tree
            .nodes
            .keys()
            .next_back()
            .map(|id| id.raw())
            .unwrap_or(0);
        NodeId::new(last + 1)
    }

    /// Pre-order traversal over the forest; stops when `visit` breaks.
    pub fn for_each<F>(&self, mut visit: F) -> ControlFlow<()>
    where
        F: FnMut(&Node) -> ControlFlow<()>,
    {
        for root in &self.tree.roots {
            for id in self.tree.subtree(*root) {
                if let Some(node) = self.tree.node(id) {
                    visit(node)?;
                }
            }
        }
        ControlFlow::Continue(())
    }

    pub fn create_node(&mut self, new: NewNode) -> Result<NodeId, ModelError> {
        let id = new.id;
        if self.tree.contains(id) {
            return Err(ModelError::DuplicateNode(id));
        }
        if let Some(parent) = new.parent {
            if !self.tree.contains(parent) {
                return Err(ModelError::MissingNode(parent));
            }
        }
        let source = match new.instance_of {
            Some(source) => Some(self.resolve_source(source, new.kind)?),
            None => None,
        };

        let mut node = Node::new(id, new.kind);
        if let Some(source) = source {
            let source_node = self.node(source)?;
            for (kind, slot) in &source_node.components {
                let descriptor = kind.descriptor();
                if descriptor.instanceable {
                    node.components.insert(
                        *kind,
                        ComponentSlot::new(descriptor.clone_value(&slot.value)),
                    );
                }
            }
            node.components.insert(
                ComponentKind::FlipDirection,
                ComponentSlot::with_default(ComponentKind::FlipDirection),
            );
            node.instance_id = Some(source);
            node.instance_mesh_dirty = true;
            node.instance_mesh_rebuild = true;
        }

        for (component, value) in &new.data {
            check_value(&node, *component, value)?;
        }
        for (component, value) in new.data {
            let descriptor = component.descriptor();
            let slot = node.slot_mut(component)?;
            slot.value = descriptor.clone_value(&value);
        }

        self.tree.nodes.insert(id, node);
        let siblings = self.tree.siblings(new.parent).len();
        self.tree
            .attach(id, new.parent, new.index.unwrap_or(siblings));
        if let Some(source) = source {
            self.reference_map.entry(source).or_default().push(id);
            self.instance_dirty = true;
        }
        self.tree.mark_dirty_upwards(id);
        self.dirty = true;
        debug!("created {} {id}", new.kind.name());

        if let Some(parent) = new.parent {
            self.notify(|watcher, tree, marks| watcher.on_child_added(tree, parent, id, marks));
        }
        Ok(id)
    }

    fn resolve_source(&self, requested: NodeId, kind: NodeKind) -> Result<NodeId, ModelError> {
        let mut source = requested;
        let mut seen = BTreeSet::new();
        loop {
            let node = self.node(source)?;
            match node.instance_id {
                Some(next) if seen.insert(source) => source = next,
                _ => break,
            }
        }
        let source_kind = self.node(source)?.kind;
        if source_kind != kind {
            return Err(ModelError::InstanceKindMismatch {
                node: kind,
                source: source_kind,
            });
        }
        Ok(source)
    }

    /// Removes `id` and its subtree. Returns false when the node is absent.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        let Some(parent) = self.tree.node(id).map(|node| node.parent) else {
            return false;
        };
        if let Some(parent) = parent {
            self.notify(|watcher, tree, marks| {
                watcher.on_before_child_removed(tree, parent, id, marks)
            });
        }

        let removed = self.tree.subtree(id);
        let removed_set: BTreeSet<NodeId> = removed.iter().copied().collect();
        for node_id in &removed {
            if let Some(node) = self.tree.node_mut(*node_id) {
                node.deleted = true;
            }
        }

        for node_id in &removed {
            let mirrors = self.mirrors_of(*node_id).to_vec();
            if !mirrors.is_empty() {
                self.instance_mesh_updated(*node_id, true);
            }
            for mirror in mirrors {
                if !removed_set.contains(&mirror) {
                    self.demote_mirror(mirror);
                }
            }
            self.reference_map.remove(node_id);
            let source = self.tree.node(*node_id).and_then(|node| node.instance_id);
            if let Some(source) = source {
                if let Some(list) = self.reference_map.get_mut(&source) {
                    list.retain(|mirror| mirror != node_id);
                    if list.is_empty() {
                        self.reference_map.remove(&source);
                    }
                }
            }
        }

        self.tree.detach(id, parent);
        self.selected.retain(|selected| !removed_set.contains(selected));
        for node_id in &removed {
            if let Some(mut node) = self.tree.nodes.remove(node_id) {
                node.mirror_geometry.clear();
                for slot in node.components.values_mut() {
                    slot.on_removed();
                }
                node.mesh = None;
                node.preview = None;
            }
        }
        if let Some(parent) = parent {
            self.tree.mark_dirty_upwards(parent);
        }
        self.dirty = true;
        debug!("removed node {id} ({} nodes in subtree)", removed.len());
        true
    }

    /// Turns a mirror whose source is gone into an authoritative node that
    /// keeps its last copied values.
    fn demote_mirror(&mut self, mirror: NodeId) {
        let Some(node) = self.tree.node_mut(mirror) else {
            return;
        };
        node.instance_id = None;
        node.instance_mesh_dirty = false;
        node.instance_mesh_rebuild = false;
        if let Some(mut slot) = node.components.remove(&ComponentKind::FlipDirection) {
            slot.on_removed();
        }
        warn!("mirror {mirror} lost its source; node is now authoritative");
        let mut marks = DirtyMarks::new();
        marks.mark_transform(mirror);
        marks.geometry_upwards(&self.tree, Some(mirror));
        self.apply_marks(marks);
    }

    /// Moves `id` under `new_parent` (or to the root list), next to
    /// `related` when given, otherwise at the start or end.
    pub fn move_node(
        &mut self,
        id: NodeId,
        new_parent: Option<NodeId>,
        related: Option<NodeId>,
        place_after: bool,
    ) -> Result<(), ModelError> {
        let old_parent = self.node(id)?.parent;
        if let Some(parent) = new_parent {
            self.node(parent)?;
            if parent == id || self.tree.is_ancestor(id, parent) {
                return Err(ModelError::InvalidMove {
                    node: id,
                    parent: new_parent,
                });
            }
        }
        if let Some(related) = related {
            let in_target = self.tree.siblings(new_parent).contains(&related);
            if related == id || !in_target {
                return Err(ModelError::InvalidMove {
                    node: id,
                    parent: new_parent,
                });
            }
        }

        self.tree.detach(id, old_parent);
        let siblings = self.tree.siblings(new_parent);
        let index = match related {
            Some(related) => {
                let position = siblings
                    .iter()
                    .position(|sibling| *sibling == related)
                    .unwrap_or(siblings.len());
                if place_after {
                    position + 1
                } else {
                    position
                }
            }
            None if place_after => siblings.len(),
            None => 0,
        };
        self.tree.attach(id, new_parent, index);

        if let Some(old_parent) = old_parent {
            self.tree.mark_dirty_upwards(old_parent);
        }
        let mut marks = DirtyMarks::new();
        marks.mark_transform(id);
        self.apply_marks(marks);
        debug!("moved node {id}");

        self.notify(|watcher, tree, marks| {
            watcher.on_moved(tree, id, old_parent, new_parent, marks)
        });
        Ok(())
    }

    /// Writes a component value. Returns `Ok(false)` without notifying
    /// watchers when the value is unchanged.
    pub fn set_value(
        &mut self,
        id: NodeId,
        component: ComponentKind,
        value: ComponentValue,
    ) -> Result<bool, ModelError> {
        let descriptor = component.descriptor();
        let node = self.node(id)?;
        check_value(node, component, &value)?;
        if descriptor.values_equal(&node.slot(component)?.value, &value) {
            return Ok(false);
        }

        self.write_value(id, component, descriptor.clone_value(&value))?;
        if descriptor.auto_copy {
            for mirror in self.mirrors_of(id).to_vec() {
                let has_slot = self
                    .tree
                    .node(mirror)
                    .map(|node| node.has_component(component))
                    .unwrap_or(false);
                if has_slot {
                    self.write_value(mirror, component, descriptor.clone_value(&value))?;
                }
            }
        }
        Ok(true)
    }

    fn write_value(
        &mut self,
        id: NodeId,
        component: ComponentKind,
        value: ComponentValue,
    ) -> Result<(), ModelError> {
        let node = self
            .tree
            .node_mut(id)
            .ok_or(ModelError::MissingNode(id))?;
        node.slot_mut(component)?.value = value;
        if matches!(
            component,
            ComponentKind::Vertices | ComponentKind::Faces | ComponentKind::VertexColors
        ) {
            // A whole-buffer write invalidates any in-place patching.
            for buffer in [ComponentKind::Vertices, ComponentKind::VertexColors] {
                if let Some(slot) = node.components.get_mut(&buffer) {
                    slot.partial_update = false;
                }
            }
        }
        self.tree.mark_dirty_upwards(id);
        self.dirty = true;
        self.notify(|watcher, tree, marks| watcher.on_value_changed(tree, id, component, marks));
        Ok(())
    }

    /// Patches individual entries of a per-vertex buffer in place and the
    /// live render mesh with them.
    pub fn update_vertices(
        &mut self,
        id: NodeId,
        component: ComponentKind,
        indices: &[u32],
        data: VertexData,
    ) -> Result<(), ModelError> {
        let stride = match (&data, component) {
            (VertexData::Positions(_), ComponentKind::Vertices) => 12,
            (VertexData::Colors(_), ComponentKind::VertexColors) => 4,
            (VertexData::Positions(_), _) => {
                return Err(ModelError::TypeMismatch {
                    component,
                    expected: ValueType::Bytes,
                    found: ValueType::Vec3,
                })
            }
            (VertexData::Colors(_), _) => {
                return Err(ModelError::TypeMismatch {
                    component,
                    expected: ValueType::Bytes,
                    found: ValueType::Color,
                })
            }
        };
        if indices.len() != data.len() {
            return Err(ModelError::InvalidData {
                component,
                reason: format!(
                    "{} indices for {} values",
                    indices.len(),
                    data.len()
                ),
            });
        }

        let node = self
            .tree
            .node_mut(id)
            .ok_or(ModelError::MissingNode(id))?;
        let slot = node.slot_mut(component)?;
        let found = slot.value.value_type();
        let ComponentValue::Bytes(bytes) = &mut slot.value else {
            return Err(ModelError::TypeMismatch {
                component,
                expected: ValueType::Bytes,
                found,
            });
        };
        let count = bytes.len() / stride;
        if let Some(bad) = indices.iter().find(|index| **index as usize >= count) {
            return Err(ModelError::IndexOutOfRange {
                component,
                index: *bad as usize,
                len: count,
            });
        }
        for (position, index) in indices.iter().enumerate() {
            let offset = *index as usize * stride;
            let target = &mut bytes[offset..offset + stride];
            match &data {
                VertexData::Positions(values) => {
                    target.copy_from_slice(bytemuck::bytes_of(&values[position]))
                }
                VertexData::Colors(values) => target.copy_from_slice(&values[position]),
            }
        }
        slot.partial_update = true;

        if let Some(mesh) = node.mesh.as_mut() {
            let mesh = Arc::make_mut(mesh);
            let updates: BTreeMap<u32, usize> = indices
                .iter()
                .enumerate()
                .map(|(position, index)| (*index, position))
                .collect();
            let mut touched = BTreeSet::new();
            for (vertex_index, source) in mesh.source_indices.iter().enumerate() {
                let Some(position) = updates.get(source) else {
                    continue;
                };
                let vertex = &mut mesh.vertices[vertex_index];
                match &data {
                    VertexData::Positions(values) => vertex.position = values[*position],
                    VertexData::Colors(values) => {
                        vertex.color = values[*position].map(|c| c as f32 / 255.0)
                    }
                }
                touched.insert(vertex_index / 3);
            }
            if matches!(data, VertexData::Positions(_)) {
                for triangle in touched {
                    mesh.refresh_triangle_normal(triangle);
                }
            }
        }

        self.tree.mark_dirty_upwards(id);
        self.dirty = true;
        self.notify(|watcher, tree, marks| watcher.on_value_changed(tree, id, component, marks));
        Ok(())
    }

    /// Flags every mirror of `source` (and the composites embedding those
    /// mirrors) for refresh. `rebuild` requests a full rebuild instead of
    /// reusing the source's mesh.
    pub fn instance_mesh_updated(&mut self, source: NodeId, rebuild: bool) {
        if let Some(node) = self.tree.node_mut(source) {
            node.mirror_geometry.clear();
        }
        let mirrors = self.mirrors_of(source).to_vec();
        if mirrors.is_empty() {
            return;
        }
        let mut marks = DirtyMarks::new();
        for mirror in mirrors {
            let Some(node) = self.tree.node_mut(mirror) else {
                continue;
            };
            node.instance_mesh_dirty = true;
            if rebuild {
                node.instance_mesh_rebuild = true;
            }
            let parent = node.parent;
            self.tree.mark_dirty_upwards(mirror);
            marks.geometry_upwards(&self.tree, parent);
        }
        self.instance_dirty = true;
        self.apply_marks(marks);
        self.dirty = true;
    }

    pub fn set_temp_matrix(&mut self, id: NodeId, matrix: Option<Mat4>) -> Result<(), ModelError> {
        let node = self.tree.node_mut(id).ok_or(ModelError::MissingNode(id))?;
        node.transform.temp = matrix;
        Ok(())
    }

    pub fn set_use_temp_mat(&mut self, id: NodeId, enabled: bool) -> Result<(), ModelError> {
        let node = self.tree.node_mut(id).ok_or(ModelError::MissingNode(id))?;
        node.transform.use_temp_mat = enabled;
        Ok(())
    }

    pub fn set_expanded(&mut self, id: NodeId, expanded: bool) -> Result<(), ModelError> {
        let node = self.tree.node_mut(id).ok_or(ModelError::MissingNode(id))?;
        node.expanded = expanded;
        Ok(())
    }

    pub fn set_opacity(&mut self, id: NodeId, opacity: f32) -> Result<(), ModelError> {
        let node = self.tree.node_mut(id).ok_or(ModelError::MissingNode(id))?;
        node.opacity = opacity.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn select(&mut self, id: NodeId) -> Result<(), ModelError> {
        self.node(id)?;
        if !self.selected.contains(&id) {
            self.selected.push(id);
        }
        Ok(())
    }

    pub fn deselect(&mut self, id: NodeId) -> bool {
        let before = self.selected.len();
        self.selected.retain(|selected| *selected != id);
        before != self.selected.len()
    }

    pub fn clear_selection(&mut self) {
        self.selected.clear();
    }

    pub fn selected_nodes(&self) -> &[NodeId] {
        &self.selected
    }

    /// Selected nodes that have no selected ancestor.
    pub fn topmost_selected_nodes(&self) -> Vec<NodeId> {
        self.selected
            .iter()
            .copied()
            .filter(|id| {
                !self
                    .selected
                    .iter()
                    .any(|other| other != id && self.tree.is_ancestor(*other, *id))
            })
            .collect()
    }

    /// Flags every node for a full transform and geometry rebuild.
    pub fn invalidate_all(&mut self) {
        for node in self.tree.nodes.values_mut() {
            node.dirty = true;
            node.transform.dirty = true;
            if let Some(slot) = node.components.get_mut(&ComponentKind::Geometry) {
                slot.dirty = true;
            }
            if node.instance_id.is_some() {
                node.instance_mesh_dirty = true;
                node.instance_mesh_rebuild = true;
            }
        }
        self.dirty = !self.tree.is_empty();
    }

    fn notify<F>(&mut self, mut event: F)
    where
        F: FnMut(&mut dyn Watcher, &SceneTree, &mut DirtyMarks),
    {
        let mut marks = DirtyMarks::new();
        for watcher in self.watchers.iter_mut() {
            event(watcher.as_mut(), &self.tree, &mut marks);
        }
        self.apply_marks(marks);
    }

    pub(crate) fn apply_marks(&mut self, marks: DirtyMarks) {
        if marks.is_empty() {
            return;
        }
        for id in &marks.transform {
            if let Some(node) = self.tree.node_mut(*id) {
                node.transform.dirty = true;
                self.tree.mark_dirty_upwards(*id);
            }
        }
        for id in &marks.geometry {
            if let Some(node) = self.tree.node_mut(*id) {
                if let Some(slot) = node.components.get_mut(&ComponentKind::Geometry) {
                    slot.dirty = true;
                }
                self.tree.mark_dirty_upwards(*id);
            }
        }
        self.dirty = true;
    }
}

fn check_value(
    node: &Node,
    component: ComponentKind,
    value: &ComponentValue,
) -> Result<(), ModelError> {
    let descriptor = component.descriptor();
    node.slot(component)?;
    if descriptor.value_type == ValueType::Solid {
        return Err(ModelError::InvalidData {
            component,
            reason: "generated solids are owned by the rebuild engine".to_string(),
        });
    }
    if value.value_type() != descriptor.value_type {
        return Err(ModelError::TypeMismatch {
            component,
            expected: descriptor.value_type,
            found: value.value_type(),
        });
    }
    Ok(())
}
