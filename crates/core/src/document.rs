use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::component::{ComponentKind, ComponentValue};
use crate::model::{Model, ModelError, NewNode};
use crate::node::{NodeId, NodeKind};
use crate::settings::EngineSettings;

pub const DOCUMENT_VERSION: u32 = 2;

/// Transport form of one node and its subtree, shared by save/load and
/// copy-paste. Byte buffers travel as base64 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDescription>,
}

impl NodeDescription {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: None,
            kind: kind.name().to_string(),
            parent_id: None,
            instance_id: None,
            data: BTreeMap::new(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneDocument {
    pub version: u32,
    #[serde(default)]
    pub settings: EngineSettings,
    #[serde(default)]
    pub nodes: Vec<NodeDescription>,
}

impl Default for SceneDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            settings: EngineSettings::default(),
            nodes: Vec::new(),
        }
    }
}

impl SceneDocument {
    pub fn from_model(model: &Model, settings: EngineSettings) -> Result<Self, ModelError> {
        Ok(Self {
            version: DOCUMENT_VERSION,
            settings,
            nodes: model.export()?,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let mut document: SceneDocument = serde_json::from_str(text)?;
        document.migrate_to_latest();
        Ok(document)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn migrate_to_latest(&mut self) {
        if self.version < 2 {
            // Version 1 keyed component data in camelCase.
            for node in &mut self.nodes {
                rename_component_keys(node);
            }
            self.version = 2;
        }
    }

    pub fn load_into(&self, model: &mut Model) -> Result<Vec<NodeId>, ModelError> {
        model.import(&self.nodes, None)
    }
}

fn rename_component_keys(node: &mut NodeDescription) {
    node.data = std::mem::take(&mut node.data)
        .into_iter()
        .map(|(key, value)| (snake_case(&key), value))
        .collect();
    for child in &mut node.children {
        rename_component_keys(child);
    }
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// A description checked against the schema, with its final id.
struct Prepared<'a> {
    description: &'a NodeDescription,
    id: NodeId,
    kind: NodeKind,
    data: BTreeMap<ComponentKind, ComponentValue>,
    children: Vec<Prepared<'a>>,
}

struct Placement {
    parent: Option<NodeId>,
    index: usize,
}

impl Model {
    pub fn describe(&self, id: NodeId) -> Result<NodeDescription, ModelError> {
        let node = self.node(id)?;
        let mut description = NodeDescription::new(node.kind());
        description.id = Some(id);
        description.parent_id = node.parent();
        description.instance_id = node.instance_id();
        for kind in node.component_kinds() {
            let descriptor = kind.descriptor();
            if !descriptor.persisted {
                continue;
            }
            if let Some(value) = descriptor.encode(node.value(kind)?) {
                description.data.insert(kind.name().to_string(), value);
            }
        }
        for child in node.children() {
            description.children.push(self.describe(*child)?);
        }
        Ok(description)
    }

    pub fn export(&self) -> Result<Vec<NodeDescription>, ModelError> {
        self.roots().iter().map(|root| self.describe(*root)).collect()
    }

    /// Recreates described subtrees. Authoritative nodes are created first
    /// and mirrors (with everything below them) second, so a mirror may
    /// precede its source in the list. Ids already taken in this model are
    /// replaced with fresh ones and references inside the batch follow.
    /// Nothing is left behind when any node fails.
    pub fn import(
        &mut self,
        descriptions: &[NodeDescription],
        parent: Option<NodeId>,
    ) -> Result<Vec<NodeId>, ModelError> {
        if let Some(parent) = parent {
            self.node(parent)?;
        }
        let mut used: BTreeSet<NodeId> = BTreeSet::new();
        let mut remap: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut next = self.next_free_id().raw();
        let prepared = descriptions
            .iter()
            .map(|description| self.prepare(description, &mut used, &mut remap, &mut next))
            .collect::<Result<Vec<_>, _>>()?;

        let mut created = Vec::new();
        let result = self.create_prepared(&prepared, parent, &remap, &mut created);
        if let Err(err) = result {
            warn!("import failed, rolling back {} nodes: {err}", created.len());
            for id in created.iter().rev() {
                self.remove_node(*id);
            }
            return Err(err);
        }
        debug!("imported {} nodes", created.len());
        Ok(prepared.iter().map(|node| node.id).collect())
    }

    fn prepare<'a>(
        &self,
        description: &'a NodeDescription,
        used: &mut BTreeSet<NodeId>,
        remap: &mut BTreeMap<NodeId, NodeId>,
        next: &mut u64,
    ) -> Result<Prepared<'a>, ModelError> {
        let kind = NodeKind::from_name(&description.kind)
            .ok_or_else(|| ModelError::UnknownNodeType(description.kind.clone()))?;
        let mut data = BTreeMap::new();
        for (name, value) in &description.data {
            let component = ComponentKind::from_name(name)
                .ok_or_else(|| ModelError::UnknownComponent(name.clone()))?;
            data.insert(component, component.descriptor().decode(value)?);
        }

        let id = match description.id {
            Some(id) if !self.contains(id) && !used.contains(&id) => id,
            _ => loop {
                let candidate = NodeId::new(*next);
                *next += 1;
                if !self.contains(candidate) && !used.contains(&candidate) {
                    break candidate;
                }
            },
        };
        used.insert(id);
        if let Some(original) = description.id {
            remap.entry(original).or_insert(id);
        }

        let children = description
            .children
            .iter()
            .map(|child| self.prepare(child, used, remap, next))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Prepared {
            description,
            id,
            kind,
            data,
            children,
        })
    }

    fn create_prepared(
        &mut self,
        prepared: &[Prepared<'_>],
        parent: Option<NodeId>,
        remap: &BTreeMap<NodeId, NodeId>,
        created: &mut Vec<NodeId>,
    ) -> Result<(), ModelError> {
        let mut deferred = Vec::new();
        // Next insertion slot per target list, counted from its length
        // before the import.
        let mut slots: BTreeMap<Option<NodeId>, usize> = BTreeMap::new();
        for node in prepared {
            let node_parent = match parent {
                Some(parent) => Some(parent),
                None => node
                    .description
                    .parent_id
                    .map(|id| remap.get(&id).copied().unwrap_or(id))
                    .filter(|id| self.contains(*id)),
            };
            let slot = slots
                .entry(node_parent)
                .or_insert_with(|| self.tree.siblings(node_parent).len());
            let placement = Placement {
                parent: node_parent,
                index: *slot,
            };
            *slot += 1;
            self.create_subtree(node, placement, remap, created, &mut deferred)?;
        }
        for (node, placement) in deferred {
            self.create_all(node, placement, remap, created)?;
        }
        Ok(())
    }

    /// Creates authoritative nodes now and queues mirror subtrees.
    fn create_subtree<'p, 'a>(
        &mut self,
        node: &'p Prepared<'a>,
        placement: Placement,
        remap: &BTreeMap<NodeId, NodeId>,
        created: &mut Vec<NodeId>,
        deferred: &mut Vec<(&'p Prepared<'a>, Placement)>,
    ) -> Result<(), ModelError> {
        if node.description.instance_id.is_some() {
            deferred.push((node, placement));
            return Ok(());
        }
        self.create_one(node, &placement, remap)?;
        created.push(node.id);
        for (index, child) in node.children.iter().enumerate() {
            let placement = Placement {
                parent: Some(node.id),
                index,
            };
            self.create_subtree(child, placement, remap, created, deferred)?;
        }
        Ok(())
    }

    fn create_all(
        &mut self,
        node: &Prepared<'_>,
        placement: Placement,
        remap: &BTreeMap<NodeId, NodeId>,
        created: &mut Vec<NodeId>,
    ) -> Result<(), ModelError> {
        self.create_one(node, &placement, remap)?;
        created.push(node.id);
        for (index, child) in node.children.iter().enumerate() {
            let placement = Placement {
                parent: Some(node.id),
                index,
            };
            self.create_all(child, placement, remap, created)?;
        }
        Ok(())
    }

    fn create_one(
        &mut self,
        node: &Prepared<'_>,
        placement: &Placement,
        remap: &BTreeMap<NodeId, NodeId>,
    ) -> Result<(), ModelError> {
        let mut new = NewNode::new(node.id, node.kind)
            .at(placement.index)
            .data(node.data.clone());
        if let Some(parent) = placement.parent {
            new = new.parent(parent);
        }
        if let Some(source) = node.description.instance_id {
            new = new.instance_of(remap.get(&source).copied().unwrap_or(source));
        }
        self.create_node(new)?;
        Ok(())
    }
}
