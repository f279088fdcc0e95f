//! Ordered forest of identity-bearing nodes.
//!
//! Nodes live in an arena keyed by id. Parent links are ids and sibling
//! order comes from explicit id sequences: the root list, or a group's
//! `children`. A node is a *group* when it has a children list, otherwise a
//! *leaf*.
//!
//! ```text
//! roots: [1, 4]          nodes: 1 → { parent: None,    children: [2, 3] }
//!                               2 → { parent: Some(1), children: None }
//!                               3 → { parent: Some(1), children: [] }
//!                               4 → { parent: None,    children: None }
//! ```
//!
//! Ids are minted from a counter that only grows, so an id is never handed
//! out twice over a forest's lifetime, even after the node is removed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ApplyError, LoadError, RequestError};
use crate::notify::{ChangeNotifier, SubscriptionId};
use crate::replica::{
    clamp_index, get_at_path, set_at_path, validate_client_id, validate_new_fields,
    validate_property, Applier, Mutator,
};
use crate::schema::{Schema, Violation, ViolationKind};

/// Unique identifier for a node in the forest.
pub type NodeId = String;

const STRUCTURAL_KEYS: &[&str] = &["children"];

/// A node in the forest.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    /// `Some` for groups, `None` for leaves
    pub children: Option<Vec<NodeId>>,
    /// Schema-declared properties, including `name`
    pub fields: Map<String, Value>,
}

impl TreeNode {
    pub fn name(&self) -> &str {
        self.fields
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn is_group(&self) -> bool {
        self.children.is_some()
    }

    /// Read a property by dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_at_path(&self.fields, path)
    }
}

/// A mutation request as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TreeRequest {
    Add {
        node: Value,
        #[serde(default)]
        parent_id: Option<NodeId>,
        #[serde(default)]
        index: Option<i64>,
    },
    Move {
        id: NodeId,
        #[serde(default)]
        parent_id: Option<NodeId>,
        #[serde(default)]
        index: Option<i64>,
    },
    Remove {
        id: NodeId,
    },
    SetProperty {
        id: NodeId,
        path: String,
        value: Value,
    },
}

/// A resolved operation, safe to replay verbatim on any mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TreeOperation {
    Add {
        /// Full node record, including its final `id`
        node: Map<String, Value>,
        parent_id: Option<NodeId>,
        index: usize,
    },
    Move {
        id: NodeId,
        parent_id: Option<NodeId>,
        /// Final position, after the node left its old slot
        index: usize,
    },
    Remove {
        id: NodeId,
    },
    SetProperty {
        id: NodeId,
        path: String,
        value: Value,
    },
}

impl TreeOperation {
    /// The node this operation targets.
    pub fn node_id(&self) -> &str {
        match self {
            TreeOperation::Add { node, .. } => {
                node.get("id").and_then(Value::as_str).unwrap_or_default()
            }
            TreeOperation::Move { id, .. }
            | TreeOperation::Remove { id }
            | TreeOperation::SetProperty { id, .. } => id,
        }
    }

    /// Resolved index for `add` and `move`.
    pub fn index(&self) -> Option<usize> {
        match self {
            TreeOperation::Add { index, .. } | TreeOperation::Move { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Resolved value for `set_property`.
    pub fn value(&self) -> Option<&Value> {
        match self {
            TreeOperation::SetProperty { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Replicated ordered forest.
#[derive(Debug)]
pub struct TreeById {
    schema: Schema,
    roots: Vec<NodeId>,
    nodes: HashMap<NodeId, TreeNode>,
    next_id: u64,
    notifier: ChangeNotifier,
}

impl TreeById {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            roots: Vec::new(),
            nodes: HashMap::new(),
            next_id: 0,
            notifier: ChangeNotifier::new(),
        }
    }

    /// Build a forest from its public JSON form (an array of nodes).
    ///
    /// Without an explicit `next_id`, the counter resumes after the highest
    /// numeric id found.
    pub fn from_value(value: &Value, schema: Schema, next_id: Option<u64>) -> Result<Self, LoadError> {
        let mut tree = Self::new(schema);
        let items = value.as_array().ok_or(LoadError::Shape {
            path: String::new(),
            expected: "array of nodes",
        })?;

        let mut roots = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            roots.push(tree.load_node(item, None, format!("[{}]", index))?);
        }
        tree.roots = roots;

        tree.next_id = match next_id {
            Some(next_id) => next_id,
            None => tree
                .nodes
                .keys()
                .filter_map(|id| id.parse::<u64>().ok())
                .max()
                .map_or(0, |max| max + 1),
        };
        Ok(tree)
    }

    fn load_node(
        &mut self,
        value: &Value,
        parent: Option<&str>,
        path: String,
    ) -> Result<NodeId, LoadError> {
        let object = value.as_object().ok_or_else(|| LoadError::Shape {
            path: path.clone(),
            expected: "node object",
        })?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| LoadError::Shape {
                path: path.clone(),
                expected: "string id",
            })?
            .to_string();
        if self.nodes.contains_key(&id) {
            return Err(LoadError::DuplicateId(id));
        }

        let mut fields = object.clone();
        fields.remove("id");
        let children = match fields.remove("children") {
            None => None,
            Some(Value::Array(children)) => {
                let mut ids = Vec::with_capacity(children.len());
                for (index, child) in children.iter().enumerate() {
                    ids.push(self.load_node(
                        child,
                        Some(&id),
                        format!("{}.children[{}]", path, index),
                    )?);
                }
                Some(ids)
            }
            Some(_) => {
                return Err(LoadError::Shape {
                    path: format!("{}.children", path),
                    expected: "array",
                })
            }
        };

        self.nodes.insert(
            id.clone(),
            TreeNode {
                id: id.clone(),
                parent: parent.map(str::to_string),
                children,
                fields,
            },
        );
        Ok(id)
    }

    /// Rebuild the nested public JSON form.
    pub fn to_value(&self) -> Value {
        Value::Array(self.roots.iter().map(|id| self.node_value(id)).collect())
    }

    fn node_value(&self, id: &str) -> Value {
        let Some(node) = self.nodes.get(id) else {
            return Value::Null;
        };
        let mut object = node.fields.clone();
        object.insert("id".into(), Value::String(node.id.clone()));
        if let Some(children) = &node.children {
            object.insert(
                "children".into(),
                Value::Array(children.iter().map(|child| self.node_value(child)).collect()),
            );
        }
        Value::Object(object)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Children of `parent`, or the root list when `parent` is `None`.
    ///
    /// Returns `None` for unknown ids and for leaves.
    pub fn children_of(&self, parent: Option<&str>) -> Option<&[NodeId]> {
        self.siblings(parent).map(Vec::as_slice)
    }

    /// Parent of `id`; `None` for roots and unknown ids.
    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.nodes.get(id)?.parent.as_deref()
    }

    /// Slash-joined names from the root down to `id`.
    pub fn get_path_from_id(&self, id: &str) -> Option<String> {
        let mut node = self.nodes.get(id)?;
        let mut names = vec![node.name()];
        while let Some(parent) = node.parent.as_deref().and_then(|p| self.nodes.get(p)) {
            names.push(parent.name());
            node = parent;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Visit every node depth-first, parents before children.
    pub fn walk(&self, mut callback: impl FnMut(&TreeNode, Option<&TreeNode>)) {
        let mut stack: Vec<&NodeId> = self.roots.iter().rev().collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let parent = node.parent.as_deref().and_then(|p| self.nodes.get(p));
            callback(node, parent);
            if let Some(children) = &node.children {
                stack.extend(children.iter().rev());
            }
        }
    }

    /// Whether `id` sits somewhere below `ancestor`.
    pub fn is_descendant(&self, id: &str, ancestor: &str) -> bool {
        let mut current = self.parent_of(id);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent_of(parent);
        }
        false
    }

    pub fn subscribe(&mut self, callback: impl FnMut() + Send + Sync + 'static) -> SubscriptionId {
        self.notifier.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn add(
        &mut self,
        node: Value,
        parent_id: Option<&str>,
        index: Option<i64>,
    ) -> crate::Result<TreeOperation> {
        self.perform(TreeRequest::Add {
            node,
            parent_id: parent_id.map(str::to_string),
            index,
        })
    }

    pub fn move_node(
        &mut self,
        id: &str,
        parent_id: Option<&str>,
        index: Option<i64>,
    ) -> crate::Result<TreeOperation> {
        self.perform(TreeRequest::Move {
            id: id.to_string(),
            parent_id: parent_id.map(str::to_string),
            index,
        })
    }

    pub fn remove(&mut self, id: &str) -> crate::Result<TreeOperation> {
        self.perform(TreeRequest::Remove { id: id.to_string() })
    }

    pub fn set_property(
        &mut self,
        id: &str,
        path: &str,
        value: Value,
    ) -> crate::Result<TreeOperation> {
        self.perform(TreeRequest::SetProperty {
            id: id.to_string(),
            path: path.to_string(),
            value,
        })
    }

    fn siblings(&self, parent: Option<&str>) -> Option<&Vec<NodeId>> {
        match parent {
            None => Some(&self.roots),
            Some(parent) => self.nodes.get(parent)?.children.as_ref(),
        }
    }

    fn siblings_mut(&mut self, parent: Option<&str>) -> Result<&mut Vec<NodeId>, ApplyError> {
        match parent {
            None => Ok(&mut self.roots),
            Some(parent) => self
                .nodes
                .get_mut(parent)
                .and_then(|node| node.children.as_mut())
                .ok_or_else(|| ApplyError::InvalidParent(parent.to_string())),
        }
    }

    fn mint_id(&mut self) -> NodeId {
        loop {
            let id = self.next_id.to_string();
            self.next_id += 1;
            if !self.nodes.contains_key(&id) {
                return id;
            }
        }
    }

    fn resolve_add(
        &mut self,
        node: Value,
        parent_id: Option<NodeId>,
        index: Option<i64>,
    ) -> Result<TreeOperation, RequestError> {
        let Value::Object(mut fields) = node else {
            return Err(RequestError::InvalidValue {
                key: "node".into(),
                violation: Violation {
                    kind: ViolationKind::ExpectedType("hash"),
                    path: String::new(),
                },
            });
        };

        let client_id = validate_client_id(&self.schema, fields.remove("id"))?;

        let sibling_count = self
            .siblings(parent_id.as_deref())
            .map(Vec::len)
            .ok_or_else(|| RequestError::InvalidParent(parent_id.clone().unwrap_or_default()))?;

        let is_group = match fields.remove("children") {
            None => false,
            Some(Value::Array(children)) if children.is_empty() => true,
            Some(_) => {
                return Err(RequestError::InvalidValue {
                    key: "children".into(),
                    violation: Violation {
                        kind: ViolationKind::ExpectedType("empty array"),
                        path: String::new(),
                    },
                })
            }
        };

        validate_new_fields(&self.schema, &fields)?;

        let id = match client_id {
            Some(id) if self.nodes.contains_key(&id) => return Err(RequestError::DuplicateId(id)),
            Some(id) => id,
            None => self.mint_id(),
        };

        fields.insert("id".into(), Value::String(id));
        if is_group {
            fields.insert("children".into(), Value::Array(Vec::new()));
        }

        Ok(TreeOperation::Add {
            node: fields,
            parent_id,
            index: clamp_index(index, sibling_count),
        })
    }

    fn resolve_move(
        &self,
        id: NodeId,
        parent_id: Option<NodeId>,
        index: Option<i64>,
    ) -> Result<TreeOperation, RequestError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| RequestError::UnknownNode(id.clone()))?;

        let destination = self
            .siblings(parent_id.as_deref())
            .ok_or_else(|| RequestError::InvalidParent(parent_id.clone().unwrap_or_default()))?;

        if let Some(parent) = parent_id.as_deref() {
            if parent == id || self.is_descendant(parent, &id) {
                return Err(RequestError::Cycle(id));
            }
        }

        let target = clamp_index(index, destination.len());
        let same_list = node.parent == parent_id;
        let old_index = destination.iter().position(|sibling| *sibling == id);

        // Removing the node first shifts everything after it one slot left.
        let index = match old_index {
            Some(old_index) if same_list && old_index < target => target - 1,
            _ => target,
        };

        Ok(TreeOperation::Move {
            id,
            parent_id,
            index,
        })
    }

    fn apply_add(
        &mut self,
        node: &Map<String, Value>,
        parent_id: Option<&str>,
        index: usize,
    ) -> Result<(), ApplyError> {
        let id = node
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ApplyError::Malformed("added node has no string id".into()))?
            .to_string();
        if self.nodes.contains_key(&id) {
            return Err(ApplyError::DuplicateNode(id));
        }

        let mut fields = node.clone();
        fields.remove("id");
        let children = match fields.remove("children") {
            None => None,
            Some(Value::Array(children)) if children.is_empty() => Some(Vec::new()),
            Some(_) => {
                return Err(ApplyError::Malformed(format!(
                    "added node {} carries children",
                    id
                )))
            }
        };

        let siblings = self.siblings_mut(parent_id)?;
        if index > siblings.len() {
            return Err(ApplyError::IndexOutOfBounds {
                index,
                len: siblings.len(),
            });
        }
        siblings.insert(index, id.clone());

        self.nodes.insert(
            id.clone(),
            TreeNode {
                id,
                parent: parent_id.map(str::to_string),
                children,
                fields,
            },
        );
        Ok(())
    }

    fn apply_move(&mut self, id: &str, parent_id: Option<&str>, index: usize) -> Result<(), ApplyError> {
        let old_parent = self
            .nodes
            .get(id)
            .ok_or_else(|| ApplyError::UnknownNode(id.to_string()))?
            .parent
            .clone();

        if let Some(parent) = parent_id {
            if parent == id || self.is_descendant(parent, id) {
                return Err(ApplyError::InvalidParent(parent.to_string()));
            }
        }

        let destination_len = self
            .siblings(parent_id)
            .map(Vec::len)
            .ok_or_else(|| ApplyError::InvalidParent(parent_id.unwrap_or_default().to_string()))?;
        let same_list = old_parent.as_deref() == parent_id;
        let len_after_removal = if same_list {
            destination_len.saturating_sub(1)
        } else {
            destination_len
        };
        if index > len_after_removal {
            return Err(ApplyError::IndexOutOfBounds {
                index,
                len: len_after_removal,
            });
        }

        let old_siblings = self.siblings_mut(old_parent.as_deref())?;
        let old_index = old_siblings
            .iter()
            .position(|sibling| sibling == id)
            .ok_or_else(|| ApplyError::Malformed(format!("node {} missing from its parent", id)))?;
        old_siblings.remove(old_index);

        self.siblings_mut(parent_id)?.insert(index, id.to_string());
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = parent_id.map(str::to_string);
        }
        Ok(())
    }

    fn apply_remove(&mut self, id: &str) -> Result<(), ApplyError> {
        let parent = self
            .nodes
            .get(id)
            .ok_or_else(|| ApplyError::UnknownNode(id.to_string()))?
            .parent
            .clone();

        let siblings = self.siblings_mut(parent.as_deref())?;
        if let Some(position) = siblings.iter().position(|sibling| sibling == id) {
            siblings.remove(position);
        }

        let mut pending = vec![id.to_string()];
        while let Some(current) = pending.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                pending.extend(node.children.into_iter().flatten());
            }
        }
        Ok(())
    }
}

impl Applier for TreeById {
    type Operation = TreeOperation;

    fn apply(&mut self, operation: &TreeOperation) -> Result<(), ApplyError> {
        match operation {
            TreeOperation::Add {
                node,
                parent_id,
                index,
            } => self.apply_add(node, parent_id.as_deref(), *index),
            TreeOperation::Move {
                id,
                parent_id,
                index,
            } => self.apply_move(id, parent_id.as_deref(), *index),
            TreeOperation::Remove { id } => self.apply_remove(id),
            TreeOperation::SetProperty { id, path, value } => {
                let head = path.split('.').next().unwrap_or_default();
                if head == "id" || STRUCTURAL_KEYS.contains(&head) {
                    return Err(ApplyError::Malformed(format!("cannot set {}", path)));
                }
                let node = self
                    .nodes
                    .get_mut(id)
                    .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                set_at_path(&mut node.fields, path, value.clone())?;
                Ok(())
            }
        }
    }
}

impl Mutator for TreeById {
    type Request = TreeRequest;

    fn resolve(&mut self, request: TreeRequest) -> Result<TreeOperation, RequestError> {
        match request {
            TreeRequest::Add {
                node,
                parent_id,
                index,
            } => self.resolve_add(node, parent_id, index),
            TreeRequest::Move {
                id,
                parent_id,
                index,
            } => self.resolve_move(id, parent_id, index),
            TreeRequest::Remove { id } => {
                if !self.nodes.contains_key(&id) {
                    return Err(RequestError::UnknownNode(id));
                }
                Ok(TreeOperation::Remove { id })
            }
            TreeRequest::SetProperty { id, path, value } => {
                let node = self
                    .nodes
                    .get(&id)
                    .ok_or_else(|| RequestError::UnknownNode(id.clone()))?;
                validate_property(&self.schema, STRUCTURAL_KEYS, &node.fields, &path, &value)?;
                Ok(TreeOperation::SetProperty { id, path, value })
            }
        }
    }

    fn notifier(&mut self) -> &mut ChangeNotifier {
        &mut self.notifier
    }
}
