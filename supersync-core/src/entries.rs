//! The project's file tree: a forest of named entries where folders are
//! groups and assets are leaves.
//!
//! On top of the forest rules, names are unique within a folder. The stored
//! form is `{ "nextEntryId": n, "nodes": [...] }`.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Error, LoadError, RequestError, StoreError};
use crate::notify::SubscriptionId;
use crate::replica::{Applier, Mutator};
use crate::schema::{Rule, Schema};
use crate::store::BackingStore;
use crate::tree::{TreeById, TreeOperation, TreeRequest};

pub const MAX_NAME_LENGTH: usize = 80;

pub fn entries_schema() -> Schema {
    Schema::new()
        .with(
            "name",
            Rule::string().min_length(1).max_length(MAX_NAME_LENGTH),
        )
        .with("type", Rule::string().optional())
}

#[derive(Debug)]
pub struct ProjectEntries {
    tree: TreeById,
}

impl Default for ProjectEntries {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectEntries {
    pub fn new() -> Self {
        Self {
            tree: TreeById::new(entries_schema()),
        }
    }

    pub fn tree(&self) -> &TreeById {
        &self.tree
    }

    /// Parse the stored document, upgrading legacy integer ids to strings.
    pub fn from_persisted(value: &Value) -> Result<Self, LoadError> {
        let mut nodes = value.get("nodes").cloned().ok_or(LoadError::Shape {
            path: "nodes".into(),
            expected: "array of nodes",
        })?;
        let upgraded = upgrade_legacy_ids(&mut nodes);
        if upgraded > 0 {
            info!(upgraded, "converted legacy numeric entry ids");
        }

        let next_id = match value.get("nextEntryId") {
            None | Some(Value::Null) => None,
            Some(next) => Some(next.as_u64().ok_or(LoadError::Shape {
                path: "nextEntryId".into(),
                expected: "non-negative integer",
            })?),
        };

        Ok(Self {
            tree: TreeById::from_value(&nodes, entries_schema(), next_id)?,
        })
    }

    pub fn to_persisted(&self) -> Value {
        json!({
            "nextEntryId": self.tree.next_id(),
            "nodes": self.tree.to_value(),
        })
    }

    /// Load from the store; a missing document is an empty project.
    pub async fn load(store: &dyn BackingStore, key: &str) -> crate::Result<Self> {
        let Some(bytes) = store.read(key).await? else {
            debug!(key, "no stored entries, starting empty");
            return Ok(Self::new());
        };
        let value: Value = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
        let entries = Self::from_persisted(&value)?;
        info!(key, entries = entries.tree.len(), "entries loaded");
        Ok(entries)
    }

    pub async fn save(&self, store: &dyn BackingStore, key: &str) -> crate::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.to_persisted()).map_err(StoreError::from)?;
        store.write(key, &bytes).await?;
        Ok(())
    }

    pub fn subscribe(&mut self, callback: impl FnMut() + Send + Sync + 'static) -> SubscriptionId {
        self.tree.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.tree.unsubscribe(id)
    }

    /// Validate and apply a client request.
    pub fn request(&mut self, request: TreeRequest) -> crate::Result<TreeOperation> {
        match &request {
            TreeRequest::Add {
                node, parent_id, ..
            } => {
                if let Some(name) = node.get("name").and_then(Value::as_str) {
                    self.check_name_free(parent_id.as_deref(), name, None)?;
                }
            }
            TreeRequest::Move { id, parent_id, .. } => {
                if let Some(node) = self.tree.get(id) {
                    self.check_name_free(parent_id.as_deref(), node.name(), Some(id))?;
                }
            }
            TreeRequest::SetProperty {
                id, path, value, ..
            } if path == "name" => {
                if let (Some(name), Some(parent)) =
                    (value.as_str(), self.tree.get(id).map(|node| node.parent.clone()))
                {
                    self.check_name_free(parent.as_deref(), name, Some(id))?;
                }
            }
            _ => {}
        }
        self.tree.perform(request)
    }

    pub fn add(
        &mut self,
        node: Value,
        parent_id: Option<&str>,
        index: Option<i64>,
    ) -> crate::Result<TreeOperation> {
        self.request(TreeRequest::Add {
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
        self.request(TreeRequest::Move {
            id: id.to_string(),
            parent_id: parent_id.map(str::to_string),
            index,
        })
    }

    pub fn remove(&mut self, id: &str) -> crate::Result<TreeOperation> {
        self.request(TreeRequest::Remove { id: id.to_string() })
    }

    pub fn set_property(&mut self, id: &str, path: &str, value: Value) -> crate::Result<TreeOperation> {
        self.request(TreeRequest::SetProperty {
            id: id.to_string(),
            path: path.to_string(),
            value,
        })
    }

    /// Apply an operation resolved elsewhere.
    pub fn apply(&mut self, operation: &TreeOperation) -> crate::Result<()> {
        self.tree.apply(operation).map_err(Error::from)
    }

    fn check_name_free(
        &self,
        parent: Option<&str>,
        name: &str,
        exclude: Option<&str>,
    ) -> Result<(), RequestError> {
        let Some(siblings) = self.tree.children_of(parent) else {
            return Ok(());
        };
        let taken = siblings
            .iter()
            .filter(|id| Some(id.as_str()) != exclude)
            .filter_map(|id| self.tree.get(id))
            .any(|sibling| sibling.name() == name);
        if taken {
            return Err(RequestError::NameCollision(name.to_string()));
        }
        Ok(())
    }
}

/// Rewrite integer `id`s to strings throughout a node array.
fn upgrade_legacy_ids(nodes: &mut Value) -> usize {
    let mut upgraded = 0;
    let mut pending = vec![nodes];
    while let Some(value) = pending.pop() {
        match value {
            Value::Array(items) => pending.extend(items.iter_mut()),
            Value::Object(node) => {
                if let Some(id) = node.get_mut("id") {
                    if let Some(n) = id.as_u64() {
                        *id = Value::String(n.to_string());
                        upgraded += 1;
                    }
                }
                if let Some(children) = node.get_mut("children") {
                    pending.push(children);
                }
            }
            _ => {}
        }
    }
    upgraded
}
