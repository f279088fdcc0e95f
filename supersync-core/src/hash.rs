//! Flat keyed collection with the same authoritative/mirror contract as the
//! forest, minus parents and moves.

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

pub type ItemId = String;

#[derive(Debug, Clone, PartialEq)]
pub struct HashItem {
    pub id: ItemId,
    pub fields: Map<String, Value>,
}

impl HashItem {
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_at_path(&self.fields, path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HashRequest {
    Add {
        item: Value,
        #[serde(default)]
        index: Option<i64>,
    },
    Remove {
        id: ItemId,
    },
    SetProperty {
        id: ItemId,
        path: String,
        value: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HashOperation {
    Add {
        item: Map<String, Value>,
        index: usize,
    },
    Remove {
        id: ItemId,
    },
    SetProperty {
        id: ItemId,
        path: String,
        value: Value,
    },
}

impl HashOperation {
    pub fn item_id(&self) -> &str {
        match self {
            HashOperation::Add { item, .. } => {
                item.get("id").and_then(Value::as_str).unwrap_or_default()
            }
            HashOperation::Remove { id } | HashOperation::SetProperty { id, .. } => id,
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            HashOperation::Add { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            HashOperation::SetProperty { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Replicated flat collection, insertion-ordered unless an index is given.
#[derive(Debug)]
pub struct HashById {
    schema: Schema,
    order: Vec<ItemId>,
    items: HashMap<ItemId, HashItem>,
    next_id: u64,
    notifier: ChangeNotifier,
}

impl HashById {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            order: Vec::new(),
            items: HashMap::new(),
            next_id: 0,
            notifier: ChangeNotifier::new(),
        }
    }

    /// Build a collection from its public JSON form (an array of items).
    pub fn from_value(value: &Value, schema: Schema) -> Result<Self, LoadError> {
        let mut hash = Self::new(schema);
        let entries = value.as_array().ok_or(LoadError::Shape {
            path: String::new(),
            expected: "array of items",
        })?;

        for (index, entry) in entries.iter().enumerate() {
            let mut fields = entry.as_object().cloned().ok_or_else(|| LoadError::Shape {
                path: format!("[{}]", index),
                expected: "item object",
            })?;
            let id = match fields.remove("id") {
                Some(Value::String(id)) => id,
                _ => {
                    return Err(LoadError::Shape {
                        path: format!("[{}]", index),
                        expected: "string id",
                    })
                }
            };
            if hash.items.contains_key(&id) {
                return Err(LoadError::DuplicateId(id));
            }
            hash.order.push(id.clone());
            hash.items.insert(id.clone(), HashItem { id, fields });
        }

        hash.next_id = hash
            .items
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1);
        Ok(hash)
    }

    pub fn to_value(&self) -> Value {
        Value::Array(
            self.iter()
                .map(|item| {
                    let mut object = item.fields.clone();
                    object.insert("id".into(), Value::String(item.id.clone()));
                    Value::Object(object)
                })
                .collect(),
        )
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&HashItem> {
        self.items.get(id)
    }

    pub fn ids(&self) -> &[ItemId] {
        &self.order
    }

    /// Items in collection order.
    pub fn iter(&self) -> impl Iterator<Item = &HashItem> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }

    pub fn subscribe(&mut self, callback: impl FnMut() + Send + Sync + 'static) -> SubscriptionId {
        self.notifier.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub(crate) fn clear_subscribers(&mut self) {
        self.notifier.clear();
    }

    pub fn add(&mut self, item: Value, index: Option<i64>) -> crate::Result<HashOperation> {
        self.perform(HashRequest::Add { item, index })
    }

    pub fn remove(&mut self, id: &str) -> crate::Result<HashOperation> {
        self.perform(HashRequest::Remove { id: id.to_string() })
    }

    pub fn set_property(
        &mut self,
        id: &str,
        path: &str,
        value: Value,
    ) -> crate::Result<HashOperation> {
        self.perform(HashRequest::SetProperty {
            id: id.to_string(),
            path: path.to_string(),
            value,
        })
    }

    /// Validate a new item, minting its id, and clamp where it goes.
    pub(crate) fn resolve_entry(
        &mut self,
        item: Value,
        index: Option<i64>,
    ) -> Result<(Map<String, Value>, usize), RequestError> {
        let Value::Object(mut fields) = item else {
            return Err(RequestError::InvalidValue {
                key: "item".into(),
                violation: Violation {
                    kind: ViolationKind::ExpectedType("hash"),
                    path: String::new(),
                },
            });
        };

        let client_id = validate_client_id(&self.schema, fields.remove("id"))?;
        validate_new_fields(&self.schema, &fields)?;

        let id = match client_id {
            Some(id) if self.items.contains_key(&id) => return Err(RequestError::DuplicateId(id)),
            Some(id) => id,
            None => loop {
                let id = self.next_id.to_string();
                self.next_id += 1;
                if !self.items.contains_key(&id) {
                    break id;
                }
            },
        };
        fields.insert("id".into(), Value::String(id));
        Ok((fields, clamp_index(index, self.order.len())))
    }
}

impl Applier for HashById {
    type Operation = HashOperation;

    fn apply(&mut self, operation: &HashOperation) -> Result<(), ApplyError> {
        match operation {
            HashOperation::Add { item, index } => {
                let mut fields = item.clone();
                let id = match fields.remove("id") {
                    Some(Value::String(id)) => id,
                    _ => return Err(ApplyError::Malformed("added item has no string id".into())),
                };
                if self.items.contains_key(&id) {
                    return Err(ApplyError::DuplicateNode(id));
                }
                if *index > self.order.len() {
                    return Err(ApplyError::IndexOutOfBounds {
                        index: *index,
                        len: self.order.len(),
                    });
                }
                self.order.insert(*index, id.clone());
                self.items.insert(id.clone(), HashItem { id, fields });
                Ok(())
            }
            HashOperation::Remove { id } => {
                if self.items.remove(id).is_none() {
                    return Err(ApplyError::UnknownNode(id.clone()));
                }
                self.order.retain(|existing| existing != id);
                Ok(())
            }
            HashOperation::SetProperty { id, path, value } => {
                if path.split('.').next() == Some("id") {
                    return Err(ApplyError::Malformed(format!("cannot set {}", path)));
                }
                let item = self
                    .items
                    .get_mut(id)
                    .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                set_at_path(&mut item.fields, path, value.clone())?;
                Ok(())
            }
        }
    }
}

impl Mutator for HashById {
    type Request = HashRequest;

    fn resolve(&mut self, request: HashRequest) -> Result<HashOperation, RequestError> {
        match request {
            HashRequest::Add { item, index } => {
                let (item, index) = self.resolve_entry(item, index)?;
                Ok(HashOperation::Add { item, index })
            }
            HashRequest::Remove { id } => {
                if !self.items.contains_key(&id) {
                    return Err(RequestError::UnknownNode(id));
                }
                Ok(HashOperation::Remove { id })
            }
            HashRequest::SetProperty { id, path, value } => {
                let item = self
                    .items
                    .get(&id)
                    .ok_or_else(|| RequestError::UnknownNode(id.clone()))?;
                validate_property(&self.schema, &[], &item.fields, &path, &value)?;
                Ok(HashOperation::SetProperty { id, path, value })
            }
        }
    }

    fn notifier(&mut self) -> &mut ChangeNotifier {
        &mut self.notifier
    }
}
