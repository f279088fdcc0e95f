//! The project manifest: a single record naming and describing a project.
//!
//! Stored as-is, e.g.
//! `{ "id": "a1b2", "name": "Tetris", "description": "", "formatVersion": 1 }`.
//! Only `name` and `description` change after creation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::entries::MAX_NAME_LENGTH;
use crate::error::{ApplyError, LoadError, RequestError, StoreError};
use crate::notify::{ChangeNotifier, SubscriptionId};
use crate::replica::{get_at_path, set_at_path, validate_new_fields, validate_property, Applier, Mutator};
use crate::schema::{check_violation, Rule, Schema};
use crate::store::BackingStore;

pub const PROJECT_ID_LENGTH: usize = 4;
pub const MAX_DESCRIPTION_LENGTH: usize = 300;

/// Newest stored layout this build understands.
pub const FORMAT_VERSION: u64 = 1;

pub fn manifest_schema() -> Schema {
    Schema::new()
        .with(
            "id",
            Rule::string()
                .min_length(PROJECT_ID_LENGTH)
                .max_length(PROJECT_ID_LENGTH)
                .immutable(),
        )
        .with(
            "name",
            Rule::string().min_length(1).max_length(MAX_NAME_LENGTH),
        )
        .with(
            "description",
            Rule::string().max_length(MAX_DESCRIPTION_LENGTH),
        )
        .with("system", Rule::string().optional().immutable())
        .with(
            "formatVersion",
            Rule::integer().min(0.0).optional().immutable(),
        )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ManifestRequest {
    SetProperty { path: String, value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ManifestOperation {
    SetProperty { path: String, value: Value },
}

impl ManifestOperation {
    pub fn value(&self) -> &Value {
        match self {
            ManifestOperation::SetProperty { value, .. } => value,
        }
    }
}

#[derive(Debug)]
pub struct ProjectManifest {
    schema: Schema,
    fields: Map<String, Value>,
    notifier: ChangeNotifier,
}

impl ProjectManifest {
    /// A fresh manifest at the current format version.
    pub fn new(id: &str, name: &str) -> Result<Self, RequestError> {
        let schema = manifest_schema();
        let mut fields = Map::new();
        fields.insert("name".into(), Value::from(name));
        fields.insert("description".into(), Value::from(""));
        fields.insert("formatVersion".into(), Value::from(FORMAT_VERSION));
        validate_new_fields(&schema, &fields)?;

        let id = Value::from(id);
        if let Some(violation) = schema.get("id").and_then(|rule| check_violation(&id, rule, true)) {
            return Err(RequestError::InvalidValue {
                key: "id".into(),
                violation,
            });
        }
        fields.insert("id".into(), id);

        Ok(Self {
            schema,
            fields,
            notifier: ChangeNotifier::new(),
        })
    }

    /// Parse a stored manifest. Manifests written before versioning was
    /// introduced count as version 0 and are brought up to date.
    pub fn from_value(value: &Value) -> Result<Self, LoadError> {
        let schema = manifest_schema();
        let rule = Rule::hash(schema.iter().map(|(key, rule)| (key, rule.clone())));
        if let Some(violation) = check_violation(value, &rule, true) {
            return Err(LoadError::Invalid(violation));
        }
        let mut fields = value.as_object().cloned().ok_or(LoadError::Shape {
            path: String::new(),
            expected: "manifest object",
        })?;

        let found = fields
            .get("formatVersion")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if found > FORMAT_VERSION {
            return Err(LoadError::FormatVersion {
                found,
                supported: FORMAT_VERSION,
            });
        }
        if found < FORMAT_VERSION {
            info!(from = found, to = FORMAT_VERSION, "upgrading project manifest");
            fields.insert("formatVersion".into(), Value::from(FORMAT_VERSION));
        }

        Ok(Self {
            schema,
            fields,
            notifier: ChangeNotifier::new(),
        })
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        get_at_path(&self.fields, key)
    }

    pub fn id(&self) -> &str {
        self.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.get("name").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn description(&self) -> &str {
        self.get("description").and_then(Value::as_str).unwrap_or_default()
    }

    /// Returns `None` when nothing has been stored under `key` yet.
    pub async fn load(store: &dyn BackingStore, key: &str) -> crate::Result<Option<Self>> {
        let Some(bytes) = store.read(key).await? else {
            debug!(key, "no stored manifest");
            return Ok(None);
        };
        let value: Value = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
        let manifest = Self::from_value(&value)?;
        info!(key, id = manifest.id(), name = manifest.name(), "manifest loaded");
        Ok(Some(manifest))
    }

    pub async fn save(&self, store: &dyn BackingStore, key: &str) -> crate::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.fields).map_err(StoreError::from)?;
        store.write(key, &bytes).await?;
        Ok(())
    }

    pub fn subscribe(&mut self, callback: impl FnMut() + Send + Sync + 'static) -> SubscriptionId {
        self.notifier.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn set_property(&mut self, path: &str, value: Value) -> crate::Result<ManifestOperation> {
        self.perform(ManifestRequest::SetProperty {
            path: path.to_string(),
            value,
        })
    }
}

impl Applier for ProjectManifest {
    type Operation = ManifestOperation;

    fn apply(&mut self, operation: &ManifestOperation) -> Result<(), ApplyError> {
        match operation {
            ManifestOperation::SetProperty { path, value } => {
                set_at_path(&mut self.fields, path, value.clone())?;
            }
        }
        Ok(())
    }
}

impl Mutator for ProjectManifest {
    type Request = ManifestRequest;

    fn resolve(&mut self, request: ManifestRequest) -> Result<ManifestOperation, RequestError> {
        match request {
            ManifestRequest::SetProperty { path, value } => {
                validate_property(&self.schema, &[], &self.fields, &path, &value)?;
                Ok(ManifestOperation::SetProperty { path, value })
            }
        }
    }

    fn notifier(&mut self) -> &mut ChangeNotifier {
        &mut self.notifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_new_manifest() {
        let manifest = ProjectManifest::new("ab12", "Tetris").unwrap();
        assert_eq!(
            manifest.to_value(),
            json!({ "id": "ab12", "name": "Tetris", "description": "", "formatVersion": 1 })
        );

        let err = ProjectManifest::new("abc", "Tetris").unwrap_err();
        assert!(err.to_string().starts_with("Invalid value for id"), "{err}");
        let err = ProjectManifest::new("ab12", "").unwrap_err();
        assert!(err.to_string().starts_with("Invalid value for name"), "{err}");
    }

    #[test]
    fn test_only_name_and_description_change() {
        let mut manifest = ProjectManifest::new("ab12", "Tetris").unwrap();

        let op = manifest.set_property("name", json!("Tetris 2")).unwrap();
        assert_eq!(op.value(), &json!("Tetris 2"));
        manifest
            .set_property("description", json!("Falling blocks"))
            .unwrap();
        assert_eq!(manifest.name(), "Tetris 2");
        assert_eq!(manifest.description(), "Falling blocks");

        let err = manifest
            .set_property("description", json!("x".repeat(301)))
            .unwrap_err();
        assert!(err.to_string().contains("description"));

        let err = manifest.set_property("formatVersion", json!(7)).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"Invalid value for formatVersion: Immutable");

        let err = manifest.set_property("id", json!("zz99")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid key: id");
    }

    #[test]
    fn test_mirror_follows_operations() {
        let mut authority = ProjectManifest::new("ab12", "Tetris").unwrap();
        let mut mirror = ProjectManifest::from_value(&authority.to_value()).unwrap();

        let op = authority.set_property("name", json!("Pong")).unwrap();
        mirror.apply(&op).unwrap();
        assert_eq!(mirror.to_value(), authority.to_value());
    }

    #[test]
    fn test_stored_manifest_versions() {
        let legacy = json!({ "id": "ab12", "name": "Old", "description": "" });
        let manifest = ProjectManifest::from_value(&legacy).unwrap();
        assert_eq!(manifest.get("formatVersion"), Some(&json!(FORMAT_VERSION)));

        let future = json!({ "id": "ab12", "name": "New", "description": "", "formatVersion": 9 });
        assert_eq!(
            ProjectManifest::from_value(&future).unwrap_err(),
            LoadError::FormatVersion {
                found: 9,
                supported: FORMAT_VERSION
            }
        );

        let missing = json!({ "id": "ab12", "description": "" });
        assert!(matches!(
            ProjectManifest::from_value(&missing),
            Err(LoadError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_load_and_save() {
        let store = MemoryStore::new();
        assert!(ProjectManifest::load(&store, "manifest").await.unwrap().is_none());

        let mut manifest = ProjectManifest::new("ab12", "Tetris").unwrap();
        manifest.set_property("description", json!("blocks")).unwrap();
        manifest.save(&store, "manifest").await.unwrap();

        let loaded = ProjectManifest::load(&store, "manifest").await.unwrap().unwrap();
        assert_eq!(loaded.to_value(), manifest.to_value());
    }
}
