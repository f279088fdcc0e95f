//! The authoritative/mirror split shared by every replicated structure.
//!
//! An authoritative replica turns a client [`Mutator::Request`] into a fully
//! resolved [`Applier::Operation`] (ids assigned, indices clamped, values
//! validated) and then applies it to itself. Mirrors receive the same
//! resolved operation over the wire and feed it straight to
//! [`Applier::apply`]. Both sides run the same `apply` code, so as long as
//! operations arrive in order they end up with identical state.

use std::fmt::Debug;

use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::error::{ApplyError, RequestError};
use crate::notify::ChangeNotifier;
use crate::schema::{check_violation, Schema, Violation, ViolationKind};

/// Applies resolved operations without validation.
pub trait Applier {
    type Operation: Debug;

    fn apply(&mut self, operation: &Self::Operation) -> Result<(), ApplyError>;
}

/// Validates requests and resolves them into operations.
pub trait Mutator: Applier {
    type Request;

    /// Validate a request and fix every free parameter.
    ///
    /// Must not change observable state other than id allocation.
    fn resolve(&mut self, request: Self::Request) -> Result<Self::Operation, RequestError>;

    fn notifier(&mut self) -> &mut ChangeNotifier;

    /// Resolve, apply and notify. Returns the operation to broadcast.
    fn perform(&mut self, request: Self::Request) -> crate::Result<Self::Operation> {
        let operation = self.resolve(request)?;
        if let Err(err) = self.apply(&operation) {
            error!(?operation, %err, "resolved operation failed to apply");
            return Err(err.into());
        }
        debug!(?operation, "operation applied");
        self.notifier().notify();
        Ok(operation)
    }
}

/// Clamp a requested insertion index into `[0, len]`. `None` appends.
pub(crate) fn clamp_index(index: Option<i64>, len: usize) -> usize {
    match index {
        None => len,
        Some(i) if i <= 0 => 0,
        Some(i) => usize::try_from(i).map_or(len, |i| i.min(len)),
    }
}

/// Validate the fields of a brand new item against the schema.
///
/// `id` is handled by the caller and must not be present in `fields`.
pub(crate) fn validate_new_fields(
    schema: &Schema,
    fields: &Map<String, Value>,
) -> Result<(), RequestError> {
    for (key, value) in fields {
        let rule = schema
            .get(key)
            .ok_or_else(|| RequestError::InvalidKey(key.clone()))?;
        if let Some(violation) = check_violation(value, rule, true) {
            return Err(RequestError::InvalidValue {
                key: key.clone(),
                violation,
            });
        }
    }

    for (key, rule) in schema.iter() {
        if key == "id" || rule.optional {
            continue;
        }
        if !fields.contains_key(key) {
            return Err(RequestError::MissingKey(key.to_string()));
        }
    }

    Ok(())
}

/// Validate a client-supplied id, if any. Returns the id to use.
pub(crate) fn validate_client_id(
    schema: &Schema,
    id: Option<Value>,
) -> Result<Option<String>, RequestError> {
    let id = match id {
        None | Some(Value::Null) => return Ok(None),
        Some(id) => id,
    };
    let rule = schema.get("id").ok_or(RequestError::UnexpectedId)?;
    if let Some(violation) = check_violation(&id, rule, true) {
        return Err(RequestError::InvalidValue {
            key: "id".into(),
            violation,
        });
    }
    match id {
        Value::String(id) => Ok(Some(id)),
        _ => Err(RequestError::InvalidValue {
            key: "id".into(),
            violation: Violation {
                kind: ViolationKind::ExpectedType("string"),
                path: String::new(),
            },
        }),
    }
}

/// Validate a property write against the schema and the current fields.
///
/// Paths through an `any` rule are accepted whatever their tail.
pub(crate) fn validate_property(
    schema: &Schema,
    structural: &[&str],
    fields: &Map<String, Value>,
    path: &str,
    value: &Value,
) -> Result<(), RequestError> {
    let head = path.split('.').next().unwrap_or_default();
    if head == "id" || structural.contains(&head) {
        return Err(RequestError::InvalidKey(path.to_string()));
    }

    let rule = schema
        .resolve_path(path)
        .ok_or_else(|| RequestError::InvalidKey(path.to_string()))?;
    if !rule.is_any() {
        if let Some(violation) = check_violation(value, rule, false) {
            return Err(RequestError::InvalidValue {
                key: path.to_string(),
                violation,
            });
        }
    }

    if parent_object(fields, path).is_none() {
        return Err(RequestError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Replace the value at a dotted path, returning the previous one.
pub(crate) fn set_at_path(
    fields: &mut Map<String, Value>,
    path: &str,
    value: Value,
) -> Result<Option<Value>, ApplyError> {
    let (parents, last) = split_path(path);
    let mut target = fields;
    for segment in parents {
        target = target
            .get_mut(segment)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ApplyError::InvalidPath(path.to_string()))?;
    }
    Ok(target.insert(last.to_string(), value))
}

/// Read the value at a dotted path.
pub(crate) fn get_at_path<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let (_, last) = split_path(path);
    parent_object(fields, path)?.get(last)
}

fn parent_object<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Map<String, Value>> {
    let (parents, _) = split_path(path);
    let mut target = fields;
    for segment in parents {
        target = target.get(segment)?.as_object()?;
    }
    Some(target)
}

fn split_path(path: &str) -> (impl Iterator<Item = &str>, &str) {
    let (parents, last) = match path.rsplit_once('.') {
        Some((parents, last)) => (Some(parents), last),
        None => (None, path),
    };
    (parents.into_iter().flat_map(|p| p.split('.')), last)
}
