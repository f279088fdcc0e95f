//! Collaborative rooms: a live user roster plus a bounded chat history.
//!
//! The roster is a [`HashById`] keyed by username, reference counted by the
//! number of open connections. It only lives in memory; [`Room::save`]
//! persists the history alone and [`Room::load`] always starts from an empty
//! roster.

use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::{ApplyError, RequestError, StoreError};
use crate::hash::{HashById, HashOperation, HashRequest};
use crate::notify::{ChangeNotifier, SubscriptionId};
use crate::replica::{Applier, Mutator};
use crate::schema::{Rule, Schema};
use crate::store::BackingStore;

/// Messages kept in a room's history.
pub const MAX_HISTORY: usize = 100;

/// Longest accepted message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 300;

const CONNECTION_COUNT: &str = "connectionCount";

/// Schema for roster entries.
pub fn roster_schema() -> Schema {
    Schema::new()
        .with("id", Rule::string())
        .with(CONNECTION_COUNT, Rule::integer().min(1.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Unloaded,
    Loading,
    Ready,
    TornDown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub author: String,
    pub text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedRoom {
    #[serde(default)]
    history: Vec<MessageEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RoomRequest {
    Join { user: String },
    Leave { user: String },
    AppendMessage { author: String, text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RoomOperation {
    /// With an index, `item` is a new roster entry inserted there. Without
    /// one, it carries the existing entry's new connection count.
    Join {
        item: Map<String, Value>,
        index: Option<usize>,
    },
    Leave {
        id: String,
    },
    AppendMessage {
        entry: MessageEntry,
    },
}

#[derive(Debug)]
pub struct Room {
    id: String,
    state: RoomState,
    roster: HashById,
    history: VecDeque<MessageEntry>,
    notifier: ChangeNotifier,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: RoomState::Unloaded,
            roster: HashById::new(roster_schema()),
            history: VecDeque::new(),
            notifier: ChangeNotifier::new(),
        }
    }

    /// Build a ready mirror from a room's public state.
    pub fn mirror(id: impl Into<String>, snapshot: &Value) -> crate::Result<Self> {
        let mut room = Self::new(id);
        let users = snapshot.get("users").cloned().unwrap_or_else(|| json!([]));
        room.roster = HashById::from_value(&users, roster_schema())?;
        let history = snapshot.get("history").cloned().unwrap_or_else(|| json!([]));
        let history: Vec<MessageEntry> =
            serde_json::from_value(history).map_err(StoreError::from)?;
        room.history = history.into();
        room.state = RoomState::Ready;
        Ok(room)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == RoomState::Ready
    }

    pub fn roster(&self) -> &HashById {
        &self.roster
    }

    pub fn history(&self) -> &VecDeque<MessageEntry> {
        &self.history
    }

    pub fn connection_count(&self, user: &str) -> Option<i64> {
        self.roster.get(user)?.get(CONNECTION_COUNT)?.as_i64()
    }

    /// Public state: `{ "users": [...], "history": [...] }`.
    pub fn to_value(&self) -> Value {
        json!({
            "users": self.roster.to_value(),
            "history": self.history,
        })
    }

    /// Read the persisted history for `key`, resetting the roster.
    ///
    /// A missing document is an empty history. Any other failure leaves the
    /// room unloaded.
    pub async fn load(&mut self, store: &dyn BackingStore, key: &str) -> crate::Result<()> {
        self.state = RoomState::Loading;
        match Self::read_history(store, key).await {
            Ok(history) => {
                self.history = history;
                self.roster = HashById::new(roster_schema());
                self.state = RoomState::Ready;
                info!(room = %self.id, messages = self.history.len(), "room loaded");
                Ok(())
            }
            Err(err) => {
                self.state = RoomState::Unloaded;
                Err(err)
            }
        }
    }

    async fn read_history(
        store: &dyn BackingStore,
        key: &str,
    ) -> crate::Result<VecDeque<MessageEntry>> {
        let persisted = match store.read(key).await? {
            Some(bytes) => {
                serde_json::from_slice::<PersistedRoom>(&bytes).map_err(StoreError::from)?
            }
            None => PersistedRoom::default(),
        };
        let mut history: VecDeque<MessageEntry> = persisted.history.into();
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
        Ok(history)
    }

    /// Persist the history. The roster is never written.
    pub async fn save(&self, store: &dyn BackingStore, key: &str) -> crate::Result<()> {
        let persisted = PersistedRoom {
            history: self.history.iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&persisted).map_err(StoreError::from)?;
        store.write(key, &bytes).await?;
        info!(room = %self.id, messages = persisted.history.len(), "room saved");
        Ok(())
    }

    /// Detach every listener and retire the room.
    pub fn unload(&mut self) {
        self.notifier.clear();
        self.roster.clear_subscribers();
        self.state = RoomState::TornDown;
    }

    pub fn subscribe(&mut self, callback: impl FnMut() + Send + Sync + 'static) -> SubscriptionId {
        self.notifier.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn join(&mut self, user: &str) -> crate::Result<RoomOperation> {
        self.perform(RoomRequest::Join {
            user: user.to_string(),
        })
    }

    pub fn leave(&mut self, user: &str) -> crate::Result<RoomOperation> {
        self.perform(RoomRequest::Leave {
            user: user.to_string(),
        })
    }

    pub fn append_message(&mut self, author: &str, text: &str) -> crate::Result<RoomOperation> {
        self.perform(RoomRequest::AppendMessage {
            author: author.to_string(),
            text: text.to_string(),
        })
    }

    fn resolve_join(&mut self, user: String) -> Result<RoomOperation, RequestError> {
        if let Some(count) = self.connection_count(&user) {
            let operation = self.roster.resolve(HashRequest::SetProperty {
                id: user.clone(),
                path: CONNECTION_COUNT.into(),
                value: json!(count + 1),
            })?;
            let mut item = Map::new();
            item.insert("id".into(), Value::String(user));
            item.insert(CONNECTION_COUNT.into(), operation.value().cloned().unwrap_or_default());
            return Ok(RoomOperation::Join { item, index: None });
        }

        let (item, index) = self
            .roster
            .resolve_entry(json!({ "id": user, "connectionCount": 1 }), None)?;
        Ok(RoomOperation::Join {
            item,
            index: Some(index),
        })
    }
}

impl Applier for Room {
    type Operation = RoomOperation;

    fn apply(&mut self, operation: &RoomOperation) -> Result<(), ApplyError> {
        match operation {
            RoomOperation::Join {
                item,
                index: Some(index),
            } => self.roster.apply(&HashOperation::Add {
                item: item.clone(),
                index: *index,
            }),
            RoomOperation::Join { item, index: None } => {
                let id = item
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ApplyError::Malformed("join without a user id".into()))?;
                let count = item
                    .get(CONNECTION_COUNT)
                    .cloned()
                    .ok_or_else(|| ApplyError::Malformed("join without a connection count".into()))?;
                self.roster.apply(&HashOperation::SetProperty {
                    id: id.to_string(),
                    path: CONNECTION_COUNT.into(),
                    value: count,
                })
            }
            RoomOperation::Leave { id } => {
                let count = self
                    .connection_count(id)
                    .ok_or_else(|| ApplyError::UnknownNode(id.clone()))?;
                if count > 1 {
                    self.roster.apply(&HashOperation::SetProperty {
                        id: id.clone(),
                        path: CONNECTION_COUNT.into(),
                        value: json!(count - 1),
                    })
                } else {
                    self.roster.apply(&HashOperation::Remove { id: id.clone() })
                }
            }
            RoomOperation::AppendMessage { entry } => {
                self.history.push_back(entry.clone());
                if self.history.len() > MAX_HISTORY {
                    self.history.pop_front();
                }
                Ok(())
            }
        }
    }
}

impl Mutator for Room {
    type Request = RoomRequest;

    fn resolve(&mut self, request: RoomRequest) -> Result<RoomOperation, RequestError> {
        if self.state != RoomState::Ready {
            return Err(RequestError::NotReady);
        }
        match request {
            RoomRequest::Join { user } => self.resolve_join(user),
            RoomRequest::Leave { user } => {
                if !self.roster.contains(&user) {
                    return Err(RequestError::UnknownUser(user));
                }
                Ok(RoomOperation::Leave { id: user })
            }
            RoomRequest::AppendMessage { author, text } => {
                if text.chars().count() > MAX_MESSAGE_CHARS {
                    return Err(RequestError::MessageTooLong);
                }
                Ok(RoomOperation::AppendMessage {
                    entry: MessageEntry {
                        timestamp: Utc::now().timestamp_millis(),
                        author,
                        text,
                    },
                })
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
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn ready_room() -> Room {
        let mut room = Room::new("lobby");
        room.load(&MemoryStore::new(), "lobby").await.unwrap();
        room
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_room_can_be_shared_across_tasks() {
        let mut room = ready_room().await;
        room.subscribe(|| {});
        let store = MemoryStore::new();

        let save = room.save(&store, "lobby");
        assert_send(&save);
        save.await.unwrap();

        let shared = Arc::new(tokio::sync::Mutex::new(room));
        let handle = tokio::spawn({
            let shared = shared.clone();
            async move {
                let room = shared.lock().await;
                room.save(&store, "lobby").await
            }
        });
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_join_is_reference_counted() {
        let mut room = ready_room().await;

        let first = room.join("alice").unwrap();
        assert!(matches!(first, RoomOperation::Join { index: Some(0), .. }));
        let second = room.join("alice").unwrap();
        assert!(matches!(second, RoomOperation::Join { index: None, .. }));

        assert_eq!(room.roster().len(), 1);
        assert_eq!(room.connection_count("alice"), Some(2));

        room.leave("alice").unwrap();
        assert_eq!(room.connection_count("alice"), Some(1));
        room.leave("alice").unwrap();
        assert!(room.roster().is_empty());

        let err = room.leave("alice").unwrap_err();
        assert_eq!(err.as_request(), Some(&RequestError::UnknownUser("alice".into())));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut room = ready_room().await;
        for n in 0..=MAX_HISTORY {
            room.append_message("alice", &format!("message {}", n)).unwrap();
        }

        assert_eq!(room.history().len(), MAX_HISTORY);
        assert_eq!(room.history().front().unwrap().text, "message 1");
        assert_eq!(room.history().back().unwrap().text, "message 100");
    }

    #[tokio::test]
    async fn test_long_messages_are_rejected() {
        let mut room = ready_room().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        room.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = room.append_message("alice", &"x".repeat(301)).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"Your message was too long");
        assert!(room.history().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        room.append_message("alice", &"é".repeat(300)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_requests_need_a_ready_room() {
        let mut room = Room::new("lobby");
        assert_eq!(room.state(), RoomState::Unloaded);
        let err = room.join("alice").unwrap_err();
        assert_eq!(err.as_request(), Some(&RequestError::NotReady));
    }

    #[tokio::test]
    async fn test_save_excludes_roster() {
        let store = MemoryStore::new();
        let mut room = Room::new("lobby");
        room.load(&store, "lobby").await.unwrap();
        room.join("alice").unwrap();
        room.append_message("alice", "hello").unwrap();
        room.save(&store, "lobby").await.unwrap();

        let bytes = store.read("lobby").await.unwrap().unwrap();
        let saved: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(saved.get("users").is_none());
        assert_eq!(saved["history"][0]["text"], "hello");

        let mut reloaded = Room::new("lobby");
        reloaded.load(&store, "lobby").await.unwrap();
        assert!(reloaded.roster().is_empty());
        assert_eq!(reloaded.history().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_history_leaves_room_unloaded() {
        let store = MemoryStore::new();
        store.write("lobby", b"not json").await.unwrap();

        let mut room = Room::new("lobby");
        let err = room.load(&store, "lobby").await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Json(_))));
        assert!(!room.is_ready());
    }

    #[tokio::test]
    async fn test_mirror_follows_resolved_operations() {
        let mut room = ready_room().await;
        let mut mirror = Room::mirror("lobby", &room.to_value()).unwrap();

        let ops = vec![
            room.join("alice").unwrap(),
            room.join("bob").unwrap(),
            room.join("alice").unwrap(),
            room.append_message("bob", "hi").unwrap(),
            room.leave("alice").unwrap(),
            room.leave("bob").unwrap(),
        ];
        for op in &ops {
            mirror.apply(op).unwrap();
        }

        assert_eq!(mirror.to_value(), room.to_value());
        assert_eq!(mirror.connection_count("alice"), Some(1));
        assert!(!mirror.roster().contains("bob"));
    }

    #[tokio::test]
    async fn test_unload_detaches_listeners() {
        let mut room = ready_room().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        room.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        room.unload();
        assert_eq!(room.state(), RoomState::TornDown);
        assert!(room.append_message("alice", "late").is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
