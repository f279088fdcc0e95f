//! Authoritative documents and the connections subscribed to them.
//!
//! Each document sits behind its own async mutex together with the outboxes
//! of its subscribers. The lock serializes requests against the document and
//! makes callers queue while a room is loading. A resolved operation is
//! queued on every outbox before the lock is released, and the requester's
//! own result goes onto its outbox at the same point, so every connection
//! sees operations in apply order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use supersync_core::manifest::PROJECT_ID_LENGTH;
use supersync_core::{
    BackingStore, ManifestOperation, ManifestRequest, Mutator, ProjectEntries, ProjectManifest,
    RequestError, Room, RoomOperation, RoomState, TreeOperation, TreeRequest,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::protocol::{ConnectionId, DocumentId, ServerMessage};

pub const ENTRIES_KEY: &str = "entries";
pub const MANIFEST_KEY: &str = "manifest";
const DEFAULT_PROJECT_NAME: &str = "Untitled project";

/// What a request hands back to its sender.
pub fn tree_result(operation: &TreeOperation) -> Option<Value> {
    match operation {
        TreeOperation::Add { index, .. } | TreeOperation::Move { index, .. } => {
            Some(Value::from(*index))
        }
        TreeOperation::SetProperty { value, .. } => Some(value.clone()),
        TreeOperation::Remove { .. } => None,
    }
}

fn room_result(operation: &RoomOperation) -> Option<Value> {
    match operation {
        RoomOperation::AppendMessage { entry } => serde_json::to_value(entry).ok(),
        RoomOperation::Join { .. } | RoomOperation::Leave { .. } => None,
    }
}

fn room_key(id: &str) -> String {
    format!("room-{}", id)
}

/// One connection's queue of outgoing messages.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection: ConnectionId,
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl Subscriber {
    pub fn new(connection: ConnectionId, outbox: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { connection, outbox }
    }

    /// False once the connection has gone away.
    fn send(&self, message: ServerMessage) -> bool {
        self.outbox.send(message).is_ok()
    }
}

/// Who sent a mutation, and which request its result answers.
#[derive(Debug, Clone)]
pub struct Origin {
    pub subscriber: Subscriber,
    pub request_id: u64,
}

impl Origin {
    pub fn new(subscriber: Subscriber, request_id: u64) -> Self {
        Self {
            subscriber,
            request_id,
        }
    }
}

struct Hosted<T> {
    document: T,
    subscribers: Vec<Subscriber>,
}

impl<T> Hosted<T> {
    fn new(document: T) -> Self {
        Self {
            document,
            subscribers: Vec::new(),
        }
    }

    /// Answer the subscribe request with `snapshot`, then start relaying.
    fn attach(&mut self, subscriber: Subscriber, request_id: u64, snapshot: Value) {
        if subscriber.send(ServerMessage::ok(request_id, Some(snapshot))) {
            self.subscribers.push(subscriber);
        }
    }

    fn detach(&mut self, connection: ConnectionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers
            .retain(|subscriber| subscriber.connection != connection);
        self.subscribers.len() != before
    }

    /// Answer the origin, then relay the operation to everyone else.
    fn publish<O: Serialize>(
        &mut self,
        document: &DocumentId,
        origin: &Origin,
        operation: &O,
        result: Option<Value>,
    ) {
        origin
            .subscriber
            .send(ServerMessage::ok(origin.request_id, result));
        self.broadcast(document, origin.subscriber.connection, operation);
    }

    fn broadcast<O: Serialize>(&mut self, document: &DocumentId, from: ConnectionId, operation: &O) {
        let operation = match serde_json::to_value(operation) {
            Ok(operation) => operation,
            Err(err) => {
                error!(%document, %err, "failed to encode operation");
                return;
            }
        };
        let message = ServerMessage::Broadcast {
            document: document.clone(),
            operation,
        };

        let mut delivered = 0usize;
        self.subscribers.retain(|subscriber| {
            if subscriber.connection == from {
                return true;
            }
            if subscriber.send(message.clone()) {
                delivered += 1;
                true
            } else {
                debug!(%document, conn = %subscriber.connection, "dropping closed subscriber");
                false
            }
        });
        debug!(%document, origin = %from, delivered, "operation published");
    }
}

type RoomSlot = Mutex<Hosted<Room>>;

pub struct Hub {
    store: Arc<dyn BackingStore>,
    manifest: Mutex<Hosted<ProjectManifest>>,
    entries: Mutex<Hosted<ProjectEntries>>,
    rooms: RwLock<HashMap<String, Arc<RoomSlot>>>,
    /// Latest failure per store key, cleared by the next good save
    save_errors: parking_lot::Mutex<BTreeMap<String, String>>,
}

impl Hub {
    /// Load the project manifest and entries, creating a manifest for a
    /// brand new project. No rooms are loaded yet.
    pub async fn open(store: Arc<dyn BackingStore>) -> supersync_core::Result<Self> {
        let manifest = match ProjectManifest::load(store.as_ref(), MANIFEST_KEY).await? {
            Some(manifest) => manifest,
            None => {
                let id: String = Uuid::new_v4()
                    .simple()
                    .to_string()
                    .chars()
                    .take(PROJECT_ID_LENGTH)
                    .collect();
                let manifest = ProjectManifest::new(&id, DEFAULT_PROJECT_NAME)?;
                manifest.save(store.as_ref(), MANIFEST_KEY).await?;
                info!(id = manifest.id(), "created project manifest");
                manifest
            }
        };
        let entries = ProjectEntries::load(store.as_ref(), ENTRIES_KEY).await?;

        Ok(Self {
            store,
            manifest: Mutex::new(Hosted::new(manifest)),
            entries: Mutex::new(Hosted::new(entries)),
            rooms: RwLock::new(HashMap::new()),
            save_errors: parking_lot::Mutex::new(BTreeMap::new()),
        })
    }

    fn record_save(&self, key: &str, result: supersync_core::Result<()>) -> supersync_core::Result<()> {
        let mut errors = self.save_errors.lock();
        match &result {
            Ok(()) => {
                if errors.remove(key).is_some() {
                    info!(key, "document saved again");
                }
            }
            Err(err) => {
                error!(key, %err, "failed to save document");
                errors.insert(key.to_string(), err.to_string());
            }
        }
        result
    }

    /// Documents whose latest save failed, with the failure.
    pub fn save_errors(&self) -> BTreeMap<String, String> {
        self.save_errors.lock().clone()
    }

    pub async fn subscribe_manifest(&self, subscriber: Subscriber, request_id: u64) {
        let mut hosted = self.manifest.lock().await;
        let snapshot = hosted.document.to_value();
        hosted.attach(subscriber, request_id, snapshot);
    }

    pub async fn unsubscribe_manifest(&self, connection: ConnectionId) -> bool {
        self.manifest.lock().await.detach(connection)
    }

    pub async fn manifest_request(
        &self,
        origin: &Origin,
        request: ManifestRequest,
    ) -> supersync_core::Result<ManifestOperation> {
        let mut hosted = self.manifest.lock().await;
        let operation = hosted.document.perform(request)?;
        let result = Some(operation.value().clone());
        hosted.publish(&DocumentId::Manifest, origin, &operation, result);

        let saved = hosted.document.save(self.store.as_ref(), MANIFEST_KEY).await;
        // Surfaced through /api/status; the request itself went through
        let _ = self.record_save(MANIFEST_KEY, saved);
        Ok(operation)
    }

    pub async fn subscribe_entries(&self, subscriber: Subscriber, request_id: u64) {
        let mut hosted = self.entries.lock().await;
        let snapshot = hosted.document.tree().to_value();
        hosted.attach(subscriber, request_id, snapshot);
    }

    pub async fn unsubscribe_entries(&self, connection: ConnectionId) -> bool {
        self.entries.lock().await.detach(connection)
    }

    pub async fn entries_request(
        &self,
        origin: &Origin,
        request: TreeRequest,
    ) -> supersync_core::Result<TreeOperation> {
        let mut hosted = self.entries.lock().await;
        let operation = hosted.document.request(request)?;
        hosted.publish(&DocumentId::Entries, origin, &operation, tree_result(&operation));

        let saved = hosted.document.save(self.store.as_ref(), ENTRIES_KEY).await;
        let _ = self.record_save(ENTRIES_KEY, saved);
        Ok(operation)
    }

    async fn room_slot(&self, id: &str) -> Arc<RoomSlot> {
        if let Some(slot) = self.rooms.read().await.get(id).cloned() {
            return slot;
        }

        let mut guard = self.rooms.write().await;
        guard
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Hosted::new(Room::new(id)))))
            .clone()
    }

    async fn loaded_slot(&self, id: &str) -> Result<Arc<RoomSlot>, RequestError> {
        self.rooms
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(RequestError::NotReady)
    }

    async fn discard_slot(&self, id: &str, slot: &Arc<RoomSlot>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            rooms.remove(id);
        }
    }

    /// Join `user` to a room, loading it first if needed.
    ///
    /// The subscriber is answered with the room's public state including
    /// the join, and receives everything after it.
    pub async fn join_room(
        &self,
        id: &str,
        subscriber: Subscriber,
        request_id: u64,
        user: &str,
    ) -> supersync_core::Result<()> {
        loop {
            let slot = self.room_slot(id).await;
            let mut hosted = slot.lock().await;
            match hosted.document.state() {
                RoomState::TornDown => {
                    // Lost a race with the last user leaving
                    drop(hosted);
                    self.discard_slot(id, &slot).await;
                    continue;
                }
                RoomState::Unloaded | RoomState::Loading => {
                    hosted.document.load(self.store.as_ref(), &room_key(id)).await?;
                }
                RoomState::Ready => {}
            }

            let operation = hosted.document.join(user)?;
            let document = DocumentId::Room(id.to_string());
            hosted.broadcast(&document, subscriber.connection, &operation);
            let snapshot = hosted.document.to_value();
            hosted.attach(subscriber, request_id, snapshot);
            return Ok(());
        }
    }

    /// Drop one of `user`'s connections from a room. The room is saved and
    /// unloaded once nobody is left.
    pub async fn leave_room(
        &self,
        id: &str,
        connection: ConnectionId,
        user: &str,
    ) -> supersync_core::Result<()> {
        let slot = self.loaded_slot(id).await?;
        let mut hosted = slot.lock().await;
        hosted.detach(connection);
        let operation = hosted.document.leave(user)?;
        hosted.broadcast(&DocumentId::Room(id.to_string()), connection, &operation);

        if !hosted.document.roster().is_empty() {
            return Ok(());
        }
        let key = room_key(id);
        let saved = hosted.document.save(self.store.as_ref(), &key).await;
        if self.record_save(&key, saved).is_ok() {
            hosted.document.unload();
            drop(hosted);
            self.discard_slot(id, &slot).await;
            info!(room = %id, "room unloaded");
        } else {
            info!(room = %id, "keeping unsaved room loaded");
        }
        Ok(())
    }

    pub async fn append_message(
        &self,
        id: &str,
        origin: &Origin,
        author: &str,
        text: &str,
    ) -> supersync_core::Result<RoomOperation> {
        let slot = self.loaded_slot(id).await?;
        let mut hosted = slot.lock().await;
        let operation = hosted.document.append_message(author, text)?;
        hosted.publish(
            &DocumentId::Room(id.to_string()),
            origin,
            &operation,
            room_result(&operation),
        );
        Ok(operation)
    }

    pub async fn loaded_rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Persist every loaded document.
    pub async fn save_all(&self) -> supersync_core::Result<()> {
        let saved = self
            .manifest
            .lock()
            .await
            .document
            .save(self.store.as_ref(), MANIFEST_KEY)
            .await;
        self.record_save(MANIFEST_KEY, saved)?;

        let saved = self
            .entries
            .lock()
            .await
            .document
            .save(self.store.as_ref(), ENTRIES_KEY)
            .await;
        self.record_save(ENTRIES_KEY, saved)?;

        let slots: Vec<(String, Arc<RoomSlot>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        for (id, slot) in slots {
            let hosted = slot.lock().await;
            if hosted.document.is_ready() {
                let key = room_key(&id);
                let saved = hosted.document.save(self.store.as_ref(), &key).await;
                self.record_save(&key, saved)?;
            }
        }
        Ok(())
    }
}
