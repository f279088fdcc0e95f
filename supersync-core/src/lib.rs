//! Replicated documents for supersync
//!
//! One authoritative process owns each document and validates every
//! request against the document's [`Schema`]. A successful request resolves
//! into an operation with every free parameter fixed (ids, indices,
//! timestamps). The authority applies it and broadcasts it, and each mirror
//! applies the same operation verbatim.
//!
//! - [`TreeById`]: ordered forest of named nodes (project file trees)
//! - [`HashById`]: flat keyed collection
//! - [`Room`]: user roster plus a bounded message history
//! - [`ProjectEntries`]: the file tree with per-folder unique names
//! - [`ProjectManifest`]: the project's name and description

pub mod entries;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod notify;
pub mod replica;
pub mod room;
pub mod schema;
pub mod store;
pub mod tree;

pub use entries::ProjectEntries;
pub use error::{ApplyError, Error, LoadError, RequestError, Result, StoreError};
pub use hash::{HashById, HashItem, HashOperation, HashRequest, ItemId};
pub use manifest::{ManifestOperation, ManifestRequest, ProjectManifest};
pub use notify::{ChangeNotifier, SubscriptionId};
pub use replica::{Applier, Mutator};
pub use room::{MessageEntry, Room, RoomOperation, RoomRequest, RoomState};
pub use schema::{check_violation, format_violation, Rule, RuleKind, Schema, Violation, ViolationKind};
pub use store::{BackingStore, FsStore, MemoryStore};
pub use tree::{NodeId, TreeById, TreeNode, TreeOperation, TreeRequest};
