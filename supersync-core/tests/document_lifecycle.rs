//! Load/save lifecycles against a real directory.

use serde_json::{json, Value};
use supersync_core::{BackingStore, FsStore, ProjectEntries, Room, RoomState};
use tempfile::TempDir;

#[tokio::test]
async fn test_room_history_survives_restart() {
    let dir = TempDir::new().unwrap();
    let store = FsStore::new(dir.path().join("rooms"));

    let mut room = Room::new("general");
    room.load(&store, "general").await.unwrap();
    assert_eq!(room.state(), RoomState::Ready);
    assert!(room.history().is_empty());

    room.join("alice").unwrap();
    room.join("alice").unwrap();
    room.append_message("alice", "first").unwrap();
    room.append_message("alice", "second").unwrap();
    room.save(&store, "general").await.unwrap();
    room.unload();

    let raw = std::fs::read_to_string(dir.path().join("rooms/general.json")).unwrap();
    let saved: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(saved.as_object().unwrap().len(), 1);
    assert_eq!(saved["history"][1]["author"], "alice");

    let mut restarted = Room::new("general");
    restarted.load(&store, "general").await.unwrap();
    assert!(restarted.roster().is_empty());
    let texts: Vec<&str> = restarted.history().iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, ["first", "second"]);
}

#[tokio::test]
async fn test_oversized_stored_history_is_trimmed() {
    let dir = TempDir::new().unwrap();
    let store = FsStore::new(dir.path());
    let history: Vec<Value> = (0..150)
        .map(|n| json!({ "timestamp": n, "author": "bob", "text": n.to_string() }))
        .collect();
    store
        .write("old", &serde_json::to_vec(&json!({ "history": history })).unwrap())
        .await
        .unwrap();

    let mut room = Room::new("old");
    room.load(&store, "old").await.unwrap();
    assert_eq!(room.history().len(), 100);
    assert_eq!(room.history().front().unwrap().text, "50");
}

#[tokio::test]
async fn test_entries_survive_restart() {
    let dir = TempDir::new().unwrap();
    let store = FsStore::new(dir.path());

    let mut entries = ProjectEntries::load(&store, "entries").await.unwrap();
    let folder = entries
        .add(json!({ "name": "scenes", "type": null, "children": [] }), None, None)
        .unwrap();
    let folder = folder.node_id().to_string();
    let scene = entries
        .add(json!({ "name": "Main", "type": "scene" }), Some(&folder), None)
        .unwrap();
    let scene = scene.node_id().to_string();
    entries.save(&store, "entries").await.unwrap();

    let reloaded = ProjectEntries::load(&store, "entries").await.unwrap();
    assert_eq!(reloaded.tree().get_path_from_id(&scene).unwrap(), "scenes/Main");
    assert_eq!(reloaded.tree().next_id(), 2);
    assert_eq!(reloaded.to_persisted(), entries.to_persisted());
}

#[tokio::test]
async fn test_unreadable_entries_are_fatal() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("entries.json"), "{\"nodes\": 5}").unwrap();
    let store = FsStore::new(dir.path());

    let err = ProjectEntries::load(&store, "entries").await.unwrap_err();
    assert!(!err.is_recoverable());
}
