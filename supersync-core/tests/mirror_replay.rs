//! Replaying the authority's resolved operations on a fresh mirror must
//! reproduce the authority's state exactly.

use proptest::prelude::*;
use serde_json::{json, Value};
use supersync_core::{
    Applier, HashById, HashOperation, Rule, Schema, TreeById, TreeOperation,
};

fn schema() -> Schema {
    Schema::new()
        .with("name", Rule::string().min_length(1))
        .with("type", Rule::string().optional())
        .with(
            "meta",
            Rule::hash([("color", Rule::string()), ("size", Rule::number())]).optional(),
        )
}

#[derive(Debug, Clone)]
enum Action {
    Add { group: bool, parent: usize, index: i64 },
    Move { node: usize, parent: usize, index: i64 },
    Remove { node: usize },
    Rename { node: usize, name: String },
    Resize { node: usize, size: f64 },
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (any::<bool>(), 0usize..12, -3i64..10)
            .prop_map(|(group, parent, index)| Action::Add { group, parent, index }),
        2 => (0usize..12, 0usize..12, -3i64..10)
            .prop_map(|(node, parent, index)| Action::Move { node, parent, index }),
        1 => (0usize..12).prop_map(|node| Action::Remove { node }),
        1 => (0usize..12, "[a-z]{0,6}").prop_map(|(node, name)| Action::Rename { node, name }),
        1 => (0usize..12, -5.0f64..5.0).prop_map(|(node, size)| Action::Resize { node, size }),
    ]
}

/// An existing id chosen by position; past the end means the root.
fn pick(tree: &TreeById, n: usize) -> Option<String> {
    let mut ids = Vec::new();
    tree.walk(|node, _| ids.push(node.id.clone()));
    ids.get(n).cloned()
}

fn run(tree: &mut TreeById, action: Action) -> Option<TreeOperation> {
    let result = match action {
        Action::Add { group, parent, index } => {
            let mut node = json!({ "name": "n", "meta": { "color": "red", "size": 1 } });
            if group {
                node["children"] = json!([]);
            }
            let parent = pick(tree, parent);
            tree.add(node, parent.as_deref(), Some(index))
        }
        Action::Move { node, parent, index } => {
            let id = pick(tree, node)?;
            let parent = pick(tree, parent);
            tree.move_node(&id, parent.as_deref(), Some(index))
        }
        Action::Remove { node } => {
            let id = pick(tree, node)?;
            tree.remove(&id)
        }
        Action::Rename { node, name } => {
            let id = pick(tree, node)?;
            tree.set_property(&id, "name", Value::String(name))
        }
        Action::Resize { node, size } => {
            let id = pick(tree, node)?;
            tree.set_property(&id, "meta.size", json!(size))
        }
    };
    result.ok()
}

proptest! {
    #[test]
    fn prop_tree_mirror_converges(actions in proptest::collection::vec(action(), 1..80)) {
        let mut authority = TreeById::new(schema());
        let mut mirror = TreeById::new(schema());

        for action in actions {
            if let Some(operation) = run(&mut authority, action) {
                mirror.apply(&operation).unwrap();
            }
        }

        prop_assert_eq!(mirror.to_value(), authority.to_value());
        prop_assert_eq!(mirror.len(), authority.len());
    }

    #[test]
    fn prop_operations_survive_the_wire(actions in proptest::collection::vec(action(), 1..40)) {
        let mut authority = TreeById::new(schema());
        let mut mirror = TreeById::new(schema());

        for action in actions {
            if let Some(operation) = run(&mut authority, action) {
                let wire = serde_json::to_string(&operation).unwrap();
                let decoded: TreeOperation = serde_json::from_str(&wire).unwrap();
                mirror.apply(&decoded).unwrap();
            }
        }

        prop_assert_eq!(mirror.to_value(), authority.to_value());
    }

    #[test]
    fn prop_hash_mirror_converges(
        steps in proptest::collection::vec((0u8..3, 0usize..8, -2i64..6), 1..60)
    ) {
        let schema = Schema::new().with("label", Rule::string());
        let mut authority = HashById::new(schema.clone());
        let mut mirror = HashById::new(schema);
        let mut log: Vec<HashOperation> = Vec::new();

        for (kind, n, index) in steps {
            let target = authority.ids().get(n).cloned();
            let result = match (kind, target) {
                (0, _) => authority.add(json!({ "label": "x" }), Some(index)),
                (1, Some(id)) => authority.remove(&id),
                (2, Some(id)) => authority.set_property(&id, "label", json!(format!("l{}", n))),
                _ => continue,
            };
            if let Ok(operation) = result {
                log.push(operation);
            }
        }

        for operation in &log {
            mirror.apply(operation).unwrap();
        }
        prop_assert_eq!(mirror.to_value(), authority.to_value());
    }
}

#[test]
fn test_snapshot_then_replay() {
    // A mirror that joins late starts from a snapshot and follows along
    let mut authority = TreeById::new(schema());
    let folder = authority
        .add(json!({ "name": "f", "children": [] }), None, None)
        .unwrap();
    let folder = folder.node_id().to_string();

    let mut mirror = TreeById::from_value(&authority.to_value(), schema(), None).unwrap();

    let ops = vec![
        authority.add(json!({ "name": "a" }), Some(&folder), None).unwrap(),
        authority.add(json!({ "name": "b" }), Some(&folder), Some(0)).unwrap(),
        authority.move_node("2", None, Some(0)).unwrap(),
    ];
    for op in &ops {
        mirror.apply(op).unwrap();
    }

    assert_eq!(mirror.to_value(), authority.to_value());
    assert_eq!(mirror.roots(), ["2", "0"]);
}

#[test]
fn test_floats_cross_the_wire_exactly() {
    let mut authority = TreeById::new(schema());
    let mut mirror = TreeById::new(schema());

    let size = -3.6925915591465084_f64;
    let ops = vec![
        authority
            .add(json!({ "name": "a", "meta": { "color": "red", "size": 1.0 } }), None, None)
            .unwrap(),
        authority.set_property("0", "meta.size", json!(size)).unwrap(),
    ];
    for op in &ops {
        let wire = serde_json::to_string(op).unwrap();
        let decoded: TreeOperation = serde_json::from_str(&wire).unwrap();
        mirror.apply(&decoded).unwrap();
    }

    let replicated = mirror.get("0").unwrap().get("meta.size").unwrap().as_f64().unwrap();
    assert_eq!(replicated.to_bits(), size.to_bits());
    assert_eq!(mirror.to_value(), authority.to_value());
}
