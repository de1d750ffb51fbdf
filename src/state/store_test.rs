use frames::Value;
use serde_json::json;

use super::*;
use crate::state::patch::{PathSegment, key_path};

fn notebook(running: bool) -> Value {
    Value::from(json!({
        "notebook_id": "nb",
        "process_status": "ready",
        "cell_inputs": {"a": {"code": "x = 1"}},
        "cell_results": {"a": {"running": running, "queued": false}},
        "cell_dependencies": {},
        "cell_order": ["a"],
        "bonds": {},
        "status_tree": {"name": "notebook", "subtasks": {}},
    }))
}

fn set_bond(draft: &mut Value, name: &str, value: i64) {
    if let Some(bonds) = draft.get_mut("bonds") {
        bonds.insert(name, Value::from(json!({"value": value})));
    }
}

// =============================================================================
// REMOTE APPLY
// =============================================================================

#[test]
fn failing_remote_batch_keeps_replica_and_is_not_ignorable() {
    let mut store = NotebookStore::from_replica(notebook(false));
    let before = store.replica().clone();

    let failure = store
        .apply_remote(&[
            Patch::replace(key_path(&["process_status"]), Value::from("busy")),
            Patch::replace(key_path(&["cell_inputs", "missing", "code"]), Value::from("y")),
        ])
        .expect_err("should fail");

    assert!(!failure.ignorable);
    assert_eq!(store.replica(), &before);
}

#[test]
fn status_tree_failures_are_ignorable() {
    let mut store = NotebookStore::from_replica(notebook(false));
    let failure = store
        .apply_remote(&[Patch::remove(key_path(&["status_tree", "subtasks", "gone"]))])
        .expect_err("should fail");
    assert!(failure.ignorable);
}

#[test]
fn orphaned_order_entries_are_pruned_after_apply() {
    let mut store = NotebookStore::from_replica(notebook(false));
    store
        .apply_remote(&[Patch::replace(key_path(&["cell_order"]), Value::from(json!(["a", "ghost"])))])
        .expect("apply");
    assert_eq!(store.view().cell_order(), vec!["a"]);
}

#[test]
fn reset_rebuilds_the_replica_from_scratch() {
    let mut store = NotebookStore::from_replica(notebook(true));
    store.apply_reset(&[Patch::replace(Vec::new(), notebook(false))]).expect("reset");
    assert_eq!(store.replica(), &notebook(false));

    let stale = store.apply_reset(&[Patch::replace(key_path(&["cell_inputs", "a"]), Value::Nil)]);
    assert!(stale.is_err(), "reset batches start from an empty map");
    assert_eq!(store.replica(), &notebook(false));
}

#[test]
fn base_override_returns_inverse_against_that_base() {
    let mut store = NotebookStore::new("nb");
    let base = notebook(false);
    let inverse = store
        .apply(
            &[Patch::replace(key_path(&["cell_inputs", "a", "code"]), Value::from("x = 2"))],
            Some(&base),
            true,
        )
        .expect("apply");

    assert_eq!(store.view().cell_code("a"), Some("x = 2"));
    assert_eq!(
        inverse,
        vec![Patch::replace(key_path(&["cell_inputs", "a", "code"]), Value::from("x = 1"))]
    );
}

// =============================================================================
// LOCAL MUTATION
// =============================================================================

#[test]
fn prepared_mutation_does_not_touch_replica_until_commit() {
    let mut store = NotebookStore::from_replica(notebook(false));
    let prepared = store
        .prepare_mutation(|draft| {
            if let Some(a) = draft.get_mut("cell_inputs").and_then(|i| i.get_mut("a")) {
                a.insert("code", Value::from("x = 3"));
            }
        })
        .expect("prepare");

    assert_eq!(prepared.patches.len(), 1);
    assert_eq!(store.view().cell_code("a"), Some("x = 1"));
    assert_eq!(store.gate().pending_local_updates(), 1);
    assert!(!store.is_idle());

    store.commit(&prepared.patches, &[]).expect("commit");
    assert_eq!(store.view().cell_code("a"), Some("x = 3"));
    assert!(store.is_idle());
}

#[test]
fn unchanged_draft_sends_nothing() {
    let mut store = NotebookStore::from_replica(notebook(false));
    let prepared = store.prepare_mutation(|_| {}).expect("prepare");
    assert!(prepared.patches.is_empty());
    assert_eq!(store.gate().pending_local_updates(), 0);
}

#[test]
fn bond_edits_are_queued_while_a_cell_runs() {
    let mut store = NotebookStore::from_replica(notebook(true));
    let prepared = store.prepare_mutation(|draft| set_bond(draft, "x", 1)).expect("prepare");

    assert!(prepared.patches.is_empty());
    assert_eq!(prepared.inverse.len(), 1);
    assert_eq!(store.gate().queued_bond_count(), 1);
    assert_eq!(store.take_queued_bonds(), None);

    store
        .apply_remote(&[Patch::replace(key_path(&["cell_results", "a", "running"]), Value::Bool(false))])
        .expect("apply");
    let queued = store.take_queued_bonds().expect("queued bonds");
    assert_eq!(queued[0].path, key_path(&["bonds", "x"]));
}

#[test]
fn explicit_index_patches_are_rejected() {
    let mut store = NotebookStore::from_replica(notebook(false));
    let err = store
        .prepare_patches(vec![Patch::replace(
            vec![PathSegment::from("cell_order"), PathSegment::from(0)],
            Value::from("a"),
        )])
        .expect_err("should fail");
    assert!(matches!(err, ClientError::ArrayEdit { ref path } if path == "cell_order.0"));
}

#[test]
fn explicit_patches_must_apply() {
    let mut store = NotebookStore::from_replica(notebook(false));
    let err = store
        .prepare_patches(vec![Patch::remove(key_path(&["cell_inputs", "zzz"]))])
        .expect_err("should fail");
    assert!(matches!(err, ClientError::Patch(PatchError::MissingPath { .. })));
    assert_eq!(store.gate().pending_local_updates(), 0);
}

#[test]
fn abandon_finishes_the_pending_update() {
    let mut store = NotebookStore::from_replica(notebook(false));
    let prepared = store.prepare_mutation(|draft| set_bond(draft, "x", 1)).expect("prepare");
    assert_eq!(prepared.patches.len(), 1);
    store.abandon(prepared.starts_bond_wait);
    assert!(store.is_idle());
    assert_eq!(store.view().bond_value("x"), None);
}

fn reactive_notebook() -> Value {
    let mut root = notebook(false);
    root.insert(
        "cell_dependencies",
        Value::from(json!({"a": {"upstream_cells_map": {"x": []}}})),
    );
    root
}

#[test]
fn abandoning_a_triggering_bond_ends_the_wait() {
    let mut store = NotebookStore::from_replica(reactive_notebook());
    let prepared = store.prepare_mutation(|draft| set_bond(draft, "x", 1)).expect("prepare");
    assert!(prepared.starts_bond_wait);
    assert!(store.gate().waiting_for_bond());

    store.abandon(prepared.starts_bond_wait);
    assert!(!store.gate().waiting_for_bond());
    assert!(store.is_idle());

    let next = store.prepare_mutation(|draft| set_bond(draft, "x", 2)).expect("prepare");
    assert_eq!(next.patches.len(), 1, "the next bond change is sent, not queued");
    assert_eq!(store.gate().queued_bond_count(), 0);
}

#[test]
fn reset_ends_the_bond_wait() {
    let mut store = NotebookStore::from_replica(reactive_notebook());
    let prepared = store.prepare_mutation(|draft| set_bond(draft, "x", 1)).expect("prepare");
    store.commit(&prepared.patches, &[]).expect("commit");
    assert!(store.gate().waiting_for_bond());

    store
        .apply_reset(&[Patch::replace(Vec::new(), reactive_notebook())])
        .expect("reset");
    assert!(!store.gate().waiting_for_bond());
    assert!(store.is_idle());

    let next = store.prepare_mutation(|draft| set_bond(draft, "x", 3)).expect("prepare");
    assert_eq!(next.patches.len(), 1);
}

#[test]
fn commit_applies_engine_patches_after_local_ones() {
    let mut store = NotebookStore::from_replica(notebook(false));
    let prepared = store.prepare_mutation(|draft| set_bond(draft, "x", 1)).expect("prepare");
    store
        .commit(
            &prepared.patches,
            &[Patch::replace(key_path(&["bonds", "x", "value"]), Value::from(2_i64))],
        )
        .expect("commit");
    assert_eq!(store.view().bond_value("x"), Some(&Value::Int(2)));
}

// =============================================================================
// RECOVERY
// =============================================================================

#[test]
fn recovery_prefers_resync_when_connected() {
    assert_eq!(Recovery::choose(true, true), Recovery::ResetSharedState);
    assert_eq!(Recovery::choose(false, true), Recovery::StaticPreviewNotice);
    assert_eq!(Recovery::choose(false, false), Recovery::Reload);
}
