//! Read-only accessors over the notebook replica.
//!
//! The replica is a plain [`Value`] tree mirrored from the engine. Only the
//! top-level keys below are interpreted by the client; everything else is
//! carried opaquely.

use frames::{Map, Value};
use tracing::warn;

pub const NOTEBOOK_ID: &str = "notebook_id";
pub const PATH: &str = "path";
pub const SHORTPATH: &str = "shortpath";
pub const IN_TEMP_DIR: &str = "in_temp_dir";
pub const PROCESS_STATUS: &str = "process_status";
pub const CELL_INPUTS: &str = "cell_inputs";
pub const CELL_RESULTS: &str = "cell_results";
pub const CELL_DEPENDENCIES: &str = "cell_dependencies";
pub const CELL_ORDER: &str = "cell_order";
pub const CELL_EXECUTION_ORDER: &str = "cell_execution_order";
pub const BONDS: &str = "bonds";
pub const STATUS_TREE: &str = "status_tree";
pub const PUBLISHED_OBJECTS: &str = "published_objects";
pub const NBPKG: &str = "nbpkg";
pub const METADATA: &str = "metadata";

const PROCESS_READY: &str = "ready";
const PROCESS_STARTING: &str = "starting";

/// Skeleton replica used before the first full state arrives.
#[must_use]
pub fn empty_notebook(notebook_id: &str) -> Value {
    let mut root = Map::new();
    root.insert(NOTEBOOK_ID.to_owned(), Value::from(notebook_id));
    root.insert(PATH.to_owned(), Value::from(""));
    root.insert(SHORTPATH.to_owned(), Value::from(""));
    root.insert(IN_TEMP_DIR.to_owned(), Value::Bool(false));
    root.insert(PROCESS_STATUS.to_owned(), Value::from(PROCESS_STARTING));
    for key in [
        CELL_INPUTS,
        CELL_RESULTS,
        CELL_DEPENDENCIES,
        BONDS,
        PUBLISHED_OBJECTS,
        METADATA,
    ] {
        root.insert(key.to_owned(), Value::empty_map());
    }
    root.insert(CELL_ORDER.to_owned(), Value::Array(Vec::new()));
    root.insert(CELL_EXECUTION_ORDER.to_owned(), Value::Array(Vec::new()));
    root.insert(STATUS_TREE.to_owned(), Value::Nil);
    root.insert(NBPKG.to_owned(), Value::Nil);
    Value::Map(root)
}

/// Borrowed view answering the questions the client asks of the replica.
#[derive(Clone, Copy, Debug)]
pub struct NotebookView<'a> {
    root: &'a Value,
}

impl<'a> NotebookView<'a> {
    #[must_use]
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn notebook_id(&self) -> Option<&'a str> {
        self.root.get(NOTEBOOK_ID).and_then(Value::as_str)
    }

    /// Cell ids in display order.
    #[must_use]
    pub fn cell_order(&self) -> Vec<&'a str> {
        self.root
            .get(CELL_ORDER)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_cell_input(&self, cell_id: &str) -> bool {
        self.root.pointer(&[CELL_INPUTS, cell_id]).is_some()
    }

    #[must_use]
    pub fn cell_code(&self, cell_id: &str) -> Option<&'a str> {
        self.root.pointer(&[CELL_INPUTS, cell_id, "code"]).and_then(Value::as_str)
    }

    /// Whether a cell is running or queued to run.
    #[must_use]
    pub fn cell_is_busy(&self, cell_id: &str) -> bool {
        self.root
            .pointer(&[CELL_RESULTS, cell_id])
            .is_some_and(result_is_busy)
    }

    #[must_use]
    pub fn any_cell_busy(&self) -> bool {
        self.root
            .get(CELL_RESULTS)
            .and_then(Value::as_map)
            .is_some_and(|results| results.values().any(result_is_busy))
    }

    #[must_use]
    pub fn process_status(&self) -> Option<&'a str> {
        self.root.get(PROCESS_STATUS).and_then(Value::as_str)
    }

    /// The engine's worker process accepts work.
    #[must_use]
    pub fn process_ready(&self) -> bool {
        matches!(self.process_status(), Some(PROCESS_READY | PROCESS_STARTING))
    }

    /// Current value of a bond, unwrapped from its `{value}` envelope.
    #[must_use]
    pub fn bond_value(&self, name: &str) -> Option<&'a Value> {
        self.root.pointer(&[BONDS, name, "value"])
    }

    /// Whether some cell reads the bond, so setting it makes the engine run cells.
    #[must_use]
    pub fn bond_triggers_evaluation(&self, name: &str) -> bool {
        self.root
            .get(CELL_DEPENDENCIES)
            .and_then(Value::as_map)
            .is_some_and(|deps| {
                deps.values().any(|dep| {
                    dep.get("upstream_cells_map")
                        .and_then(Value::as_map)
                        .is_some_and(|upstream| upstream.contains_key(name))
                })
            })
    }

    /// Ids listed in `cell_order` that have no entry in `cell_inputs`.
    #[must_use]
    pub fn orphaned_order_entries(&self) -> Vec<&'a str> {
        self.cell_order()
            .into_iter()
            .filter(|id| !self.has_cell_input(id))
            .collect()
    }
}

fn result_is_busy(result: &Value) -> bool {
    let flag = |key| result.get(key).and_then(Value::as_bool).unwrap_or(false);
    flag("running") || flag("queued")
}

/// Drop `cell_order` entries without a matching input. Returns what was removed.
pub(crate) fn prune_orphaned_cells(root: &mut Value) -> Vec<String> {
    let orphans: Vec<String> = NotebookView::new(root)
        .orphaned_order_entries()
        .into_iter()
        .map(ToOwned::to_owned)
        .collect();
    if orphans.is_empty() {
        return orphans;
    }

    if let Some(order) = root.get_mut(CELL_ORDER).and_then(Value::as_array_mut) {
        order.retain(|id| id.as_str().is_none_or(|id| !orphans.iter().any(|o| o == id)));
    }
    warn!(?orphans, "cell order referenced cells without inputs; pruned");
    orphans
}
