//! The notebook replica and everything that changes it.
//!
//! DESIGN
//! ======
//! `NotebookStore` owns the replica and the [`IdleGate`]. It is a plain
//! synchronous struct; the client wraps it in a mutex and never holds that
//! lock across an await.
//!
//! Local edits are prepared here (diffed, validated, bond patches diverted)
//! but only committed to the replica once the engine acknowledges them.
//! Remote batches are applied atomically; afterwards any `cell_order`
//! entry without a matching input is pruned.
//!
//! ERROR HANDLING
//! ==============
//! A failed batch leaves the replica as it was. Failures under
//! `status_tree` are reported as ignorable; anything else needs a
//! [`Recovery`].

use frames::Value;

use super::idle::IdleGate;
use super::patch::{Diff, Patch, PatchError, apply_patches, apply_patches_with_inverse, diff, display_path};
use super::replica::{NotebookView, STATUS_TREE, empty_notebook, prune_orphaned_cells};
use crate::error::ClientError;

/// A batch that could not be applied.
#[derive(Clone, Debug, PartialEq)]
pub struct ApplyFailure {
    pub error: PatchError,
    /// The failure only touched the status tree and can be dropped.
    pub ignorable: bool,
}

impl ApplyFailure {
    fn new(error: PatchError) -> Self {
        let ignorable = error.path().first().and_then(|s| s.as_key()) == Some(STATUS_TREE);
        Self { error, ignorable }
    }
}

/// How to get back in sync after a non-ignorable patch failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Ask the engine for the full state.
    ResetSharedState,
    /// Read-only preview: tell the user the view may be stale.
    StaticPreviewNotice,
    /// Nothing to resync against; the user must reload.
    Reload,
}

impl Recovery {
    #[must_use]
    pub fn choose(connected: bool, static_preview: bool) -> Self {
        if connected {
            Self::ResetSharedState
        } else if static_preview {
            Self::StaticPreviewNotice
        } else {
            Self::Reload
        }
    }
}

/// Local edit ready to be sent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreparedMutation {
    /// Patches to send now; empty when everything was diverted or nothing changed.
    pub patches: Vec<Patch>,
    /// Undo for the whole edit, including diverted bond patches.
    pub inverse: Vec<Patch>,
    /// Sending these patches started a wait for bond-triggered evaluation.
    pub starts_bond_wait: bool,
}

pub struct NotebookStore {
    replica: Value,
    gate: IdleGate,
}

impl NotebookStore {
    #[must_use]
    pub fn new(notebook_id: &str) -> Self {
        Self::from_replica(empty_notebook(notebook_id))
    }

    #[must_use]
    pub fn from_replica(replica: Value) -> Self {
        Self {
            replica,
            gate: IdleGate::default(),
        }
    }

    #[must_use]
    pub fn replica(&self) -> &Value {
        &self.replica
    }

    #[must_use]
    pub fn view(&self) -> NotebookView<'_> {
        NotebookView::new(&self.replica)
    }

    #[must_use]
    pub fn gate(&self) -> &IdleGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut IdleGate {
        &mut self.gate
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.gate.is_idle(&self.replica)
    }

    /// Apply a batch atomically, onto `base_override` instead of the
    /// current replica if given. Returns the inverse batch when asked for.
    ///
    /// # Errors
    ///
    /// Returns an [`ApplyFailure`] and leaves the replica unchanged if any
    /// patch fails.
    pub fn apply(
        &mut self,
        patches: &[Patch],
        base_override: Option<&Value>,
        want_inverse: bool,
    ) -> Result<Vec<Patch>, ApplyFailure> {
        let base = base_override.unwrap_or(&self.replica);
        let applied = if want_inverse {
            apply_patches_with_inverse(base, patches)
        } else {
            apply_patches(base, patches).map(|next| (next, Vec::new()))
        };
        let (mut next, inverse) = applied.map_err(ApplyFailure::new)?;
        prune_orphaned_cells(&mut next);
        self.replica = next;
        Ok(inverse)
    }

    /// Apply a batch pushed by the engine.
    ///
    /// # Errors
    ///
    /// As [`NotebookStore::apply`].
    pub fn apply_remote(&mut self, patches: &[Patch]) -> Result<(), ApplyFailure> {
        self.apply(patches, None, false)?;
        self.gate.note_remote_batch(patches);
        Ok(())
    }

    /// Rebuild the replica from a full-state batch, applied to an empty map.
    ///
    /// # Errors
    ///
    /// As [`NotebookStore::apply`].
    pub fn apply_reset(&mut self, patches: &[Patch]) -> Result<(), ApplyFailure> {
        self.apply(patches, Some(&Value::empty_map()), false)?;
        self.gate.clear_bond_wait();
        Ok(())
    }

    /// Diff the result of `edit` against the replica and prepare it for sending.
    ///
    /// The replica itself is not changed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ArrayEdit`] if the diff addresses an array element.
    pub fn prepare_mutation<F>(&mut self, edit: F) -> Result<PreparedMutation, ClientError>
    where
        F: FnOnce(&mut Value),
    {
        let mut draft = self.replica.clone();
        edit(&mut draft);
        let Diff { patches, inverse } = diff(&self.replica, &draft);
        self.prepare(patches, inverse)
    }

    /// Prepare an explicit patch batch for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ArrayEdit`] for index-addressed patches and
    /// [`ClientError::Patch`] if the batch does not apply to the replica.
    pub fn prepare_patches(&mut self, patches: Vec<Patch>) -> Result<PreparedMutation, ClientError> {
        reject_array_edits(&patches)?;
        let (_, inverse) = apply_patches_with_inverse(&self.replica, &patches)?;
        self.prepare(patches, inverse)
    }

    fn prepare(&mut self, patches: Vec<Patch>, inverse: Vec<Patch>) -> Result<PreparedMutation, ClientError> {
        let idle = self.gate.is_idle(&self.replica);
        let patches = self.gate.divert_bonds(patches, idle);
        let mut starts_bond_wait = false;
        if !patches.is_empty() {
            self.gate.begin_local_update();
            starts_bond_wait = self.gate.note_sent(&patches, &self.replica);
        }
        Ok(PreparedMutation {
            patches,
            inverse,
            starts_bond_wait,
        })
    }

    /// Merge acknowledged local patches and any patches the engine sent back.
    ///
    /// # Errors
    ///
    /// As [`NotebookStore::apply`]; the pending update is finished either way.
    pub fn commit(&mut self, sent: &[Patch], from_engine: &[Patch]) -> Result<(), ApplyFailure> {
        self.gate.finish_local_update();
        self.apply(sent, None, false)?;
        if !from_engine.is_empty() {
            self.apply_remote(from_engine)?;
        }
        Ok(())
    }

    /// Forget a local update that failed or was rejected, along with the
    /// bond wait it started.
    pub fn abandon(&mut self, started_bond_wait: bool) {
        self.gate.finish_local_update();
        if started_bond_wait {
            self.gate.clear_bond_wait();
        }
    }

    /// Take the queued bond patches if the notebook is idle.
    pub fn take_queued_bonds(&mut self) -> Option<Vec<Patch>> {
        let idle = self.gate.is_idle(&self.replica);
        self.gate.take_queued(idle)
    }
}

fn reject_array_edits(patches: &[Patch]) -> Result<(), ClientError> {
    match patches.iter().find(|p| p.has_index()) {
        Some(patch) => Err(ClientError::ArrayEdit {
            path: display_path(&patch.path),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
