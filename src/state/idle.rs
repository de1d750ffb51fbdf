//! Idle tracking and the bond change queue.
//!
//! DESIGN
//! ======
//! The notebook is idle when nothing is in flight: no unacknowledged local
//! updates, no running or queued cell, no running client script, a ready
//! engine process, and no bond change still waiting for the engine to start
//! the cells it triggers. Bond patches produced while the notebook is busy
//! are held back and flushed together the next time it goes idle, so a
//! slider dragged during a long computation only sends its final position.

use std::collections::HashSet;

use frames::Value;

use super::patch::Patch;
use super::replica::{BONDS, CELL_RESULTS, NotebookView};

/// Whether a bond's unchanged first value is sent to the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BondDedupPolicy {
    /// Always send.
    Never,
    /// Skip the initial value a widget reports if the replica already holds it.
    #[default]
    SkipUnchangedFirstValue,
}

impl BondDedupPolicy {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "never" | "off" => Some(Self::Never),
            "first_value" | "skip_unchanged_first_value" => Some(Self::SkipUnchangedFirstValue),
            _ => None,
        }
    }

    #[must_use]
    pub fn should_skip(self, current: Option<&Value>, incoming: &Value, is_first_value: bool) -> bool {
        match self {
            Self::Never => false,
            Self::SkipUnchangedFirstValue => is_first_value && current == Some(incoming),
        }
    }
}

#[derive(Debug, Default)]
pub struct IdleGate {
    pending_local_updates: usize,
    running_scripts: HashSet<String>,
    waiting_for_bond: bool,
    queued_bonds: Vec<Patch>,
}

impl IdleGate {
    #[must_use]
    pub fn is_idle(&self, replica: &Value) -> bool {
        let view = NotebookView::new(replica);
        self.pending_local_updates == 0
            && !self.waiting_for_bond
            && self.running_scripts.is_empty()
            && !view.any_cell_busy()
            && view.process_ready()
    }

    #[must_use]
    pub fn pending_local_updates(&self) -> usize {
        self.pending_local_updates
    }

    pub fn begin_local_update(&mut self) {
        self.pending_local_updates += 1;
    }

    pub fn finish_local_update(&mut self) {
        self.pending_local_updates = self.pending_local_updates.saturating_sub(1);
    }

    /// Returns `false` if the handle was already registered.
    pub fn register_script(&mut self, handle: &str) -> bool {
        self.running_scripts.insert(handle.to_owned())
    }

    /// Returns `true` when this was the last running script.
    pub fn finish_script(&mut self, handle: &str) -> bool {
        self.running_scripts.remove(handle) && self.running_scripts.is_empty()
    }

    #[must_use]
    pub fn waiting_for_bond(&self) -> bool {
        self.waiting_for_bond
    }

    #[must_use]
    pub fn queued_bond_count(&self) -> usize {
        self.queued_bonds.len()
    }

    /// Hold back bond patches unless the notebook is idle. Returns the
    /// patches to send now.
    pub fn divert_bonds(&mut self, patches: Vec<Patch>, idle: bool) -> Vec<Patch> {
        if idle {
            return patches;
        }
        let (bonds, rest): (Vec<_>, Vec<_>) = patches.into_iter().partition(touches_bonds);
        self.queued_bonds.extend(bonds);
        rest
    }

    /// Record an outbound batch; a bond that some cell reads makes the
    /// notebook wait for the engine's reaction. Returns whether this batch
    /// started the wait.
    pub fn note_sent(&mut self, sent: &[Patch], replica: &Value) -> bool {
        let view = NotebookView::new(replica);
        let triggers = sent
            .iter()
            .filter(|p| touches_bonds(p))
            .filter_map(|p| p.path.get(1).and_then(|s| s.as_key()))
            .any(|name| view.bond_triggers_evaluation(name));
        let started = triggers && !self.waiting_for_bond;
        self.waiting_for_bond |= triggers;
        started
    }

    /// Record an inbound batch. Any change to cell results, or a whole-root
    /// replace, means the engine has reacted and the bond wait is over.
    pub fn note_remote_batch(&mut self, patches: &[Patch]) {
        if self.waiting_for_bond
            && patches
                .iter()
                .any(|p| p.path.is_empty() || p.root_key() == Some(CELL_RESULTS))
        {
            self.waiting_for_bond = false;
        }
    }

    /// Stop waiting for a bond-triggered evaluation that will not happen.
    pub fn clear_bond_wait(&mut self) {
        self.waiting_for_bond = false;
    }

    /// Take every queued bond patch, if idle and any are queued.
    pub fn take_queued(&mut self, idle: bool) -> Option<Vec<Patch>> {
        if !idle || self.queued_bonds.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.queued_bonds))
    }
}

fn touches_bonds(patch: &Patch) -> bool {
    patch.root_key() == Some(BONDS)
}

#[cfg(test)]
#[path = "idle_test.rs"]
mod tests;
