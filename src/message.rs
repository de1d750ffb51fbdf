//! Message kinds understood by the sync core.
//!
//! The wire carries a free-form `type` string. Known tags map onto a closed
//! enum; anything else is kept as [`MessageKind::Unknown`] so newer engines
//! can add message types without breaking older clients.

use std::fmt;

use frames::{Map, Value};

/// Metadata key naming the target notebook.
pub const NOTEBOOK_ID: &str = "notebook_id";

/// Message type tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Session handshake; the response carries session options.
    Connect,
    /// Keepalive; any response counts as success.
    Ping,
    /// Client-proposed patches: `{updates: [patch...]}`.
    UpdateNotebook,
    /// Engine-pushed patches: `{patches: [patch...]}`.
    NotebookDiff,
    RunMultipleCells,
    /// Ask the engine to resend the full notebook state.
    ResetSharedState,
    InterruptAll,
    RestartProcess,
    ShutdownNotebook,
    Unknown(String),
}

impl MessageKind {
    /// Parse a wire tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "connect" => Self::Connect,
            "ping" => Self::Ping,
            "update_notebook" => Self::UpdateNotebook,
            "notebook_diff" => Self::NotebookDiff,
            "run_multiple_cells" => Self::RunMultipleCells,
            "reset_shared_state" => Self::ResetSharedState,
            "interrupt_all" => Self::InterruptAll,
            "restart_process" => Self::RestartProcess,
            "shutdown_notebook" => Self::ShutdownNotebook,
            other => Self::Unknown(other.to_owned()),
        }
    }

    /// Wire tag for this kind.
    #[must_use]
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Ping => "ping",
            Self::UpdateNotebook => "update_notebook",
            Self::NotebookDiff => "notebook_diff",
            Self::RunMultipleCells => "run_multiple_cells",
            Self::ResetSharedState => "reset_shared_state",
            Self::InterruptAll => "interrupt_all",
            Self::RestartProcess => "restart_process",
            Self::ShutdownNotebook => "shutdown_notebook",
            Self::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Metadata targeting one notebook.
#[must_use]
pub fn notebook_metadata(notebook_id: &str) -> Map {
    let mut metadata = Map::new();
    metadata.insert(NOTEBOOK_ID.to_owned(), Value::from(notebook_id));
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_round_trip() {
        for tag in [
            "connect",
            "ping",
            "update_notebook",
            "notebook_diff",
            "run_multiple_cells",
            "reset_shared_state",
            "interrupt_all",
            "restart_process",
            "shutdown_notebook",
        ] {
            let kind = MessageKind::from_tag(tag);
            assert!(!matches!(kind, MessageKind::Unknown(_)), "{tag} should be known");
            assert_eq!(kind.as_tag(), tag);
        }
    }

    #[test]
    fn unknown_tags_are_preserved() {
        let kind = MessageKind::from_tag("pkg_install_log");
        assert_eq!(kind, MessageKind::Unknown("pkg_install_log".to_owned()));
        assert_eq!(kind.to_string(), "pkg_install_log");
    }

    #[test]
    fn notebook_metadata_sets_id() {
        let metadata = notebook_metadata("nb-1");
        assert_eq!(metadata.get(NOTEBOOK_ID), Some(&Value::from("nb-1")));
    }
}
