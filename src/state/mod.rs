//! Notebook replica, structural patches, and idle tracking.

pub mod idle;
pub mod patch;
pub mod replica;
pub mod store;

pub use idle::{BondDedupPolicy, IdleGate};
pub use patch::{Diff, PathSegment, Patch, PatchError, PatchOp};
pub use replica::NotebookView;
pub use store::{ApplyFailure, NotebookStore, PreparedMutation, Recovery};
