//! Error taxonomy for the sync core.
//!
//! ERROR HANDLING
//! ==============
//! Transport and protocol failures are absorbed by the layer that sees them
//! (reconnect loop, frame pump). What reaches callers as `Err` is either a
//! caller bug (`NotConnected`, `BatchConflict`, `ArrayEdit`) or a signal the
//! caller must reflect (`Rejected`, `Patch`). Every variant is `Clone` so a
//! single batched response can be fanned out to all of its waiters.

use std::time::Duration;

use frames::CodecError;

use crate::state::patch::PatchError;

/// Failure of the underlying message socket.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The socket handshake did not finish before the connect timeout.
    #[error("socket connect timed out after {0:?}")]
    Timeout(Duration),
    /// The socket could not be opened.
    #[error("socket connect failed: {0}")]
    Connect(String),
    /// Writing to an open socket failed.
    #[error("socket send failed: {0}")]
    Send(String),
    /// The socket is no longer usable.
    #[error("socket closed")]
    Closed,
}

/// Error surfaced by the public client API.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    /// A request was issued before any connection was established.
    #[error("not connected to the notebook engine")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Two patch submissions in the same tick targeted different notebooks.
    #[error("cannot batch updates for notebook {incoming:?} with pending updates for {pending:?}")]
    BatchConflict {
        pending: Option<String>,
        incoming: Option<String>,
    },
    /// The engine refused an `update_notebook` request.
    #[error("notebook update rejected: {why_not}")]
    Rejected { why_not: String },
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// A mutation produced an index-addressed patch; arrays must be replaced whole.
    #[error("mutation edits array element at {path}; replace the whole array instead")]
    ArrayEdit { path: String },
    /// The response channel went away before a response arrived.
    #[error("connection lost before a response arrived")]
    ConnectionLost,
    /// The `connect` handshake response was malformed.
    #[error("invalid handshake response: {0}")]
    Handshake(String),
}

/// Error building the socket address.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported url scheme `{0}`; expected http or https")]
    UnsupportedScheme(String),
}
