//! Client core for a live notebook engine.
//!
//! A [`NotebookClient`] keeps a local replica of one notebook in sync with
//! the engine over a binary websocket. Layers, bottom up:
//!
//! - [`transport`]: socket lifecycle and ordered frame delivery
//! - [`correlator`]: request ids and response routing
//! - [`batcher`]: same-tick coalescing of `update_notebook` requests
//! - [`reconnect`] and [`session`]: connect, keepalive, reconnect, resync
//! - [`state`]: patches, the replica, and the idle-aware bond queue
//! - [`notebook`]: the client API tying them together

pub mod address;
pub mod batcher;
pub mod config;
pub mod correlator;
pub mod error;
pub mod ids;
pub mod message;
pub mod notebook;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod transport;

pub use frames::{CodecError, Frame, Map, TypedArray, Value};
pub use url::Url;

pub use address::socket_address;
pub use config::ClientConfig;
pub use error::{AddressError, ClientError, TransportError};
pub use message::MessageKind;
pub use notebook::{NotebookClient, NotebookObserver};
pub use reconnect::LinkState;
pub use session::{ConnectionInfo, Notice, Session, SessionObserver};
pub use state::{BondDedupPolicy, Patch, PatchError, PatchOp, PathSegment};
pub use transport::{Connector, MemoryConnector, WsConnector};
