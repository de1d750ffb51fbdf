//! Raw socket seam.
//!
//! A [`Connector`] opens a message socket and hands back the socket handle
//! together with a channel of [`SocketEvent`]s. The transport above only
//! deals in these two traits, so tests swap the websocket for an in-memory
//! pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::TransportError;

/// Socket lifecycle as reported by the underlying implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    /// Still usable or about to be.
    #[must_use]
    pub fn is_alright(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Ready state shared between a socket handle and its I/O tasks.
#[derive(Clone, Debug)]
pub struct SharedReadyState(Arc<AtomicU8>);

impl SharedReadyState {
    #[must_use]
    pub fn new(state: ReadyState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    #[must_use]
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug)]
pub enum SocketEvent {
    Binary(Vec<u8>),
    /// The socket reported an error; it may or may not still be usable.
    Error(String),
    Closed,
}

#[async_trait]
pub trait RawSocket: Send + Sync {
    /// Queue one binary message.
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    fn ready_state(&self) -> ReadyState;

    /// Close the socket. Never fails; errors while closing are swallowed.
    async fn close(&self);
}

pub struct OpenedSocket {
    pub socket: Arc<dyn RawSocket>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, address: &Url) -> Result<OpenedSocket, TransportError>;
}
