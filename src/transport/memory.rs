//! In-memory connector for tests and embedding.
//!
//! Every successful `open` hands a [`MemoryPeer`] to whoever holds the
//! receiver returned by [`MemoryConnector::new`]. The peer plays the engine:
//! it reads the frames the client sends and can push frames, errors, and
//! closes back. Individual attempts can be scripted to fail or hang.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use frames::{Frame, Value};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use super::socket::{Connector, OpenedSocket, RawSocket, ReadyState, SharedReadyState, SocketEvent};
use crate::error::TransportError;

/// Behaviour of the next `open` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenPlan {
    Accept,
    Fail(String),
    /// Never complete; the connect timeout decides.
    Hang,
}

pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    plans: Mutex<VecDeque<OpenPlan>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            plans: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        });
        (connector, accepted)
    }

    /// Script the next unscripted attempt. Attempts beyond the script accept.
    pub fn plan(&self, plan: OpenPlan) {
        self.plans.lock().unwrap_or_else(PoisonError::into_inner).push_back(plan);
    }

    /// Number of `open` calls so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, address: &Url) -> Result<OpenedSocket, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let plan = self
            .plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(OpenPlan::Accept);
        debug!(attempt, ?plan, %address, "memory: open");

        match plan {
            OpenPlan::Accept => {}
            OpenPlan::Fail(reason) => return Err(TransportError::Connect(reason)),
            OpenPlan::Hang => std::future::pending::<()>().await,
        }

        let state = SharedReadyState::new(ReadyState::Open);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            address: address.clone(),
            inbox: PeerInbox { inbox: outbound_rx },
            handle: PeerHandle {
                events: event_tx,
                state: state.clone(),
            },
        };
        self.peers.send(peer).map_err(|_| TransportError::Connect("no listener".to_owned()))?;

        Ok(OpenedSocket {
            socket: Arc::new(MemorySocket {
                outbound: outbound_tx,
                state,
            }),
            events: event_rx,
        })
    }
}

struct MemorySocket {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    state: SharedReadyState,
}

#[async_trait]
impl RawSocket for MemorySocket {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.state.get() != ReadyState::Open {
            return Err(TransportError::Closed);
        }
        self.outbound.send(bytes).map_err(|_| TransportError::Closed)
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    async fn close(&self) {
        self.state.set(ReadyState::Closed);
    }
}

/// Engine side of an in-memory socket.
pub struct MemoryPeer {
    pub address: Url,
    inbox: PeerInbox,
    handle: PeerHandle,
}

impl MemoryPeer {
    /// Next frame sent by the client. Undecodable messages are skipped.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.inbox.recv_frame().await
    }

    #[must_use]
    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Split into the sending handle and the inbound half.
    #[must_use]
    pub fn split(self) -> (PeerHandle, PeerInbox) {
        (self.handle, self.inbox)
    }
}

impl std::ops::Deref for MemoryPeer {
    type Target = PeerHandle;

    fn deref(&self) -> &PeerHandle {
        &self.handle
    }
}

/// Inbound half of a split [`MemoryPeer`].
pub struct PeerInbox {
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl PeerInbox {
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            let bytes = self.inbox.recv().await?;
            match frames::decode_frame(&bytes) {
                Ok(frame) => return Some(frame),
                Err(e) => debug!(error = %e, "memory: skipping undecodable client message"),
            }
        }
    }
}

/// Cloneable sending side of a [`MemoryPeer`].
#[derive(Clone)]
pub struct PeerHandle {
    events: mpsc::UnboundedSender<SocketEvent>,
    state: SharedReadyState,
}

impl PeerHandle {
    /// Push a frame to the client. Returns `false` once the client is gone.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frames::encode_frame(frame) {
            Ok(bytes) => self.send_raw(bytes),
            Err(e) => {
                debug!(error = %e, "memory: frame did not encode");
                false
            }
        }
    }

    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.events.send(SocketEvent::Binary(bytes)).is_ok()
    }

    /// Answer `request` with `body`, addressed to the client that sent it.
    pub fn reply(&self, request: &Frame, body: Value) -> bool {
        self.send_frame(&Frame {
            kind: request.kind.clone(),
            client_id: None,
            request_id: request.request_id.clone(),
            initiator_id: request.client_id.clone(),
            body,
            metadata: request.metadata.clone(),
        })
    }

    /// Report a socket error without changing the ready state.
    pub fn inject_error(&self, reason: &str) {
        let _ = self.events.send(SocketEvent::Error(reason.to_owned()));
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        self.state.set(state);
    }

    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    /// Close the connection from the engine side.
    pub fn hang_up(&self) {
        self.state.set(ReadyState::Closed);
        let _ = self.events.send(SocketEvent::Closed);
    }
}
