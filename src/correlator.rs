//! Request/response correlation.
//!
//! DESIGN
//! ======
//! Every outbound request carries this client's id and a fresh request id.
//! An inbound frame resolves a pending request when its `initiator_id` is
//! this client and its `request_id` is pending. Anything else is an
//! unrequested update, tagged with whether this client initiated it.
//!
//! A request sent with `no_broadcast = false` is answered like any other,
//! but the response first goes down the update path so that state carried
//! in it is applied before the caller sees the response.
//!
//! Pending requests whose connection dies are not failed here. The
//! reconnect path resyncs from the engine's full state instead.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use frames::{Frame, Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::ids::IdGenerator;
use crate::message::MessageKind;
use crate::transport::SocketTransport;

/// What to do with an inbound frame.
#[derive(Debug)]
pub enum Routed {
    /// It answered a pending request; nothing else to do.
    Resolved,
    /// It answers a pending request that also wants the update path. The
    /// caller handles the update, then resolves the request.
    Broadcast { frame: Frame, reply: PendingReply },
    Unrequested { frame: Frame, by_me: bool },
}

/// Completion handle for a response routed through the update path.
#[derive(Debug)]
pub struct PendingReply(oneshot::Sender<Frame>);

impl PendingReply {
    pub fn resolve(self, frame: Frame) {
        let _ = self.0.send(frame);
    }
}

struct PendingRequest {
    reply: oneshot::Sender<Frame>,
    broadcast: bool,
}

pub struct Correlator {
    client_id: String,
    ids: Mutex<IdGenerator>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    transport: Mutex<Option<Arc<SocketTransport>>>,
    recent: Mutex<VecDeque<Frame>>,
    recent_capacity: usize,
}

impl Correlator {
    #[must_use]
    pub fn new(recent_capacity: usize) -> Self {
        Self::with_ids(IdGenerator::new(), recent_capacity)
    }

    #[must_use]
    pub fn with_ids(mut ids: IdGenerator, recent_capacity: usize) -> Self {
        let client_id = ids.next_id();
        Self {
            client_id,
            ids: Mutex::new(ids),
            pending: Mutex::new(HashMap::new()),
            transport: Mutex::new(None),
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity)),
            recent_capacity,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Route future sends through `transport`. Returns the one it replaces.
    pub fn attach(&self, transport: Arc<SocketTransport>) -> Option<Arc<SocketTransport>> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(transport)
    }

    pub fn detach(&self) -> Option<Arc<SocketTransport>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    #[must_use]
    pub fn transport(&self) -> Option<Arc<SocketTransport>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Requests still waiting for a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The most recent inbound frames, oldest first.
    #[must_use]
    pub fn recent_frames(&self) -> Vec<Frame> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] if no transport was ever
    /// attached, the transport's error if the write fails, and
    /// [`ClientError::ConnectionLost`] if the correlator is dropped first.
    pub async fn send(
        &self,
        kind: &MessageKind,
        body: Value,
        metadata: Map,
        no_broadcast: bool,
    ) -> Result<Frame, ClientError> {
        let transport = self.transport().ok_or(ClientError::NotConnected)?;
        let (request_id, response) = self.register(!no_broadcast);
        let frame = Frame {
            kind: kind.as_tag().to_owned(),
            client_id: Some(self.client_id.clone()),
            request_id: Some(request_id.clone()),
            initiator_id: None,
            body,
            metadata,
        };

        if let Err(e) = transport.send(&frame).await {
            warn!(error = %e, %kind, %request_id, "correlator: send failed");
            self.forget(&request_id);
            return Err(e);
        }
        response.await.map_err(|_| ClientError::ConnectionLost)
    }

    fn register(&self, broadcast: bool) -> (String, oneshot::Receiver<Frame>) {
        let (reply, response) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        let mut request_id = ids.next_id();
        while pending.contains_key(&request_id) {
            request_id = ids.next_id();
        }
        pending.insert(request_id.clone(), PendingRequest { reply, broadcast });
        (request_id, response)
    }

    fn forget(&self, request_id: &str) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(request_id);
    }

    /// Resolve or classify an inbound frame.
    pub fn route(&self, frame: Frame) -> Routed {
        self.remember(&frame);

        let by_me = frame.initiator_id.as_deref() == Some(self.client_id.as_str());
        let pending = match (by_me, frame.request_id.as_deref()) {
            (true, Some(request_id)) => self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(request_id),
            _ => None,
        };

        let Some(PendingRequest { reply, broadcast }) = pending else {
            return Routed::Unrequested { frame, by_me };
        };
        debug!(kind = %frame.kind, request_id = ?frame.request_id, "correlator: response");
        if broadcast {
            Routed::Broadcast {
                frame,
                reply: PendingReply(reply),
            }
        } else {
            let _ = reply.send(frame);
            Routed::Resolved
        }
    }

    fn remember(&self, frame: &Frame) {
        if self.recent_capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == self.recent_capacity {
            recent.pop_front();
        }
        recent.push_back(frame.clone());
    }
}

#[cfg(test)]
#[path = "correlator_test.rs"]
mod tests;
