use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use frames::{Frame, Map, Value};
use tokio::sync::mpsc;
use url::Url;

use super::*;
use crate::config::ClientConfig;
use crate::transport::{MemoryConnector, MemoryPeer, ReadyState, TransportEvents};

// =============================================================================
// HELPERS
// =============================================================================

/// Routes inbound frames the way the session does and records updates.
struct Router {
    correlator: Arc<Correlator>,
    updates: mpsc::UnboundedSender<(Frame, bool)>,
}

impl TransportEvents for Router {
    fn on_frame(&self, frame: Frame) -> Result<(), ClientError> {
        match self.correlator.route(frame) {
            Routed::Resolved => {}
            Routed::Broadcast { frame, reply } => {
                let _ = self.updates.send((frame.clone(), true));
                reply.resolve(frame);
            }
            Routed::Unrequested { frame, by_me } => {
                let _ = self.updates.send((frame, by_me));
            }
        }
        Ok(())
    }

    fn on_unexpected_close(&self) {}

    fn on_protocol_error(&self, _error: ClientError) {}
}

async fn connected(
    capacity: usize,
) -> (Arc<Correlator>, MemoryPeer, mpsc::UnboundedReceiver<(Frame, bool)>) {
    let correlator = Arc::new(Correlator::with_ids(IdGenerator::seeded(42), capacity));
    let (connector, mut peers) = MemoryConnector::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let router = Arc::new(Router {
        correlator: Arc::clone(&correlator),
        updates: tx,
    });
    let address = Url::parse("ws://engine.test/").expect("url");
    let transport = SocketTransport::open(&*connector, &address, &ClientConfig::default(), router)
        .await
        .expect("open");
    assert!(correlator.attach(Arc::new(transport)).is_none());
    let peer = peers.recv().await.expect("peer");
    (correlator, peer, rx)
}

fn pushed(kind: &str, initiator: Option<&str>, request_id: Option<&str>) -> Frame {
    Frame {
        kind: kind.to_owned(),
        initiator_id: initiator.map(ToOwned::to_owned),
        request_id: request_id.map(ToOwned::to_owned),
        body: Value::empty_map(),
        ..Frame::default()
    }
}

// =============================================================================
// SEND
// =============================================================================

#[tokio::test]
async fn send_without_transport_is_not_connected() {
    let correlator = Correlator::new(10);
    let err = correlator
        .send(&MessageKind::Ping, Value::empty_map(), Map::new(), true)
        .await
        .expect_err("should fail");
    assert!(matches!(err, ClientError::NotConnected));
    assert_eq!(correlator.in_flight(), 0);
}

#[tokio::test]
async fn concurrent_requests_resolve_with_their_own_responses() {
    let (correlator, mut peer, _updates) = connected(10).await;

    let mut handles = Vec::new();
    for n in 0..5_i64 {
        let correlator = Arc::clone(&correlator);
        handles.push(tokio::spawn(async move {
            let mut body = Value::empty_map();
            body.insert("n", Value::Int(n));
            let response = correlator
                .send(&MessageKind::Ping, body, Map::new(), true)
                .await
                .expect("response");
            (n, response)
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..5 {
        requests.push(peer.recv_frame().await.expect("request"));
    }
    let ids: HashSet<_> = requests.iter().filter_map(|r| r.request_id.clone()).collect();
    assert_eq!(ids.len(), 5, "request ids must be distinct");
    assert!(
        requests
            .iter()
            .all(|r| r.client_id.as_deref() == Some(correlator.client_id()))
    );

    for request in requests.iter().rev() {
        let echoed = request.body.get("n").cloned().unwrap_or_default();
        let mut body = Value::empty_map();
        body.insert("n", echoed);
        assert!(peer.reply(request, body));
    }

    for handle in handles {
        let (n, response) = handle.await.expect("join");
        assert_eq!(response.body.get("n"), Some(&Value::Int(n)));
    }
    assert_eq!(correlator.in_flight(), 0);
}

#[tokio::test]
async fn failed_write_forgets_the_request() {
    let (correlator, peer, _updates) = connected(10).await;
    peer.set_ready_state(ReadyState::Closed);

    let err = correlator
        .send(&MessageKind::Ping, Value::empty_map(), Map::new(), true)
        .await
        .expect_err("should fail");
    assert!(matches!(err, ClientError::Transport(_)));
    assert_eq!(correlator.in_flight(), 0);
}

// =============================================================================
// ROUTING
// =============================================================================

#[tokio::test]
async fn unrequested_frames_carry_initiator_flag() {
    let (correlator, peer, mut updates) = connected(10).await;
    let me = correlator.client_id().to_owned();

    peer.send_frame(&pushed("notebook_diff", Some("someone-else"), None));
    peer.send_frame(&pushed("notebook_diff", Some(&me), Some("not-pending")));

    let (_, by_me) = updates.recv().await.expect("update");
    assert!(!by_me);
    let (frame, by_me) = updates.recv().await.expect("update");
    assert!(by_me);
    assert_eq!(frame.request_id.as_deref(), Some("not-pending"));
}

#[tokio::test]
async fn response_for_another_client_does_not_resolve() {
    let correlator = Correlator::with_ids(IdGenerator::seeded(1), 0);
    let routed = correlator.route(pushed("ping", Some("other"), Some("abc")));
    assert!(matches!(routed, Routed::Unrequested { by_me: false, .. }));
}

#[tokio::test]
async fn broadcast_response_goes_through_the_update_path_first() {
    let (correlator, mut peer, mut updates) = connected(10).await;

    let sender = Arc::clone(&correlator);
    let request = tokio::spawn(async move {
        sender
            .send(&MessageKind::ResetSharedState, Value::empty_map(), Map::new(), false)
            .await
    });

    let incoming = peer.recv_frame().await.expect("request");
    assert!(peer.reply(&incoming, Value::empty_map()));

    let (update, by_me) = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("timely")
        .expect("update");
    assert!(by_me);
    assert_eq!(update.request_id, incoming.request_id);
    let response = request.await.expect("join").expect("response");
    assert_eq!(response.request_id, incoming.request_id);
}

#[tokio::test]
async fn recent_frames_keep_the_newest() {
    let correlator = Correlator::with_ids(IdGenerator::seeded(3), 2);
    for kind in ["a", "b", "c"] {
        let _ = correlator.route(pushed(kind, None, None));
    }
    let kinds: Vec<_> = correlator.recent_frames().into_iter().map(|f| f.kind).collect();
    assert_eq!(kinds, ["b", "c"]);
}
