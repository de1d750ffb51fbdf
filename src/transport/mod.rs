//! Framed message transport over a raw socket.
//!
//! DESIGN
//! ======
//! `SocketTransport` owns one socket for its whole life. Opening is bounded
//! by the connect timeout. Once open, a pump task turns socket events into
//! decoded frames and hands them to a [`TransportEvents`] handler strictly
//! in arrival order: small messages decode inline, large ones on the
//! blocking pool, and an ordered queue restores arrival order before
//! delivery.
//!
//! A socket error is not fatal by itself. The pump waits a grace period and
//! then asks the socket whether it is still alright; only a dead socket is
//! reported as closed. Close is reported at most once per transport, and
//! never after [`SocketTransport::kill`].
//!
//! ERROR HANDLING
//! ==============
//! A frame that fails to decode, or whose handler fails, is logged and
//! reported through `on_protocol_error`; the pump keeps going.

pub mod memory;
pub mod socket;
pub mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use frames::{CodecError, Frame};
use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{FuturesOrdered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

pub use memory::{MemoryConnector, MemoryPeer, OpenPlan, PeerHandle, PeerInbox};
pub use socket::{Connector, OpenedSocket, RawSocket, ReadyState, SharedReadyState, SocketEvent};
pub use websocket::WsConnector;

use crate::config::ClientConfig;
use crate::error::{ClientError, TransportError};

/// Messages at least this large are decoded off the async workers.
const INLINE_DECODE_LIMIT: usize = 64 * 1024;

/// Receiver of everything a transport observes.
pub trait TransportEvents: Send + Sync {
    /// A decoded inbound frame. An `Err` is reported as a protocol error.
    ///
    /// # Errors
    ///
    /// Implementations return an error when the frame cannot be handled.
    fn on_frame(&self, frame: Frame) -> Result<(), ClientError>;

    /// The socket died without [`SocketTransport::kill`] being called.
    fn on_unexpected_close(&self);

    /// A frame failed to decode or its handler failed.
    fn on_protocol_error(&self, error: ClientError);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportPhase {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

struct PumpShared {
    phase: AtomicU8,
    close_reported: AtomicBool,
    killed: AtomicBool,
}

impl PumpShared {
    fn phase(&self) -> TransportPhase {
        match self.phase.load(Ordering::Acquire) {
            0 => TransportPhase::Connecting,
            1 => TransportPhase::Open,
            _ => TransportPhase::Closed,
        }
    }

    fn set_phase(&self, phase: TransportPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

pub struct SocketTransport {
    socket: Arc<dyn RawSocket>,
    shared: Arc<PumpShared>,
    pump: JoinHandle<()>,
}

impl SocketTransport {
    /// Open a socket and start delivering its frames to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if the connector does not finish
    /// within `config.connect_timeout`, or the connector's own error.
    pub async fn open(
        connector: &dyn Connector,
        address: &Url,
        config: &ClientConfig,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Self, TransportError> {
        debug!(%address, phase = ?TransportPhase::Connecting, "transport: opening");
        let opened = match tokio::time::timeout(config.connect_timeout, connector.open(address)).await {
            Ok(opened) => opened?,
            Err(_) => {
                warn!(%address, timeout = ?config.connect_timeout, "transport: connect timed out");
                return Err(TransportError::Timeout(config.connect_timeout));
            }
        };

        let shared = Arc::new(PumpShared {
            phase: AtomicU8::new(TransportPhase::Open as u8),
            close_reported: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        });
        let pump = tokio::spawn(run_pump(
            opened.events,
            Arc::clone(&opened.socket),
            Arc::clone(&shared),
            events,
            config.error_grace_period,
        ));
        debug!(%address, "transport: open");

        Ok(Self {
            socket: opened.socket,
            shared,
            pump,
        })
    }

    /// Encode and send one frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Codec`] if the frame does not encode and
    /// [`ClientError::Transport`] if the socket refuses it.
    pub async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        let bytes = frames::encode_frame(frame)?;
        self.socket.send(bytes).await?;
        Ok(())
    }

    #[must_use]
    pub fn phase(&self) -> TransportPhase {
        self.shared.phase()
    }

    #[must_use]
    pub fn is_alright(&self) -> bool {
        self.shared.phase() == TransportPhase::Open && self.socket.ready_state().is_alright()
    }

    /// Shut the transport down without reporting a close.
    pub async fn kill(&self) {
        self.shared.killed.store(true, Ordering::SeqCst);
        self.pump.abort();
        self.shared.set_phase(TransportPhase::Closed);
        self.socket.close().await;
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

// =============================================================================
// PUMP
// =============================================================================

type Decoded = BoxFuture<'static, Result<Frame, ClientError>>;

async fn run_pump(
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    socket: Arc<dyn RawSocket>,
    shared: Arc<PumpShared>,
    handler: Arc<dyn TransportEvents>,
    grace: Duration,
) {
    let mut decoding: FuturesOrdered<Decoded> = FuturesOrdered::new();

    loop {
        tokio::select! {
            biased;
            Some(decoded) = decoding.next(), if !decoding.is_empty() => deliver(&*handler, decoded),
            event = events.recv() => match event {
                Some(SocketEvent::Binary(bytes)) => decoding.push_back(decode(bytes)),
                Some(SocketEvent::Error(reason)) => {
                    warn!(%reason, ?grace, "transport: socket error; waiting before health check");
                    tokio::time::sleep(grace).await;
                    if socket.ready_state().is_alright() {
                        debug!("transport: socket recovered after error");
                        continue;
                    }
                    break;
                }
                Some(SocketEvent::Closed) | None => break,
            },
        }
    }

    while let Some(decoded) = decoding.next().await {
        deliver(&*handler, decoded);
    }

    shared.set_phase(TransportPhase::Closed);
    if !shared.killed.load(Ordering::SeqCst) && !shared.close_reported.swap(true, Ordering::SeqCst) {
        warn!("transport: socket closed unexpectedly");
        handler.on_unexpected_close();
    }
    socket.close().await;
}

fn decode(bytes: Vec<u8>) -> Decoded {
    if bytes.len() < INLINE_DECODE_LIMIT {
        return future::ready(decode_logged(&bytes)).boxed();
    }
    async move {
        match tokio::task::spawn_blocking(move || decode_logged(&bytes)).await {
            Ok(decoded) => decoded,
            Err(e) => Err(ClientError::Codec(CodecError::Decode(format!("decode task failed: {e}")))),
        }
    }
    .boxed()
}

fn decode_logged(bytes: &[u8]) -> Result<Frame, ClientError> {
    frames::decode_frame(bytes).map_err(|e| {
        let head = &bytes[..bytes.len().min(16)];
        error!(error = %e, len = bytes.len(), ?head, "transport: frame decode failed");
        ClientError::Codec(e)
    })
}

fn deliver(handler: &dyn TransportEvents, decoded: Result<Frame, ClientError>) {
    let handled = decoded.and_then(|frame| {
        let kind = frame.kind.clone();
        handler.on_frame(frame).inspect_err(|e| {
            error!(error = %e, %kind, "transport: frame handler failed");
        })
    });
    if let Err(e) = handled {
        handler.on_protocol_error(e);
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
