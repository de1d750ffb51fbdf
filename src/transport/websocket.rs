//! Websocket connector over `tokio-tungstenite`.
//!
//! Each socket gets a reader task turning inbound messages into
//! [`SocketEvent`]s and a writer task draining an outbound queue, so sends
//! never block on the network.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use super::socket::{Connector, OpenedSocket, RawSocket, ReadyState, SharedReadyState, SocketEvent};
use crate::error::TransportError;

#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, address: &Url) -> Result<OpenedSocket, TransportError> {
        let (stream, _) = connect_async(address.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let state = SharedReadyState::new(ReadyState::Open);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer_state = state.clone();
        let writer_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    writer_state.set(ReadyState::Closed);
                    let _ = writer_events.send(SocketEvent::Error(e.to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Binary(bytes)) => {
                        if event_tx.send(SocketEvent::Binary(bytes.to_vec())).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "ws: close frame received");
                        break;
                    }
                    Ok(Message::Text(text)) => {
                        warn!(len = text.len(), "ws: ignoring text message");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        reader_state.set(ReadyState::Closed);
                        let _ = event_tx.send(SocketEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            reader_state.set(ReadyState::Closed);
            let _ = event_tx.send(SocketEvent::Closed);
        });

        let socket = WsSocket {
            outbound: outbound_tx,
            state,
            reader: reader.abort_handle(),
        };
        Ok(OpenedSocket {
            socket: Arc::new(socket),
            events: event_rx,
        })
    }
}

struct WsSocket {
    outbound: mpsc::UnboundedSender<Message>,
    state: SharedReadyState,
    reader: AbortHandle,
}

#[async_trait]
impl RawSocket for WsSocket {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.state.get() != ReadyState::Open {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Message::Binary(bytes.into()))
            .map_err(|_| TransportError::Send("writer task has stopped".to_owned()))
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    async fn close(&self) {
        if self.state.get() == ReadyState::Closed {
            return;
        }
        self.state.set(ReadyState::Closing);
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for WsSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
