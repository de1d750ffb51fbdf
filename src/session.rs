//! A live notebook session: transport, correlation, batching, reconnects.
//!
//! DESIGN
//! ======
//! One driver task owns the connection lifecycle. It feeds [`LinkEvent`]s
//! through [`LinkState::step`] and runs the resulting commands in order.
//! Events come from the driver itself (connect results), from timers, from
//! the resync task, from the transport (unexpected close), and from `kill`.
//! Opening a socket races against the kill switch so `kill` is never stuck
//! behind it. The resync hook runs in its own task, since it waits on the
//! very socket whose close the driver has to observe.
//!
//! Each transport carries a generation number. A close reported by a
//! superseded transport is ignored.
//!
//! Inbound frames are routed synchronously on the transport's pump: the
//! correlator resolves responses, everything else goes to the
//! [`SessionObserver`].
//!
//! LIFECYCLE
//! =========
//! 1. `start` spawns the driver and posts `Start`
//! 2. `OpenSocket` opens a transport and sends `connect` with the session metadata
//! 3. Unexpected close → reconnect after a short delay → `on_reconnect` resync
//! 4. `kill` stops keepalive, closes the socket, ends the driver

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use frames::{Frame, Map, Value};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::batcher::UpdateBatcher;
use crate::config::ClientConfig;
use crate::correlator::{Correlator, Routed};
use crate::error::{ClientError, TransportError};
use crate::message::MessageKind;
use crate::reconnect::{LinkCommand, LinkEvent, LinkState, ReconnectPolicy, Transition};
use crate::transport::{Connector, SocketTransport, TransportEvents};

// =============================================================================
// OBSERVER
// =============================================================================

/// Something the user should be told about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// An inbound message could not be decoded or handled.
    ProtocolError(String),
    /// The client cannot recover by itself; reload the notebook.
    ReloadRequired(String),
    /// A read-only preview fell out of sync with its source.
    StaticPreviewOutOfSync,
    /// A remote patch batch failed to apply.
    PatchFailed { path: String, error: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolError(message) => write!(f, "protocol error: {message}"),
            Self::ReloadRequired(reason) => write!(f, "reload required: {reason}"),
            Self::StaticPreviewOutOfSync => f.write_str("this preview is out of sync with the notebook"),
            Self::PatchFailed { path, error } => write!(f, "patch at `{path}` failed: {error}"),
        }
    }
}

/// Upward callbacks from a session.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// A frame that did not answer a pending request, or a broadcast response.
    ///
    /// # Errors
    ///
    /// An error is logged and surfaced as [`Notice::ProtocolError`].
    fn on_unrequested_update(&self, frame: Frame, by_me: bool) -> Result<(), ClientError>;

    fn on_connection_status(&self, connected: bool, hopeless: bool);

    /// Called after a reconnect. Return `false` to give up on the session.
    async fn on_reconnect(&self) -> bool;

    fn on_notice(&self, notice: Notice);
}

/// Handshake result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionInfo {
    pub session_options: Value,
    pub version_info: Value,
    pub notebook_exists: bool,
}

impl ConnectionInfo {
    /// Parse the body of a `connect` response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Handshake`] if the body is not a map.
    pub fn from_response(body: &Value) -> Result<Self, ClientError> {
        if body.as_map().is_none() {
            return Err(ClientError::Handshake(format!("expected a map, got {}", body.kind_name())));
        }
        Ok(Self {
            session_options: body.get("session_options").cloned().unwrap_or_default(),
            version_info: body.get("version_info").cloned().unwrap_or_default(),
            notebook_exists: body.get("notebook_exists").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: ClientConfig,
    address: Url,
    connector: Arc<dyn Connector>,
    connect_metadata: Map,
    correlator: Arc<Correlator>,
    batcher: Arc<UpdateBatcher>,
    observer: Arc<dyn SessionObserver>,
    auto_reconnect: AtomicBool,
    link: watch::Sender<LinkState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    kill_switch: Notify,
    generation: AtomicU64,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    resync: Mutex<Option<JoinHandle<()>>>,
    info: Mutex<Option<ConnectionInfo>>,
}

impl Session {
    /// Spawn the session driver and begin connecting.
    #[must_use]
    pub fn start(
        connector: Arc<dyn Connector>,
        address: Url,
        connect_metadata: Map,
        config: ClientConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let correlator = Arc::new(Correlator::new(config.recent_frames));
        let batcher = UpdateBatcher::new(Arc::clone(&correlator));
        let (events, event_rx) = mpsc::unbounded_channel();
        let (link, _) = watch::channel(LinkState::Idle);

        let inner = Arc::new(SessionInner {
            auto_reconnect: AtomicBool::new(config.auto_reconnect),
            config,
            address,
            connector,
            connect_metadata,
            correlator,
            batcher,
            observer,
            link,
            events,
            kill_switch: Notify::new(),
            generation: AtomicU64::new(0),
            keepalive: Mutex::new(None),
            resync: Mutex::new(None),
            info: Mutex::new(None),
        });
        info!(client_id = %inner.correlator.client_id(), address = %inner.address, "session: starting");

        tokio::spawn(drive(Arc::clone(&inner), event_rx));
        inner.post(LinkEvent::Start);
        Self { inner }
    }

    /// Start a session and wait until it is connected.
    ///
    /// # Errors
    ///
    /// As [`Session::wait_connected`].
    pub async fn connect(
        connector: Arc<dyn Connector>,
        address: Url,
        connect_metadata: Map,
        config: ClientConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, ClientError> {
        let session = Self::start(connector, address, connect_metadata, config, observer);
        session.wait_connected().await?;
        Ok(session)
    }

    /// Wait until the link is connected.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionLost`] if the session is killed or
    /// becomes hopeless first.
    pub async fn wait_connected(&self) -> Result<ConnectionInfo, ClientError> {
        let mut link = self.inner.link.subscribe();
        loop {
            let state = *link.borrow_and_update();
            if state.is_connected() {
                return Ok(self.connection_info().unwrap_or_default());
            }
            if state.is_terminal() {
                return Err(ClientError::ConnectionLost);
            }
            link.changed().await.map_err(|_| ClientError::ConnectionLost)?;
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.inner.correlator.client_id()
    }

    #[must_use]
    pub fn link_state(&self) -> LinkState {
        *self.inner.link.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.inner.link.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link_state().is_connected()
    }

    #[must_use]
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.info.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn recent_frames(&self) -> Vec<Frame> {
        self.inner.correlator.recent_frames()
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Send a request; `update_notebook` requests are batched per tick.
    ///
    /// # Errors
    ///
    /// As [`UpdateBatcher::send`].
    pub async fn send(
        &self,
        kind: MessageKind,
        body: Value,
        metadata: Map,
        no_broadcast: bool,
    ) -> Result<Frame, ClientError> {
        self.inner.batcher.send(kind, body, metadata, no_broadcast).await
    }

    /// Stop the session. Outstanding requests are left unresolved.
    pub fn kill(&self) {
        info!(client_id = %self.client_id(), "session: kill");
        self.inner.post(LinkEvent::Kill);
        self.inner.kill_switch.notify_waiters();
    }
}

// =============================================================================
// DRIVER
// =============================================================================

async fn drive(inner: Arc<SessionInner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let state = *inner.link.borrow();
        let Transition { next, commands } = state.step(event, &inner.policy());
        if next != state {
            debug!(?state, ?next, ?event, "session: link transition");
            inner.link.send_replace(next);
        }
        for command in commands {
            inner.execute(command).await;
        }
        if next == LinkState::Killed {
            break;
        }
    }
    debug!(client_id = %inner.correlator.client_id(), "session: driver stopped");
}

impl SessionInner {
    fn post(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            auto_reconnect: self.auto_reconnect.load(Ordering::SeqCst),
            ..ReconnectPolicy::from_config(&self.config)
        }
    }

    async fn execute(self: &Arc<Self>, command: LinkCommand) {
        match command {
            LinkCommand::OpenSocket => {
                let opened = tokio::select! {
                    opened = self.open_and_handshake() => opened,
                    () = self.kill_switch.notified() => return,
                };
                match opened {
                    Ok(info) => {
                        info!(notebook_exists = info.notebook_exists, "session: connected");
                        *self.info.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
                        self.post(LinkEvent::ConnectSucceeded);
                    }
                    Err(e) => {
                        warn!(error = %e, address = %self.address, "session: connect failed");
                        self.post(LinkEvent::ConnectFailed);
                    }
                }
            }
            LinkCommand::ScheduleRetry(delay) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(LinkEvent::RetryElapsed);
                });
            }
            LinkCommand::Resync => self.start_resync(),
            LinkCommand::NotifyStatus { connected, hopeless } => {
                self.observer.on_connection_status(connected, hopeless);
            }
            LinkCommand::StartKeepalive => self.start_keepalive(),
            LinkCommand::StopKeepalive => {
                if let Some(task) = self.keepalive.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    task.abort();
                }
            }
            LinkCommand::ShowReloadNotice => {
                self.observer.on_notice(Notice::ReloadRequired(
                    "the notebook could not be resynchronised after reconnecting".to_owned(),
                ));
            }
            LinkCommand::CloseSocket => {
                if let Some(task) = self.resync.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    task.abort();
                }
                let transport = self.correlator.detach();
                if let Some(transport) = transport {
                    transport.kill().await;
                }
            }
        }
    }

    async fn open_and_handshake(self: &Arc<Self>) -> Result<ConnectionInfo, ClientError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = Arc::new(LinkEvents {
            inner: Arc::downgrade(self),
            generation,
        });
        let transport = SocketTransport::open(&*self.connector, &self.address, &self.config, events).await?;
        let previous = self.correlator.attach(Arc::new(transport));
        if let Some(previous) = previous {
            previous.kill().await;
        }

        let handshake = self
            .correlator
            .send(&MessageKind::Connect, Value::empty_map(), self.connect_metadata.clone(), true);
        let response = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(self.config.connect_timeout))??;
        ConnectionInfo::from_response(&response.body)
    }

    /// Run the observer's resync hook off the driver so a close during the
    /// resync still reaches the state machine. A result for a socket that
    /// has since been replaced is dropped.
    fn start_resync(self: &Arc<Self>) {
        let generation = self.generation.load(Ordering::SeqCst);
        let observer = Arc::clone(&self.observer);
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let accepted = observer.on_reconnect().await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, "session: dropping resync result of superseded socket");
                return;
            }
            if !accepted {
                warn!("session: resync rejected after reconnect");
            }
            inner.post(LinkEvent::ResyncFinished { accepted });
        });

        let previous = self.resync.lock().unwrap_or_else(PoisonError::into_inner).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn start_keepalive(self: &Arc<Self>) {
        let period = self.config.keepalive_interval;
        let correlator = Arc::downgrade(&self.correlator);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(correlator) = correlator.upgrade() else { break };
                tokio::spawn(async move {
                    if let Err(e) = correlator
                        .send(&MessageKind::Ping, Value::empty_map(), Map::new(), true)
                        .await
                    {
                        debug!(error = %e, "session: keepalive ping failed");
                    }
                });
            }
        });

        let previous = self.keepalive.lock().unwrap_or_else(PoisonError::into_inner).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

/// Transport callbacks for one generation of socket.
struct LinkEvents {
    inner: Weak<SessionInner>,
    generation: u64,
}

impl LinkEvents {
    fn current(&self) -> Option<Arc<SessionInner>> {
        self.inner
            .upgrade()
            .filter(|inner| inner.generation.load(Ordering::SeqCst) == self.generation)
    }
}

impl TransportEvents for LinkEvents {
    fn on_frame(&self, frame: Frame) -> Result<(), ClientError> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        match inner.correlator.route(frame) {
            Routed::Resolved => Ok(()),
            Routed::Broadcast { frame, reply } => {
                let handled = inner.observer.on_unrequested_update(frame.clone(), true);
                reply.resolve(frame);
                handled
            }
            Routed::Unrequested { frame, by_me } => inner.observer.on_unrequested_update(frame, by_me),
        }
    }

    fn on_unexpected_close(&self) {
        match self.current() {
            Some(inner) => inner.post(LinkEvent::UnexpectedClose),
            None => debug!(generation = self.generation, "session: ignoring close of superseded socket"),
        }
    }

    fn on_protocol_error(&self, error: ClientError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.observer.on_notice(Notice::ProtocolError(error.to_string()));
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
