//! Notebook client: the replica kept in sync with one engine notebook.
//!
//! DESIGN
//! ======
//! `NotebookClient` sits on top of a [`Session`]. Inbound patch batches are
//! applied to the [`NotebookStore`] synchronously on the frame pump; local
//! edits go through `mutate`, which diffs a draft, sends the patches as one
//! `update_notebook` request, and commits them once the engine says yes.
//!
//! `mutate` calls run one at a time in submission order (a fair async
//! mutex). The store's own lock is a plain mutex taken only for short
//! synchronous sections, so inbound frames never wait behind a mutation.
//!
//! Bond changes made while the notebook is busy are queued by the store and
//! flushed as a single `mutate` whenever the notebook may have gone idle:
//! after a remote batch, after a local update, and when the last client
//! script finishes.
//!
//! ERROR HANDLING
//! ==============
//! A remote batch that fails to apply leaves the replica unchanged. Failures
//! under `status_tree` are dropped. Anything else raises
//! [`Notice::PatchFailed`] and then recovers: while connected, one
//! `reset_shared_state` request (never two at once); in a static preview, a
//! [`Notice::StaticPreviewOutOfSync`]; otherwise [`Notice::ReloadRequired`].
//!
//! LIFECYCLE
//! =========
//! 1. `connect` starts the session and waits for the handshake
//! 2. The full state is requested with `reset_shared_state`
//! 3. After every reconnect the full state is requested again; if the engine
//!    lost the notebook the session gives up

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use async_trait::async_trait;
use frames::{Frame, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::message::{MessageKind, notebook_metadata};
use crate::session::{ConnectionInfo, Notice, Session, SessionObserver};
use crate::state::patch::{apply_in_place, display_path, patches_from_value, patches_to_value};
use crate::state::replica::BONDS;
use crate::state::{ApplyFailure, NotebookStore, NotebookView, Patch, PreparedMutation, Recovery};
use crate::transport::Connector;

const REJECTED: &str = "👎";

/// Callbacks from a [`NotebookClient`]. Every method has a default.
pub trait NotebookObserver: Send + Sync {
    /// The replica changed.
    fn on_state_changed(&self, _replica: &Value) {}

    fn on_connection_status(&self, _connected: bool, _hopeless: bool) {}

    fn on_notice(&self, notice: Notice) {
        warn!(%notice, "notebook: notice");
    }

    /// A pushed frame the client does not interpret.
    fn on_frame(&self, _frame: &Frame, _by_me: bool) {}
}

impl NotebookObserver for () {}

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Clone)]
pub struct NotebookClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    notebook_id: String,
    config: ClientConfig,
    store: Mutex<NotebookStore>,
    session: OnceLock<Session>,
    mutations: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    resync_in_flight: AtomicBool,
    observer: Arc<dyn NotebookObserver>,
}

impl NotebookClient {
    /// Connect to `notebook_id` and load its full state.
    ///
    /// Connect attempts are retried until one succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionLost`] if the session gives up before
    /// connecting, or the error of the initial state request. The session is
    /// killed in both cases.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        address: Url,
        notebook_id: &str,
        config: ClientConfig,
        observer: Arc<dyn NotebookObserver>,
    ) -> Result<Self, ClientError> {
        let inner = Arc::new(ClientInner {
            notebook_id: notebook_id.to_owned(),
            store: Mutex::new(NotebookStore::new(notebook_id)),
            session: OnceLock::new(),
            mutations: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(false),
            resync_in_flight: AtomicBool::new(false),
            observer,
            config: config.clone(),
        });
        let bridge = Arc::new(SessionBridge {
            inner: Arc::downgrade(&inner),
        });
        let session = Session::start(connector, address, notebook_metadata(notebook_id), config, bridge);
        let _ = inner.session.set(session.clone());

        let loaded = async {
            let info = session.wait_connected().await?;
            if !info.notebook_exists {
                warn!(notebook_id, "notebook: engine does not know this notebook");
            }
            inner.request_full_state().await
        };
        if let Err(e) = loaded.await {
            warn!(error = %e, notebook_id, "notebook: initial load failed");
            session.kill();
            return Err(e);
        }

        info!(notebook_id, client_id = %session.client_id(), "notebook: loaded");
        Ok(Self { inner })
    }

    #[must_use]
    pub fn notebook_id(&self) -> &str {
        &self.inner.notebook_id
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.inner.session.get().map(Session::client_id)
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.inner.session.get()
    }

    #[must_use]
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.session.get().and_then(Session::connection_info)
    }

    /// A copy of the current replica.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.inner.lock_store().replica().clone()
    }

    /// Run `f` against the current replica.
    pub fn with_view<R>(&self, f: impl FnOnce(NotebookView<'_>) -> R) -> R {
        f(self.inner.lock_store().view())
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.lock_store().is_idle()
    }

    #[must_use]
    pub fn queued_bond_count(&self) -> usize {
        self.inner.lock_store().gate().queued_bond_count()
    }

    /// Edit a draft of the replica and send the difference to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ArrayEdit`] if the edit changes part of an
    /// array, [`ClientError::Rejected`] if the engine refuses the update,
    /// and transport errors from the request.
    pub async fn mutate<F>(&self, edit: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut Value) + Send,
    {
        self.inner.mutate(edit).await
    }

    /// Send an explicit patch batch.
    ///
    /// # Errors
    ///
    /// As [`NotebookClient::mutate`], plus [`ClientError::Patch`] if the
    /// batch does not apply to the replica.
    pub async fn submit_patches(&self, patches: Vec<Patch>) -> Result<(), ClientError> {
        let _turn = self.inner.mutations.lock().await;
        let prepared = self.inner.lock_store().prepare_patches(patches)?;
        self.inner.send_prepared(prepared).await
    }

    /// Set a bond value. A first value equal to the stored one may be
    /// skipped, per [`ClientConfig::bond_dedup`].
    ///
    /// # Errors
    ///
    /// As [`NotebookClient::mutate`].
    pub async fn set_bond(&self, name: &str, value: Value, is_first_value: bool) -> Result<(), ClientError> {
        let skip = {
            let store = self.inner.lock_store();
            self.inner
                .config
                .bond_dedup
                .should_skip(store.view().bond_value(name), &value, is_first_value)
        };
        if skip {
            debug!(bond = name, "notebook: skipping unchanged first bond value");
            return Ok(());
        }

        let name = name.to_owned();
        self.inner
            .mutate(move |draft| {
                let mut bond = Value::empty_map();
                bond.insert("value", value);
                if draft.get(BONDS).and_then(Value::as_map).is_none() {
                    draft.insert(BONDS, Value::empty_map());
                }
                if let Some(bonds) = draft.get_mut(BONDS) {
                    bonds.insert(name, bond);
                }
            })
            .await
    }

    /// Apply patches locally without sending them, onto `base` instead of
    /// the replica if given. Returns the inverse batch.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Patch`] and leaves the replica unchanged if the
    /// batch does not apply.
    pub fn apply_patches(&self, patches: &[Patch], base: Option<&Value>) -> Result<Vec<Patch>, ClientError> {
        let applied = {
            let mut store = self.inner.lock_store();
            store
                .apply(patches, base, true)
                .map(|inverse| (inverse, store.replica().clone()))
        };
        let (inverse, snapshot) = applied.map_err(|failure| ClientError::Patch(failure.error))?;
        self.inner.observer.on_state_changed(&snapshot);
        Ok(inverse)
    }

    // =========================================================================
    // ACTIONS
    // =========================================================================

    /// Ask the engine to run `cells`.
    ///
    /// # Errors
    ///
    /// Returns the request's transport error.
    pub async fn run_cells(&self, cells: &[String]) -> Result<Frame, ClientError> {
        let mut body = Value::empty_map();
        body.insert("cells", Value::Array(cells.iter().map(|c| Value::from(c.as_str())).collect()));
        self.inner.request(MessageKind::RunMultipleCells, body).await
    }

    /// # Errors
    ///
    /// Returns the request's transport error.
    pub async fn interrupt(&self) -> Result<Frame, ClientError> {
        self.inner.request(MessageKind::InterruptAll, Value::empty_map()).await
    }

    /// # Errors
    ///
    /// Returns the request's transport error.
    pub async fn restart_process(&self) -> Result<Frame, ClientError> {
        self.inner.request(MessageKind::RestartProcess, Value::empty_map()).await
    }

    /// # Errors
    ///
    /// Returns the request's transport error.
    pub async fn shutdown(&self, keep_in_session: bool) -> Result<Frame, ClientError> {
        let mut body = Value::empty_map();
        body.insert("keep_in_session", Value::Bool(keep_in_session));
        self.inner.request(MessageKind::ShutdownNotebook, body).await
    }

    /// Ask the engine for the full notebook state.
    ///
    /// # Errors
    ///
    /// Returns the request's transport error.
    pub async fn request_full_state(&self) -> Result<(), ClientError> {
        self.inner.request_full_state().await
    }

    // =========================================================================
    // SCRIPTS
    // =========================================================================

    /// Mark a client-side script as running; the notebook is not idle until
    /// it finishes. Returns `false` if the handle was already registered.
    pub fn register_script(&self, handle: &str) -> bool {
        self.inner.lock_store().gate_mut().register_script(handle)
    }

    pub fn finish_script(&self, handle: &str) {
        let last = self.inner.lock_store().gate_mut().finish_script(handle);
        if last {
            self.inner.maybe_flush_bonds();
        }
    }

    /// Stop the session. The replica stays readable.
    pub fn kill(&self) {
        if let Some(session) = self.inner.session.get() {
            session.kill();
        }
    }
}

impl ClientInner {
    fn lock_store(&self) -> MutexGuard<'_, NotebookStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn request(&self, kind: MessageKind, body: Value) -> Result<Frame, ClientError> {
        let session = self.session.get().ok_or(ClientError::NotConnected)?;
        session
            .send(kind, body, notebook_metadata(&self.notebook_id), true)
            .await
    }

    async fn request_full_state(&self) -> Result<(), ClientError> {
        let session = self.session.get().ok_or(ClientError::NotConnected)?;
        debug!(notebook_id = %self.notebook_id, "notebook: requesting full state");
        session
            .send(
                MessageKind::ResetSharedState,
                Value::empty_map(),
                notebook_metadata(&self.notebook_id),
                false,
            )
            .await?;
        Ok(())
    }

    async fn mutate<F>(self: &Arc<Self>, edit: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut Value) + Send,
    {
        let _turn = self.mutations.lock().await;
        let prepared = self.lock_store().prepare_mutation(edit)?;
        self.send_prepared(prepared).await
    }

    async fn send_prepared(self: &Arc<Self>, prepared: PreparedMutation) -> Result<(), ClientError> {
        let PreparedMutation {
            patches,
            starts_bond_wait,
            ..
        } = prepared;
        if patches.is_empty() {
            self.maybe_flush_bonds();
            return Ok(());
        }

        let mut body = Value::empty_map();
        body.insert("updates", patches_to_value(&patches));
        let sent = match self.session.get() {
            Some(session) => {
                session
                    .send(MessageKind::UpdateNotebook, body, notebook_metadata(&self.notebook_id), true)
                    .await
            }
            None => Err(ClientError::NotConnected),
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                self.lock_store().abandon(starts_bond_wait);
                self.maybe_flush_bonds();
                return Err(e);
            }
        };

        if let Some(why_not) = rejection(&response.body) {
            warn!(notebook_id = %self.notebook_id, %why_not, "notebook: update rejected");
            self.lock_store().abandon(starts_bond_wait);
            self.maybe_flush_bonds();
            return Err(ClientError::Rejected { why_not });
        }

        let from_engine = engine_patches(&response.body);
        let committed = {
            let mut store = self.lock_store();
            store
                .commit(&patches, &from_engine)
                .map(|()| store.replica().clone())
        };
        let result = match committed {
            Ok(snapshot) => {
                self.observer.on_state_changed(&snapshot);
                Ok(())
            }
            Err(failure) if failure.ignorable => {
                debug!(error = %failure.error, "notebook: status tree patch failed on commit");
                Ok(())
            }
            Err(failure) => {
                let error = failure.error.clone();
                self.handle_apply_failure(failure);
                Err(ClientError::Patch(error))
            }
        };
        self.maybe_flush_bonds();
        result
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    fn handle_frame(self: &Arc<Self>, frame: Frame, by_me: bool) -> Result<(), ClientError> {
        let kind = MessageKind::from_tag(&frame.kind);
        match kind {
            MessageKind::NotebookDiff | MessageKind::UpdateNotebook | MessageKind::ResetSharedState => {
                let reset = kind == MessageKind::ResetSharedState
                    || frame.body.get("from_reset").and_then(Value::as_bool) == Some(true);
                let patches = match frame.body.get("patches") {
                    Some(raw) => patches_from_value(raw)?,
                    None => Vec::new(),
                };
                self.apply_remote(&patches, reset);
            }
            MessageKind::Unknown(ref tag) => {
                debug!(tag = %tag, "notebook: unhandled message kind");
                self.observer.on_frame(&frame, by_me);
            }
            _ => self.observer.on_frame(&frame, by_me),
        }
        Ok(())
    }

    fn apply_remote(self: &Arc<Self>, patches: &[Patch], reset: bool) {
        let applied = {
            let mut store = self.lock_store();
            let result = if reset {
                store.apply_reset(patches)
            } else {
                store.apply_remote(patches)
            };
            result.map(|()| store.replica().clone())
        };
        match applied {
            Ok(snapshot) => self.observer.on_state_changed(&snapshot),
            Err(failure) => self.handle_apply_failure(failure),
        }
        self.maybe_flush_bonds();
    }

    fn handle_apply_failure(self: &Arc<Self>, failure: ApplyFailure) {
        let path = display_path(failure.error.path());
        if failure.ignorable {
            debug!(%path, error = %failure.error, "notebook: ignoring status tree patch failure");
            return;
        }
        warn!(%path, error = %failure.error, notebook_id = %self.notebook_id, "notebook: patch batch failed");
        self.observer.on_notice(Notice::PatchFailed {
            path,
            error: failure.error.to_string(),
        });
        self.recover();
    }

    fn recover(self: &Arc<Self>) {
        let connected = self.connected.load(Ordering::SeqCst);
        match Recovery::choose(connected, self.config.static_preview) {
            Recovery::ResetSharedState => {
                if self
                    .resync_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    debug!("notebook: resync already in flight");
                    return;
                }
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner.request_full_state().await {
                        warn!(error = %e, "notebook: resync after patch failure failed");
                    }
                    inner.resync_in_flight.store(false, Ordering::SeqCst);
                });
            }
            Recovery::StaticPreviewNotice => self.observer.on_notice(Notice::StaticPreviewOutOfSync),
            Recovery::Reload => self.observer.on_notice(Notice::ReloadRequired(
                "the notebook state could not be patched while disconnected".to_owned(),
            )),
        }
    }

    fn maybe_flush_bonds(self: &Arc<Self>) {
        let Some(queued) = self.lock_store().take_queued_bonds() else {
            return;
        };
        debug!(count = queued.len(), "notebook: flushing queued bond changes");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let flushed = inner
                .mutate(move |draft| {
                    if let Err(e) = apply_in_place(draft, &queued) {
                        warn!(error = %e, "notebook: queued bond change no longer applies");
                    }
                })
                .await;
            if let Err(e) = flushed {
                warn!(error = %e, "notebook: queued bond flush failed");
            }
        });
    }

    async fn resync(&self) -> bool {
        let Some(session) = self.session.get() else {
            return false;
        };
        let exists = session.connection_info().is_some_and(|info| info.notebook_exists);
        if !exists {
            warn!(notebook_id = %self.notebook_id, "notebook: engine lost this notebook");
            return false;
        }
        match self.request_full_state().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "notebook: resync request failed");
                false
            }
        }
    }
}

/// `why_not` of a rejected `update_notebook` response.
fn rejection(body: &Value) -> Option<String> {
    let response = body.get("response")?;
    if response.get("update_went_well").and_then(Value::as_str) != Some(REJECTED) {
        return None;
    }
    let why_not = response
        .get("why_not")
        .and_then(Value::as_str)
        .unwrap_or("no reason given");
    Some(why_not.to_owned())
}

/// Patches the engine attached to an `update_notebook` response.
fn engine_patches(body: &Value) -> Vec<Patch> {
    let Some(raw) = body.get("patches") else {
        return Vec::new();
    };
    patches_from_value(raw).unwrap_or_else(|e| {
        warn!(error = %e, "notebook: ignoring malformed patches in update response");
        Vec::new()
    })
}

// =============================================================================
// SESSION BRIDGE
// =============================================================================

struct SessionBridge {
    inner: Weak<ClientInner>,
}

#[async_trait]
impl SessionObserver for SessionBridge {
    fn on_unrequested_update(&self, frame: Frame, by_me: bool) -> Result<(), ClientError> {
        match self.inner.upgrade() {
            Some(inner) => inner.handle_frame(frame, by_me),
            None => Ok(()),
        }
    }

    fn on_connection_status(&self, connected: bool, hopeless: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.connected.store(connected, Ordering::SeqCst);
            inner.observer.on_connection_status(connected, hopeless);
        }
    }

    async fn on_reconnect(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.resync().await,
            None => false,
        }
    }

    fn on_notice(&self, notice: Notice) {
        if let Some(inner) = self.inner.upgrade() {
            inner.observer.on_notice(notice);
        }
    }
}

#[cfg(test)]
#[path = "notebook_test.rs"]
mod tests;
