//! Same-tick batching of `update_notebook` requests.
//!
//! DESIGN
//! ======
//! The first submission opens a batch and schedules a flush that runs once
//! the submitting task yields. Submissions made before then append their
//! patches to the open batch. The flush sends one request carrying every
//! patch in submission order, and every contributor receives the same
//! response. The batch is broadcast unless every contributor opted out.
//!
//! ERROR HANDLING
//! ==============
//! A submission targeting a different notebook than the open batch fails
//! immediately with [`ClientError::BatchConflict`]; the open batch is left
//! as it was. A failed flush fans the same error out to every contributor.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use frames::{Frame, Map, Value};
use tokio::sync::oneshot;
use tracing::debug;

use crate::correlator::Correlator;
use crate::error::ClientError;
use crate::message::{MessageKind, NOTEBOOK_ID};

type Waiter = oneshot::Sender<Result<Frame, ClientError>>;

struct OpenBatch {
    notebook_id: Option<String>,
    metadata: Map,
    no_broadcast: bool,
    updates: Vec<Value>,
    waiters: Vec<Waiter>,
}

pub struct UpdateBatcher {
    correlator: Arc<Correlator>,
    open: Mutex<Option<OpenBatch>>,
}

impl UpdateBatcher {
    #[must_use]
    pub fn new(correlator: Arc<Correlator>) -> Arc<Self> {
        Arc::new(Self {
            correlator,
            open: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Send a request; `update_notebook` requests are batched.
    ///
    /// # Errors
    ///
    /// As [`UpdateBatcher::submit`] for batched requests and
    /// [`Correlator::send`] for everything else.
    pub async fn send(
        self: &Arc<Self>,
        kind: MessageKind,
        body: Value,
        metadata: Map,
        no_broadcast: bool,
    ) -> Result<Frame, ClientError> {
        if kind != MessageKind::UpdateNotebook {
            return self.correlator.send(&kind, body, metadata, no_broadcast).await;
        }
        let updates = match body {
            Value::Map(mut map) => match map.remove("updates") {
                Some(Value::Array(updates)) => updates,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        self.submit(updates, metadata, no_broadcast)?.await
    }

    /// Add patches to the open batch, opening one if needed.
    ///
    /// This is synchronous so that several submissions can join one batch
    /// before the submitting task yields. The returned future resolves to
    /// the batch's response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::BatchConflict`] if the open batch targets a
    /// different notebook.
    pub fn submit(
        self: &Arc<Self>,
        updates: Vec<Value>,
        metadata: Map,
        no_broadcast: bool,
    ) -> Result<impl Future<Output = Result<Frame, ClientError>> + Send + 'static, ClientError> {
        let notebook_id = metadata.get(NOTEBOOK_ID).and_then(Value::as_str).map(ToOwned::to_owned);
        let (waiter, response) = oneshot::channel();

        let opened = {
            let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
            match open.as_mut() {
                Some(batch) => {
                    if batch.notebook_id != notebook_id {
                        return Err(ClientError::BatchConflict {
                            pending: batch.notebook_id.clone(),
                            incoming: notebook_id,
                        });
                    }
                    batch.updates.extend(updates);
                    batch.no_broadcast &= no_broadcast;
                    batch.waiters.push(waiter);
                    false
                }
                None => {
                    *open = Some(OpenBatch {
                        notebook_id,
                        metadata,
                        no_broadcast,
                        updates,
                        waiters: vec![waiter],
                    });
                    true
                }
            }
        };

        if opened {
            let batcher = Arc::clone(self);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                batcher.flush().await;
            });
        }

        Ok(async move { response.await.unwrap_or(Err(ClientError::ConnectionLost)) })
    }

    async fn flush(&self) {
        let Some(batch) = self.open.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        debug!(
            updates = batch.updates.len(),
            contributors = batch.waiters.len(),
            notebook_id = ?batch.notebook_id,
            "batcher: flushing"
        );

        let mut body = Value::empty_map();
        body.insert("updates", Value::Array(batch.updates));
        let result = self
            .correlator
            .send(&MessageKind::UpdateNotebook, body, batch.metadata, batch.no_broadcast)
            .await;

        for waiter in batch.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
#[path = "batcher_test.rs"]
mod tests;
