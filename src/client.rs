//! The proxy facade: the only component callers touch.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::connection::{ConnectionManager, Connector};
use crate::correlation::CorrelationTable;
use crate::errors::{CallError, ConnectError};
use crate::wire::{self, CallId, IntoParams, RequestEnvelope, ResponseEnvelope};

/// Correlated RPC client over one long-lived connection.
///
/// Cloning is cheap; all clones share the same connection and in-flight call
/// table, so any number of tasks may issue calls concurrently. Expected
/// failures come back as [`CallError`] values, never as panics.
///
/// Dropping the last clone aborts the receive loop and closes the socket;
/// prefer [`Client::dispose`] when the shutdown should be observable (it
/// fails pending calls and fires the closed signal).
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Next call identifier; monotonically increasing, wraps at u32::MAX.
    next_id: AtomicU32,
    pending: Arc<CorrelationTable>,
    connection: Arc<ConnectionManager>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // No clone of the client remains, so nothing can be awaiting a slot;
        // aborting the loop releases both transport halves and closes the
        // socket instead of leaking them until the peer hangs up.
        self.connection.abort_current_loop();
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClientInner {
                next_id: AtomicU32::new(1),
                pending: Arc::new(CorrelationTable::new()),
                connection: Arc::new(ConnectionManager::new()),
            }),
        }
    }

    /// Open the transport, bounded by `timeout`.
    ///
    /// Only one attempt runs at a time; a second concurrent call returns
    /// [`ConnectError::AlreadyConnecting`]. Connecting while already
    /// connected tears the old connection down first (its pending calls fail
    /// with [`CallError::ConnectionClosed`]). A dispose racing the attempt
    /// wins: the attempt returns [`ConnectError::Disposed`] and leaves no
    /// connection behind.
    pub async fn connect<C: Connector>(
        &self,
        connector: &C,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        ConnectionManager::connect(
            &self.inner.connection,
            connector,
            timeout,
            &self.inner.pending,
        )
        .await
    }

    /// Whether the transport is currently open.
    pub fn connected(&self) -> bool {
        self.inner.connection.connected()
    }

    /// Resolves when the current connection ends (peer close, transport
    /// error, dispose, or replacement by a new connect). Resolves immediately
    /// if nothing is connected.
    pub async fn closed(&self) {
        self.inner.connection.closed().await
    }

    /// Invoke `method` with `params`, decoding the result into `T`.
    ///
    /// The task suspends while awaiting its completion slot; no thread is
    /// blocked and no lock is held across the wait.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl IntoParams,
    ) -> Result<T, CallError> {
        let envelope = self.dispatch(method, params).await?;
        if let Some(text) = envelope.error_text() {
            return Err(CallError::Remote(text));
        }
        // Lazy payload decode: the wire kept the result opaque until here.
        let payload = envelope.result.unwrap_or(Value::Nil);
        rmpv::ext::from_value(payload).map_err(|e| CallError::Decode(e.to_string()))
    }

    /// Invoke `method` with `params`, discarding any result payload.
    pub async fn call_void(
        &self,
        method: &str,
        params: impl IntoParams,
    ) -> Result<(), CallError> {
        let envelope = self.dispatch(method, params).await?;
        if let Some(text) = envelope.error_text() {
            return Err(CallError::Remote(text));
        }
        Ok(())
    }

    /// The shared call path: fail fast, assign an id, register, write, await.
    async fn dispatch(
        &self,
        method: &str,
        params: impl IntoParams,
    ) -> Result<ResponseEnvelope, CallError> {
        // Usage errors are detected before any identifier is consumed or any
        // I/O attempted.
        if self.inner.connection.is_disposed() {
            return Err(CallError::Disposed);
        }
        if !self.inner.connection.connected() {
            return Err(CallError::NotConnected);
        }
        let params = params.into_params()?;

        let id = CallId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        // Register before writing: the response cannot beat the slot into
        // the table.
        let slot = self.inner.pending.register(id);
        let request = RequestEnvelope::new(id, method, params);
        let bytes = match wire::encode_request(&request) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.inner.pending.remove(id);
                return Err(e.into());
            }
        };

        trace!(%id, method, "sending request");
        if let Err(e) = self.inner.connection.write_frame(&bytes).await {
            self.inner.pending.remove(id);
            return Err(e);
        }

        match slot.await {
            // The receive loop removed the table entry when it resolved us.
            Ok(envelope) => Ok(envelope),
            // Sender dropped: the connection was torn down or disposed with
            // this call still in flight.
            Err(_) => {
                self.inner.pending.remove(id);
                Err(CallError::ConnectionClosed)
            }
        }
    }

    /// Shut the client down. Idempotent; pending calls resolve with
    /// [`CallError::ConnectionClosed`] and later calls fail fast with
    /// [`CallError::Disposed`].
    pub async fn dispose(&self) {
        self.inner.connection.dispose(&self.inner.pending).await;
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
