//! Transport lifecycle: connect, hold, tear down.
//!
//! The manager owns the socket and the receive loop bound to it. Each
//! successful connect starts a new *generation*: the loop, the write half,
//! and the closed signal all belong to one generation, so a stale loop from
//! a replaced connection can never disturb the current one.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::correlation::CorrelationTable;
use crate::driver;
use crate::errors::{CallError, ConnectError};

// ============================================================================
// Connector
// ============================================================================

/// A factory that opens the transport on demand.
///
/// The stock implementation is [`TcpConnector`]; tests inject in-process
/// streams through their own impls.
pub trait Connector: Send + Sync {
    /// The raw stream type (e.g. `TcpStream`).
    type Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Establish a new transport connection.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// Connects to a fixed `host:port` endpoint over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// The endpoint this connector dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    type Transport = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(&self.addr).await
    }
}

// ============================================================================
// Connection manager
// ============================================================================

struct WriterSlot {
    generation: u64,
    sink: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Closed-signal and loop handle for the current generation.
///
/// The watch value flips false -> true exactly once per generation; whoever
/// wins that flip performs the teardown side effects.
struct ClosedState {
    generation: u64,
    signal: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Owns the transport, its generation counter, and the receive loop.
///
/// State machine: Disconnected -> Connecting -> {Connected | Disconnected};
/// Connected -> (peer close | dispose | replacement) -> Disconnected.
pub(crate) struct ConnectionManager {
    /// Single in-flight-attempt flag; a second concurrent connect is rejected.
    connecting: AtomicBool,
    connected: AtomicBool,
    /// Sticky: once set, no connect may install a new generation.
    disposed: AtomicBool,
    generation: AtomicU64,
    writer: tokio::sync::Mutex<Option<WriterSlot>>,
    closed: std::sync::Mutex<ClosedState>,
}

/// Clears the in-flight-attempt flag even if the connect future is dropped
/// mid-attempt.
struct AttemptGuard<'a>(&'a AtomicBool);

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ConnectionManager {
    pub(crate) fn new() -> Self {
        // Before the first connect there is nothing to wait for: the closed
        // signal of generation 0 starts already fired.
        let (signal, _) = watch::channel(true);
        Self {
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            writer: tokio::sync::Mutex::new(None),
            closed: std::sync::Mutex::new(ClosedState {
                generation: 0,
                signal,
                task: None,
            }),
        }
    }

    /// Attempt to open the transport, racing the connector against `timeout`.
    ///
    /// On success the previous connection (if any) has been torn down, a new
    /// generation is live, and exactly one receive loop is draining it. On
    /// timeout the partially opened transport is dropped and the state stays
    /// Disconnected.
    pub(crate) async fn connect<C: Connector>(
        manager: &Arc<Self>,
        connector: &C,
        timeout: Duration,
        pending: &Arc<CorrelationTable>,
    ) -> Result<(), ConnectError> {
        if manager.disposed.load(Ordering::SeqCst) {
            return Err(ConnectError::Disposed);
        }
        if manager
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConnectError::AlreadyConnecting);
        }
        let _guard = AttemptGuard(&manager.connecting);

        // A connect targeting a new endpoint while Connected replaces the old
        // transport; tear it down before dialing.
        manager.shutdown_current(pending).await;

        let transport = match tokio::time::timeout(timeout, connector.connect()).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(ConnectError::Io(e)),
            Err(_) => {
                trace!(?timeout, "connect attempt timed out");
                return Err(ConnectError::Timeout(timeout));
            }
        };

        let generation = manager.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (reader, writer) = tokio::io::split(transport);

        *manager.writer.lock().await = Some(WriterSlot {
            generation,
            sink: Box::new(writer),
        });
        {
            let (signal, _) = watch::channel(false);
            let mut state = manager.closed.lock().unwrap();
            *state = ClosedState {
                generation,
                signal,
                task: None,
            };
            // Same critical section as teardown's flag update, so a stale
            // teardown can never race this transition.
            manager.connected.store(true, Ordering::SeqCst);
        }

        let task = tokio::spawn(driver::run(
            Arc::clone(manager),
            Arc::clone(pending),
            generation,
            Box::new(reader),
        ));
        {
            let mut state = manager.closed.lock().unwrap();
            if state.generation == generation {
                state.task = Some(task);
            }
        }

        // Dispose may have run between the disposed check above and here; it
        // tore down whatever generation was current at that moment, which may
        // not be the one just installed. Undo it rather than leave a live
        // loop nothing will ever tear down.
        if manager.disposed.load(Ordering::SeqCst) {
            manager.shutdown_current(pending).await;
            return Err(ConnectError::Disposed);
        }

        debug!(generation, "connected");
        Ok(())
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Mark the manager disposed and tear down the current generation.
    /// Idempotent; a concurrent connect past its own disposed check sees the
    /// flag on return and undoes the generation it installed.
    pub(crate) async fn dispose(&self, pending: &CorrelationTable) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing connection manager");
        self.shutdown_current(pending).await;
    }

    /// Abort the current receive loop without awaiting anything.
    ///
    /// Last-resort cleanup for drop paths: the aborted task releases its
    /// halves of the transport, which closes the socket. Pending calls are
    /// not drained here; by the time this runs no caller can be awaiting one.
    pub(crate) fn abort_current_loop(&self) {
        let task = self.closed.lock().unwrap().task.take();
        if let Some(task) = task {
            task.abort();
        }
    }

    pub(crate) fn connected(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    /// Resolves when the current connection ends; immediately if there is
    /// no live connection.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.lock().unwrap().signal.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped: the generation was replaced, which implies it
        // closed first.
    }

    /// Write one encoded frame to the current transport.
    pub(crate) async fn write_frame(&self, bytes: &[u8]) -> Result<(), CallError> {
        let mut slot = self.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            return Err(CallError::NotConnected);
        };
        writer.sink.write_all(bytes).await.map_err(CallError::Transport)?;
        writer.sink.flush().await.map_err(CallError::Transport)?;
        Ok(())
    }

    /// End `generation`: fire its closed signal (exactly once, the watch flip
    /// decides the winner), mark Disconnected, fail every pending call, and
    /// drop its write half. No-op for any other generation.
    ///
    /// The signal flip, the connected flag, and the pending drain happen in
    /// one critical section under the closed lock so a stale teardown racing
    /// a fresh connect can never clobber the new generation's state.
    pub(crate) async fn teardown(&self, generation: u64, pending: &CorrelationTable) {
        {
            let state = self.closed.lock().unwrap();
            if state.generation != generation {
                return;
            }
        }

        // Drop the write half first. After this point no frame can be
        // written on this generation, so a call registering concurrently
        // either fails its write (and cleans up after itself) or is already
        // in the table when the drain below runs. Either way it cannot hang.
        {
            let mut slot = self.writer.lock().await;
            if slot.as_ref().is_some_and(|w| w.generation == generation) {
                *slot = None;
            }
        }

        {
            let state = self.closed.lock().unwrap();
            if state.generation != generation {
                return;
            }
            let already_fired = state.signal.send_replace(true);
            self.connected.store(false, Ordering::SeqCst);
            let failed = pending.fail_all();
            if !already_fired && failed > 0 {
                debug!(generation, failed, "failed pending calls on teardown");
            }
        }
    }

    /// Abort the current receive loop and tear its generation down.
    pub(crate) async fn shutdown_current(&self, pending: &CorrelationTable) {
        let (generation, task) = {
            let mut state = self.closed.lock().unwrap();
            (state.generation, state.task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        self.teardown(generation, pending).await;
    }
}
