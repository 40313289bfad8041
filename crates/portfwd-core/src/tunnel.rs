//! The tunnel primitive seen from the worker's side
//!
//! Opening a tunnel yields two one-shot signals: `ready` fires once the local
//! listener accepts connections, `exit` carries the final outcome of the
//! tunnel's run. The tunnel watches a [`StopSignal`] and exits cleanly once it
//! fires.

use crate::error::ForwardError;
use crate::record::LogHandle;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Stop request for one tunnel, closeable exactly once
///
/// The signal is chained to the record's cancellation token, so process
/// shutdown also wakes anything waiting on [`StopSignal::closed`]. Only an
/// explicit [`close`](StopSignal::close) marks it as a stop request.
#[derive(Debug, Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug)]
struct StopInner {
    closed: AtomicBool,
    token: CancellationToken,
}

impl StopSignal {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            inner: Arc::new(StopInner {
                closed: AtomicBool::new(false),
                token: parent.child_token(),
            }),
        }
    }

    /// Close the signal. Returns `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.token.cancel();
        true
    }

    /// Whether an explicit stop was requested
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves on explicit stop or when the parent context is cancelled
    pub async fn closed(&self) {
        self.inner.token.cancelled().await
    }
}

/// Everything a tunnel opener needs to start forwarding
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub namespace: String,
    pub pod: String,
    /// Local listen address, always IPv4 loopback
    pub bind_addr: SocketAddr,
    pub remote_port: u16,
    pub log: LogHandle,
}

/// Receiving half of a freshly opened tunnel
#[derive(Debug)]
pub struct OpenedTunnel {
    pub ready: oneshot::Receiver<()>,
    pub exit: oneshot::Receiver<Result<(), ForwardError>>,
}

/// Sending half, held by the tunnel implementation
#[derive(Debug)]
pub struct TunnelSignals {
    ready: Option<oneshot::Sender<()>>,
    exit: oneshot::Sender<Result<(), ForwardError>>,
}

impl TunnelSignals {
    /// Signal readiness. Later calls are ignored.
    pub fn ready(&mut self) {
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(());
        }
    }

    /// Report the tunnel's final outcome
    pub fn exit(self, result: Result<(), ForwardError>) {
        let _ = self.exit.send(result);
    }
}

/// Create a connected signal pair for a new tunnel
pub fn tunnel_channel() -> (TunnelSignals, OpenedTunnel) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    (
        TunnelSignals {
            ready: Some(ready_tx),
            exit: exit_tx,
        },
        OpenedTunnel {
            ready: ready_rx,
            exit: exit_rx,
        },
    )
}

/// Opens multiplexed tunnels to a concrete pod port
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    /// Start a tunnel and return its signals without waiting for readiness
    async fn open(&self, spec: TunnelSpec, stop: StopSignal)
        -> Result<OpenedTunnel, ForwardError>;
}
