//! Per-tunnel mutable state
//!
//! The registry map is guarded by the manager's lock. Everything the worker
//! mutates while a tunnel runs (status, error, timestamps, the log ring) lives
//! behind the record's own lock so a slow worker never blocks listings.

use crate::error::ForwardError;
use crate::identity::{TunnelIdentity, TunnelTarget};
use crate::tunnel::StopSignal;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// Lifecycle status of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Starting,
    Active,
    Stopped,
    Error,
    Reconnecting,
}

impl TunnelStatus {
    /// Starting, Active and Reconnecting records own a running worker
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Starting | TunnelStatus::Active | TunnelStatus::Reconnecting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Starting => "starting",
            TunnelStatus::Active => "active",
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Error => "error",
            TunnelStatus::Reconnecting => "reconnecting",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            TunnelStatus::Starting => "◌",
            TunnelStatus::Active => "●",
            TunnelStatus::Stopped => "○",
            TunnelStatus::Error => "✗",
            TunnelStatus::Reconnecting => "↻",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct RecordState {
    status: TunnelStatus,
    error: Option<String>,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    logs: VecDeque<String>,
    backend_pod: Option<String>,
    resolved_port: Option<u16>,
    auto_reconnect: bool,
    reconnect_count: u32,
}

/// One registry entry
#[derive(Debug)]
pub struct TunnelRecord {
    target: TunnelTarget,
    id: TunnelIdentity,
    seq: u64,
    cancel: CancellationToken,
    stop: StopSignal,
    finished: CancellationToken,
    log_capacity: usize,
    state: Mutex<RecordState>,
}

/// Point-in-time copy of a record, safe to hand to presentation code
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelSnapshot {
    pub id: TunnelIdentity,
    pub target: TunnelTarget,
    pub status: TunnelStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub backend_pod: Option<String>,
    pub resolved_port: Option<u16>,
    pub auto_reconnect: bool,
    pub reconnect_count: u32,
}

impl TunnelRecord {
    pub(crate) fn new(
        target: TunnelTarget,
        parent: &CancellationToken,
        seq: u64,
        log_capacity: usize,
        status: TunnelStatus,
    ) -> Self {
        let cancel = parent.child_token();
        let stop = StopSignal::new(&cancel);
        let now = Utc::now();
        Self {
            id: target.identity(),
            target,
            seq,
            stop,
            cancel,
            finished: CancellationToken::new(),
            log_capacity: log_capacity.max(1),
            state: Mutex::new(RecordState {
                status,
                error: None,
                started_at: now,
                stopped_at: (!status.is_live()).then_some(now),
                logs: VecDeque::with_capacity(log_capacity.min(DEFAULT_LOG_CAPACITY)),
                backend_pod: None,
                resolved_port: None,
                auto_reconnect: false,
                reconnect_count: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &TunnelIdentity {
        &self.id
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    /// Creation order within the owning manager
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn status(&self) -> TunnelStatus {
        self.state().status
    }

    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.state().stopped_at
    }

    pub fn backend(&self) -> Option<(String, u16)> {
        let state = self.state();
        state.backend_pod.clone().zip(state.resolved_port)
    }

    pub fn reconnect_count(&self) -> u32 {
        self.state().reconnect_count
    }

    /// Append a line to the log ring, evicting the oldest entry when full
    pub fn log(&self, message: impl AsRef<str>) {
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), message.as_ref());
        let mut state = self.state();
        if state.logs.len() >= self.log_capacity {
            state.logs.pop_front();
        }
        state.logs.push_back(line);
    }

    pub fn logs(&self) -> Vec<String> {
        self.state().logs.iter().cloned().collect()
    }

    pub fn log_handle(self: &Arc<Self>) -> LogHandle {
        LogHandle(Arc::downgrade(self))
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let state = self.state();
        let end = state.stopped_at.unwrap_or_else(Utc::now);
        TunnelSnapshot {
            id: self.id.clone(),
            target: self.target.clone(),
            status: state.status,
            error: state.error.clone(),
            started_at: state.started_at,
            stopped_at: state.stopped_at,
            duration: (end - state.started_at).to_std().unwrap_or_default(),
            backend_pod: state.backend_pod.clone(),
            resolved_port: state.resolved_port,
            auto_reconnect: state.auto_reconnect,
            reconnect_count: state.reconnect_count,
        }
    }

    /// Compare-and-set on the status field. Returns whether the write happened.
    pub(crate) fn transition(&self, from: &[TunnelStatus], to: TunnelStatus) -> bool {
        let mut state = self.state();
        if !from.contains(&state.status) {
            return false;
        }
        state.status = to;
        if !to.is_live() && state.stopped_at.is_none() {
            state.stopped_at = Some(Utc::now());
        }
        true
    }

    pub(crate) fn mark_active(&self) -> bool {
        self.transition(&[TunnelStatus::Starting], TunnelStatus::Active)
    }

    /// Move a live record to Stopped. No-op for terminal records.
    pub(crate) fn mark_stopped(&self) -> bool {
        self.transition(
            &[
                TunnelStatus::Starting,
                TunnelStatus::Active,
                TunnelStatus::Reconnecting,
            ],
            TunnelStatus::Stopped,
        )
    }

    /// Record a failure unless the tunnel already left its live states
    pub(crate) fn fail(&self, err: &ForwardError) -> bool {
        let mut state = self.state();
        if !state.status.is_live() {
            return false;
        }
        state.status = TunnelStatus::Error;
        state.error = Some(err.to_string());
        state.stopped_at = Some(Utc::now());
        true
    }

    pub(crate) fn set_backend(&self, pod: &str, port: u16) {
        let mut state = self.state();
        state.backend_pod = Some(pod.to_string());
        state.resolved_port = Some(port);
    }

    pub(crate) fn set_reconnect_count(&self, count: u32) {
        self.state().reconnect_count = count;
    }

    /// Cancel the worker's context and close the stop signal
    pub(crate) fn cancel_worker(&self) {
        self.cancel.cancel();
        self.stop.close();
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once the worker task for this record has exited
    pub(crate) async fn finished(&self) {
        self.finished.cancelled().await
    }
}

/// Weak handle that lets tunnel implementations append to a record's log
#[derive(Debug, Clone)]
pub struct LogHandle(Weak<TunnelRecord>);

impl LogHandle {
    pub fn log(&self, message: impl AsRef<str>) {
        if let Some(record) = self.0.upgrade() {
            record.log(message);
        }
    }

    /// A handle that discards everything
    pub fn noop() -> Self {
        LogHandle(Weak::new())
    }
}
