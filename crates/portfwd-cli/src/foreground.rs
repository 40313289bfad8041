//! Running forwards in the current terminal

use crate::daemon::wait_for_shutdown;
use crate::protocol::format_duration;
use portfwd_core::{
    ForwardError, ForwardManager, TunnelIdentity, TunnelRecord, TunnelSnapshot, TunnelStatus,
    TunnelTarget,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{info, warn};

/// Result of one start attempt
pub struct StartOutcome {
    pub id: TunnelIdentity,
    pub result: Result<Arc<TunnelRecord>, ForwardError>,
}

/// Start each target in turn; failures do not stop the rest
pub async fn start_all(manager: &ForwardManager, targets: Vec<TunnelTarget>) -> Vec<StartOutcome> {
    let mut outcomes = Vec::with_capacity(targets.len());
    for target in targets {
        let id = target.identity();
        println!("Starting {}...", id);
        let result = manager.start(target).await;
        match &result {
            Ok(record) => {
                let via = record
                    .backend()
                    .map(|(pod, port)| format!(" via {}:{}", pod, port))
                    .unwrap_or_default();
                println!("✅ {} ready{}", id, via);
            }
            Err(e) => {
                eprintln!("❌ {}: {}", id, e);
                warn!(id = %id, error = %e, "Forward failed to start");
            }
        }
        outcomes.push(StartOutcome { id, result });
    }
    outcomes
}

/// Tracks the last seen status per identity and reports what moved
#[derive(Default)]
pub struct StatusWatcher {
    last: Mutex<HashMap<TunnelIdentity, TunnelStatus>>,
}

impl StatusWatcher {
    pub fn changes(&self, snapshots: &[TunnelSnapshot]) -> Vec<String> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let mut lines = Vec::new();
        for snap in snapshots {
            if last.insert(snap.id.clone(), snap.status) == Some(snap.status) {
                continue;
            }
            let line = match &snap.error {
                Some(error) => format!("{} {} {}: {}", snap.status.icon(), snap.id, snap.status, error),
                None => format!("{} {} {}", snap.status.icon(), snap.id, snap.status),
            };
            lines.push(line);
        }
        lines
    }
}

/// Print status transitions as the manager reports changes
pub fn print_transitions(manager: &ForwardManager) {
    let watcher = StatusWatcher::default();
    watcher.changes(&manager.snapshots());

    let observed = manager.downgrade();
    manager.set_on_change(move || {
        let Some(manager) = observed.upgrade() else {
            return;
        };
        for line in watcher.changes(&manager.snapshots()) {
            println!("{}", line);
        }
    });
}

/// Block until interrupted, then stop every forward
pub async fn run_until_interrupted(manager: &ForwardManager) {
    let started = Instant::now();
    println!("Press Ctrl+C to stop");

    wait_for_shutdown(manager.shutdown_token()).await;
    info!("Stopping {} forward(s)", manager.list_active().len());
    manager.stop_all().await;

    println!(
        "Stopped after {}",
        format_duration(started.elapsed().as_secs())
    );
}
