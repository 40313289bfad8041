//! Tunnel worker: drives one record from Starting to a terminal state

use crate::error::ForwardError;
use crate::identity::ResourceKind;
use crate::inventory::Inventory;
use crate::manager::ChangeNotifier;
use crate::record::TunnelRecord;
use crate::resolver::{self, PortSource};
use crate::tunnel::{OpenedTunnel, TunnelOpener, TunnelSpec};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub(crate) struct WorkerContext {
    pub record: Arc<TunnelRecord>,
    pub inventory: Arc<dyn Inventory>,
    pub opener: Arc<dyn TunnelOpener>,
    pub notifier: ChangeNotifier,
    /// Fired once the record is Active
    pub ready: oneshot::Sender<()>,
    /// How long to wait for the tunnel to wind down after a stop
    pub stop_ack_timeout: Duration,
}

/// Run a worker to completion and mark its record finished
pub(crate) async fn run(ctx: WorkerContext) -> Result<(), ForwardError> {
    let record = ctx.record.clone();
    let result = drive(ctx).await;
    record.mark_finished();
    debug!(id = %record.identity(), "Worker exited");
    result
}

async fn drive(ctx: WorkerContext) -> Result<(), ForwardError> {
    let WorkerContext {
        record,
        inventory,
        opener,
        notifier,
        ready,
        stop_ack_timeout,
    } = ctx;

    let id = record.identity().clone();
    let target = record.target().clone();
    let stop = record.stop_signal().clone();

    record.log(format!(
        "Resolving {} {}/{}",
        target.kind, target.namespace, target.name
    ));

    let resolved = tokio::select! {
        biased;
        _ = stop.closed() => {
            record.log("Cancelled while resolving target");
            record.mark_stopped();
            return Err(ForwardError::Cancelled(id.to_string()));
        }
        resolved = resolver::resolve(inventory.as_ref(), &target) => resolved,
    };
    let endpoint = resolved.map_err(|err| fail(&record, &notifier, err))?;

    match &endpoint.source {
        PortSource::NamedPort(name) => {
            record.log(format!("Resolved named port {} to {}", name, endpoint.port));
        }
        PortSource::Fallback(reason) => {
            warn!(id = %id, port = endpoint.port, "{}, using declared port", reason);
            record.log(format!("{}, using declared port {}", reason, endpoint.port));
        }
        PortSource::Declared | PortSource::TargetPort => {}
    }
    if target.kind == ResourceKind::Service {
        record.log(format!("Selected backend pod {}", endpoint.pod));
    }
    record.set_backend(&endpoint.pod, endpoint.port);
    record.log(format!(
        "Forwarding 127.0.0.1:{} -> {}:{}",
        target.local_port, endpoint.pod, endpoint.port
    ));

    let spec = TunnelSpec {
        namespace: target.namespace.clone(),
        pod: endpoint.pod.clone(),
        bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, target.local_port)),
        remote_port: endpoint.port,
        log: record.log_handle(),
    };

    let opened = tokio::select! {
        biased;
        _ = stop.closed() => {
            record.log("Cancelled while opening tunnel");
            record.mark_stopped();
            return Err(ForwardError::Cancelled(id.to_string()));
        }
        opened = opener.open(spec, stop.clone()) => opened,
    };
    let OpenedTunnel {
        ready: mut tunnel_ready,
        exit: mut tunnel_exit,
    } = opened.map_err(|err| fail(&record, &notifier, err))?;

    // Starting: whichever of stop, readiness or early exit fires first wins
    tokio::select! {
        biased;
        _ = stop.closed() => {
            record.log(if stop.is_closed() {
                "Stop requested during startup"
            } else {
                "Shutting down during startup"
            });
            wait_for_exit(&mut tunnel_exit, stop_ack_timeout).await;
            if record.mark_stopped() {
                notifier.notify();
            }
            return Err(ForwardError::Cancelled(id.to_string()));
        }
        signalled = &mut tunnel_ready => {
            if signalled.is_err() {
                let err = exit_outcome((&mut tunnel_exit).await)
                    .err()
                    .unwrap_or_else(closed_before_ready);
                return Err(fail(&record, &notifier, err));
            }
        }
        exited = &mut tunnel_exit => {
            let err = exit_outcome(exited).err().unwrap_or_else(closed_before_ready);
            return Err(fail(&record, &notifier, err));
        }
    }

    if !record.mark_active() {
        // Stopped between readiness and now
        wait_for_exit(&mut tunnel_exit, stop_ack_timeout).await;
        return Err(ForwardError::Cancelled(id.to_string()));
    }
    record.log("✓ Port-forward ready");
    info!(
        id = %id,
        pod = %endpoint.pod,
        port = endpoint.port,
        "Port-forward active"
    );
    notifier.notify();
    let _ = ready.send(());

    // Active: run until the tunnel fails or a stop/shutdown arrives
    tokio::select! {
        biased;
        exited = &mut tunnel_exit => match exit_outcome(exited) {
            Ok(()) => {
                if record.mark_stopped() {
                    record.log("Tunnel closed");
                    notifier.notify();
                }
                Ok(())
            }
            Err(err) => Err(fail(&record, &notifier, err)),
        },
        _ = stop.closed() => {
            record.log(if stop.is_closed() {
                "Stop signal received"
            } else {
                "Shutting down"
            });
            if !wait_for_exit(&mut tunnel_exit, stop_ack_timeout).await {
                warn!(id = %id, "Tunnel did not acknowledge stop within {:?}", stop_ack_timeout);
                record.log("Tunnel did not acknowledge stop");
            }
            if record.mark_stopped() {
                notifier.notify();
            }
            Ok(())
        }
    }
}

/// Record a failure on the record and hand the error back
fn fail(record: &TunnelRecord, notifier: &ChangeNotifier, err: ForwardError) -> ForwardError {
    record.log(format!("✗ {}", err));
    if record.fail(&err) {
        warn!(id = %record.identity(), error = %err, "Port-forward failed");
        notifier.notify();
    }
    err
}

fn exit_outcome(
    exited: Result<Result<(), ForwardError>, oneshot::error::RecvError>,
) -> Result<(), ForwardError> {
    exited.unwrap_or_else(|_| {
        Err(ForwardError::Transport(
            "tunnel exited without reporting a result".to_string(),
        ))
    })
}

fn closed_before_ready() -> ForwardError {
    ForwardError::Transport("tunnel closed before becoming ready".to_string())
}

async fn wait_for_exit(
    exit: &mut oneshot::Receiver<Result<(), ForwardError>>,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, exit).await.is_ok()
}
