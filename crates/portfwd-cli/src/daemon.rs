//! Background daemon hosting the tunnel registry
//!
//! The daemon owns one [`ForwardManager`] for its whole lifetime and exposes
//! it over the IPC socket. The session file is rewritten after every mutating
//! command and once more before shutdown tears tunnels down.

use crate::ipc::{is_daemon_running, IpcClient, IpcConnection, IpcError, IpcServer, MAX_LINE_LENGTH};
use crate::paths::AppPaths;
use crate::protocol::{
    format_duration, Command, ConnectionInfo, IpcRequest, IpcResponse, RequestError, StatusInfo,
};
use anyhow::{Context, Result};
use portfwd_core::{restore, ForwardManager, ResourceKind, RestoreReport, SessionStore};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between answering `shutdown` and acting on it
const SHUTDOWN_REPLY_DELAY: Duration = Duration::from_millis(100);

pub struct Daemon {
    manager: ForwardManager,
    sessions: SessionStore,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(manager: ForwardManager, sessions: SessionStore) -> Self {
        Self {
            manager,
            sessions,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn manager(&self) -> &ForwardManager {
        &self.manager
    }

    /// Cancelled once the daemon should exit
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Load the saved session and bring its tunnels back
    pub async fn restore_session(&self) -> RestoreReport {
        let session = match self.sessions.load() {
            Ok(session) => session,
            Err(e) => {
                warn!("Ignoring unreadable session: {}", e);
                return RestoreReport::default();
            }
        };
        restore(&self.manager, &session).await
    }

    fn save_session(&self) {
        if let Err(e) = self.sessions.save_manager(&self.manager) {
            warn!("Failed to save session: {}", e);
        }
    }

    /// Decode and execute one request line
    pub async fn handle_line(&self, line: &str) -> IpcResponse {
        match IpcRequest::parse(line).and_then(IpcRequest::into_command) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                debug!("Rejected request: {}", e);
                IpcResponse::error(e.to_string())
            }
        }
    }

    pub async fn handle(&self, command: Command) -> IpcResponse {
        debug!(command = command.name(), "IPC command");
        match command {
            Command::Add(req) => {
                let target = req.target();
                match self.manager.start(target).await {
                    Ok(record) => {
                        self.save_session();
                        IpcResponse::ok_with(&ConnectionInfo::from(&record.snapshot()))
                    }
                    Err(e) => IpcResponse::error(e.to_string()),
                }
            }
            Command::Remove { id } => match self.manager.delete(&id) {
                Ok(()) => {
                    self.save_session();
                    IpcResponse::ok(format!("Removed {}", id))
                }
                Err(e) => IpcResponse::error(e.to_string()),
            },
            Command::Stop { id } => match self.manager.stop(&id) {
                Ok(()) => {
                    self.save_session();
                    IpcResponse::ok(format!("Stopped {}", id))
                }
                Err(e) => IpcResponse::error(e.to_string()),
            },
            Command::List => IpcResponse::ok_with(&self.connections()),
            Command::Status => IpcResponse::ok_with(&StatusInfo {
                running: true,
                pid: std::process::id(),
                uptime: format_duration(self.started_at.elapsed().as_secs()),
                connections: self.connections(),
            }),
            Command::Shutdown => {
                let token = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SHUTDOWN_REPLY_DELAY).await;
                    token.cancel();
                });
                IpcResponse::ok("Daemon shutting down")
            }
        }
    }

    fn connections(&self) -> Vec<ConnectionInfo> {
        self.manager.snapshots().iter().map(ConnectionInfo::from).collect()
    }

    /// Accept clients until shutdown, one task per connection
    pub async fn serve(self: Arc<Self>, server: IpcServer) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = server.accept() => match accepted {
                    Ok(conn) => {
                        tokio::spawn(self.clone().serve_connection(conn));
                    }
                    Err(e) => {
                        error!("IPC accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("IPC server stopped");
    }

    async fn serve_connection(self: Arc<Self>, mut conn: IpcConnection) {
        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                line = conn.recv_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(IpcError::LineTooLong) => {
                    let err = RequestError::Malformed(format!(
                        "message exceeds {} bytes",
                        MAX_LINE_LENGTH
                    ));
                    warn!("Rejected oversized IPC request");
                    if conn.send(&IpcResponse::error(err.to_string())).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("IPC recv error: {}", e);
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = self.handle_line(&line).await;
            if let Err(e) = conn.send(&response).await {
                warn!("IPC send error: {}", e);
                return;
            }
        }
    }

    /// Persist the session, then stop every tunnel
    pub async fn shutdown(&self) {
        // Save first: stop_all flips every record to stopped
        self.save_session();
        self.manager.stop_all().await;
    }
}

/// Run the daemon in the current process until it is told to stop
pub async fn run(paths: &AppPaths, manager: ForwardManager) -> Result<()> {
    info!("🚀 Daemon starting...");
    paths.ensure_dir()?;

    let server = IpcServer::bind(&paths.socket_path()).await?;
    info!("IPC server listening at {:?}", server.path());

    let pid_file = paths.pid_file();
    std::fs::write(&pid_file, std::process::id().to_string())
        .with_context(|| format!("Failed to write PID file {:?}", pid_file))?;

    let daemon = Arc::new(Daemon::new(manager, SessionStore::new(paths.state_file())));

    let report = daemon.restore_session().await;
    info!(
        started = report.started.len(),
        placeholders = report.placeholders.len(),
        "Session restored"
    );

    let weak = Arc::downgrade(&daemon);
    daemon.manager().set_on_change(move || {
        if let Some(daemon) = weak.upgrade() {
            let manager = daemon.manager();
            debug!(
                pods = manager.count_by_kind(ResourceKind::Pod),
                services = manager.count_by_kind(ResourceKind::Service),
                "Connections changed"
            );
        }
    });

    let serve_task = tokio::spawn(daemon.clone().serve(server));

    info!("✅ Daemon ready");
    wait_for_shutdown(&daemon.shutdown_token()).await;
    info!("Shutting down daemon...");

    daemon.shutdown_token().cancel();
    daemon.shutdown().await;

    // Dropping the server removes the socket
    if let Err(e) = serve_task.await {
        warn!("IPC server task failed: {}", e);
    }
    if let Err(e) = std::fs::remove_file(&pid_file) {
        debug!("Failed to remove PID file: {}", e);
    }

    info!("✅ Daemon stopped");
    Ok(())
}

/// Resolve on `token`, Ctrl+C or SIGTERM; SIGHUP is ignored
#[cfg(unix)]
pub async fn wait_for_shutdown(token: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(term), Ok(hup)) => (term, hup),
        _ => {
            warn!("Failed to install signal handlers, relying on ctrl-c");
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
            }
            return;
        }
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                return;
            }
            _ = term.recv() => {
                info!("SIGTERM received");
                return;
            }
            _ = hup.recv() => debug!("Ignoring SIGHUP"),
        }
    }
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown(token: &CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
    }
}

/// Re-launch this binary as a detached foreground daemon
pub async fn start_background(paths: &AppPaths, extra_args: &[String]) -> Result<u32> {
    if is_daemon_running(&paths.socket_path()).await {
        anyhow::bail!("Daemon is already running");
    }
    paths.ensure_dir()?;

    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.daemon_log())
        .with_context(|| format!("Failed to open {:?}", paths.daemon_log()))?;
    let log_err = log.try_clone()?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--config-dir")
        .arg(paths.dir())
        .args(extra_args)
        .args(["daemon", "start", "--foreground"])
        .stdin(std::process::Stdio::null())
        .stdout(log)
        .stderr(log_err);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().context("Failed to spawn daemon")?;
    let pid = child.id();

    tokio::time::sleep(Duration::from_secs(1)).await;
    if let Some(status) = child.try_wait()? {
        anyhow::bail!(
            "Daemon exited immediately ({}), see {:?}",
            status,
            paths.daemon_log()
        );
    }
    Ok(pid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The daemon accepted a shutdown request
    Requested,
    /// The socket was dead but the PID was alive and got SIGTERM
    Signalled(u32),
    NotRunning,
}

/// Ask the daemon to exit, falling back to a signal, then to stale cleanup
pub async fn stop_daemon(paths: &AppPaths) -> Result<StopOutcome> {
    let socket = paths.socket_path();
    if let Ok(mut client) = IpcClient::connect(&socket).await {
        let response = client.send(&Command::Shutdown).await?;
        if !response.success {
            anyhow::bail!(response.error.unwrap_or_else(|| "shutdown refused".to_string()));
        }
        return Ok(StopOutcome::Requested);
    }

    if let Some(pid) = read_pid(&paths.pid_file()) {
        if process_alive(pid) {
            terminate(pid)?;
            return Ok(StopOutcome::Signalled(pid));
        }
    }

    cleanup_stale(paths);
    Ok(StopOutcome::NotRunning)
}

/// Remove PID and socket files left by a dead daemon
pub fn cleanup_stale(paths: &AppPaths) {
    for path in [paths.pid_file(), paths.socket_path()] {
        if path.exists() {
            debug!(path = %path.display(), "Removing stale file");
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Read the daemon PID, rejecting values that `kill` treats as process groups
pub fn read_pid(path: &Path) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
    signal_target(pid).map(|_| pid)
}

/// Only positive values name a single process
fn signal_target(pid: u32) -> Option<i32> {
    i32::try_from(pid).ok().filter(|pid| *pid > 0)
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Some(target) = signal_target(pid) else {
        return false;
    };
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(target, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    let target = signal_target(pid).with_context(|| format!("Invalid daemon PID {}", pid))?;
    let rc = unsafe { libc::kill(target, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context(format!("Failed to signal {}", pid));
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<()> {
    anyhow::bail!("Cannot signal process {} on this platform", pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AddRequest;
    use portfwd_core::testing::{pod, service, FakeInventory, FakeOpener};
    use portfwd_core::{ManagerConfig, PodPhase, ResourceKind, TargetPort};
    use tempfile::TempDir;

    fn daemon(temp: &TempDir) -> Daemon {
        let inventory = Arc::new(FakeInventory::new());
        inventory.add_pod(pod("prod", "pg-0", PodPhase::Running, &[("app", "pg")]));
        inventory.add_service(service(
            "prod",
            "postgres",
            &[("app", "pg")],
            5432,
            Some(TargetPort::Number(5432)),
        ));
        let config = ManagerConfig {
            start_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(200),
            stop_ack_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let manager = ForwardManager::with_config(inventory, Arc::new(FakeOpener::new()), config);
        Daemon::new(manager, SessionStore::new(temp.path().join("state.yaml")))
    }

    fn add(name: &str, port: u16) -> Command {
        Command::Add(AddRequest {
            namespace: "prod".to_string(),
            resource_type: ResourceKind::Service,
            resource_name: name.to_string(),
            local_port: port,
            remote_port: 5432,
        })
    }

    #[tokio::test]
    async fn test_add_saves_session() {
        let temp = TempDir::new().unwrap();
        let daemon = daemon(&temp);

        let response = daemon.handle(add("postgres", 15432)).await;
        assert!(response.success, "{:?}", response.error);
        let info: ConnectionInfo = response.data_as().unwrap();
        assert_eq!(info.id, "prod/svc/postgres:15432->5432");
        assert_eq!(info.status, "active");

        let session = SessionStore::new(temp.path().join("state.yaml")).load().unwrap();
        assert_eq!(session.connections.len(), 1);
        assert!(session.connections[0].was_active);

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_live_is_rejected() {
        let temp = TempDir::new().unwrap();
        let daemon = daemon(&temp);
        daemon.handle(add("postgres", 15432)).await;

        let id = "prod/svc/postgres:15432->5432".to_string();
        let response = daemon.handle(Command::Remove { id: id.clone() }).await;
        assert!(!response.success);

        assert!(daemon.handle(Command::Stop { id: id.clone() }).await.success);
        assert!(daemon.handle(Command::Remove { id }).await.success);
        assert!(daemon.manager().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_identity() {
        let temp = TempDir::new().unwrap();
        let daemon = daemon(&temp);

        let response = daemon
            .handle(Command::Stop {
                id: "prod/svc/nope:1->1".to_string(),
            })
            .await;
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_replies_before_cancelling() {
        let temp = TempDir::new().unwrap();
        let daemon = daemon(&temp);
        let token = daemon.shutdown_token();

        let response = daemon.handle(Command::Shutdown).await;
        assert!(response.success);
        assert!(!token.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_saves_before_stopping() {
        let temp = TempDir::new().unwrap();
        let daemon = daemon(&temp);
        daemon.handle(add("postgres", 15432)).await;

        daemon.shutdown().await;

        let session = SessionStore::new(temp.path().join("state.yaml")).load().unwrap();
        assert!(session.connections[0].was_active);
        assert!(daemon.manager().list_active().is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_saved_session() {
        let temp = TempDir::new().unwrap();
        {
            let first = daemon(&temp);
            first.handle(add("postgres", 15432)).await;
            first.shutdown().await;
        }

        let second = daemon(&temp);
        let report = second.restore_session().await;
        assert_eq!(report.started.len(), 1);
        assert_eq!(second.manager().list_active().len(), 1);
        second.shutdown().await;
    }

    #[test]
    fn test_read_pid() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("portfwd.pid");
        assert_eq!(read_pid(&path), None);

        std::fs::write(&path, "1234\n").unwrap();
        assert_eq!(read_pid(&path), Some(1234));

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid(&path), None);
    }

    #[test]
    fn test_read_pid_rejects_group_targets() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("portfwd.pid");
        for contents in ["0", "4294967295", "2147483648"] {
            std::fs::write(&path, contents).unwrap();
            assert_eq!(read_pid(&path), None, "{}", contents);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_group_pids_are_never_alive() {
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
        assert!(terminate(0).is_err());
        assert!(terminate(u32::MAX).is_err());
    }

    #[tokio::test]
    async fn test_stop_with_zero_pid_file_signals_nothing() {
        let temp = TempDir::new().unwrap();
        let paths = AppPaths::new(temp.path());
        std::fs::write(paths.pid_file(), "0").unwrap();

        let outcome = stop_daemon(&paths).await.unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert!(!paths.pid_file().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_stop_without_daemon_cleans_stale_files() {
        let temp = TempDir::new().unwrap();
        let paths = AppPaths::new(temp.path());
        std::fs::write(paths.pid_file(), "999999999").unwrap();

        let outcome = stop_daemon(&paths).await.unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
        assert!(!paths.pid_file().exists());
    }
}
