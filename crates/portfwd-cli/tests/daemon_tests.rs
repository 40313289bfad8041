#![cfg(unix)]

use portfwd_cli::daemon::Daemon;
use portfwd_cli::ipc::{IpcClient, IpcServer, MAX_LINE_LENGTH};
use portfwd_cli::protocol::{AddRequest, Command, ConnectionInfo, IpcRequest, StatusInfo};
use portfwd_core::testing::{pod, service, FakeInventory, FakeOpener};
use portfwd_core::{
    ForwardManager, ManagerConfig, PodPhase, ResourceKind, SessionStore, TargetPort,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

struct TestDaemon {
    _temp: TempDir,
    socket: PathBuf,
    state: PathBuf,
    daemon: Arc<Daemon>,
    serve: JoinHandle<()>,
}

async fn start_daemon() -> TestDaemon {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("portfwd.sock");
    let state = temp.path().join("state.yaml");

    let inventory = Arc::new(FakeInventory::new());
    inventory.add_pod(pod("prod", "pg-0", PodPhase::Running, &[("app", "pg")]));
    inventory.add_pod(pod("prod", "web-0", PodPhase::Running, &[("app", "web")]));
    inventory.add_service(service(
        "prod",
        "postgres",
        &[("app", "pg")],
        5432,
        Some(TargetPort::Number(5432)),
    ));
    inventory.add_service(service(
        "prod",
        "web",
        &[("app", "web")],
        80,
        Some(TargetPort::Name("http".to_string())),
    ));

    let config = ManagerConfig {
        start_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_millis(200),
        stop_ack_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let manager = ForwardManager::with_config(inventory, Arc::new(FakeOpener::new()), config);
    let daemon = Arc::new(Daemon::new(manager, SessionStore::new(&state)));

    let server = IpcServer::bind(&socket).await.unwrap();
    let serve = tokio::spawn(daemon.clone().serve(server));

    TestDaemon {
        _temp: temp,
        socket,
        state,
        daemon,
        serve,
    }
}

fn add(name: &str, local: u16, remote: u16) -> Command {
    Command::Add(AddRequest {
        namespace: "prod".to_string(),
        resource_type: ResourceKind::Service,
        resource_name: name.to_string(),
        local_port: local,
        remote_port: remote,
    })
}

#[tokio::test]
async fn test_add_list_stop_remove() {
    let daemon = start_daemon().await;
    let mut client = IpcClient::connect(&daemon.socket).await.unwrap();

    let response = client.send(&add("postgres", 5432, 5432)).await.unwrap();
    assert!(response.success, "{:?}", response.error);
    let info: ConnectionInfo = response.data_as().unwrap();
    assert_eq!(info.id, "prod/svc/postgres:5432->5432");
    assert_eq!(info.status, "active");

    let response = client.send(&Command::List).await.unwrap();
    let list: Vec<ConnectionInfo> = response.data_as().unwrap();
    assert_eq!(list.len(), 1);

    let id = info.id.clone();
    let response = client.send(&Command::Remove { id: id.clone() }).await.unwrap();
    assert!(!response.success, "live record must not be removable");

    let response = client.send(&Command::Stop { id: id.clone() }).await.unwrap();
    assert!(response.success);
    let response = client.send(&Command::Stop { id: id.clone() }).await.unwrap();
    assert!(response.success, "second stop is a no-op");

    let list: Vec<ConnectionInfo> = client.send(&Command::List).await.unwrap().data_as().unwrap();
    assert_eq!(list[0].status, "stopped");

    let response = client.send(&Command::Remove { id }).await.unwrap();
    assert!(response.success);
    let list: Vec<ConnectionInfo> = client.send(&Command::List).await.unwrap().data_as().unwrap();
    assert!(list.is_empty());

    let session = SessionStore::new(&daemon.state).load().unwrap();
    assert!(session.connections.is_empty());
    assert!(session.last_saved.is_some());

    daemon.daemon.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_add_rejected() {
    let daemon = start_daemon().await;
    let mut client = IpcClient::connect(&daemon.socket).await.unwrap();

    assert!(client.send(&add("postgres", 5432, 5432)).await.unwrap().success);
    let response = client.send(&add("postgres", 5432, 5432)).await.unwrap();
    assert!(!response.success);
    assert!(response.error.unwrap().contains("already active"));

    let list: Vec<ConnectionInfo> = client.send(&Command::List).await.unwrap().data_as().unwrap();
    assert_eq!(list.len(), 1);

    daemon.daemon.shutdown().await;
}

#[tokio::test]
async fn test_failed_add_is_listed_with_error() {
    let daemon = start_daemon().await;
    let mut client = IpcClient::connect(&daemon.socket).await.unwrap();

    let response = client.send(&add("missing", 7000, 7000)).await.unwrap();
    assert!(!response.success);

    let list: Vec<ConnectionInfo> = client.send(&Command::List).await.unwrap().data_as().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].status, "error");
    assert!(list[0].error.is_some());

    daemon.daemon.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_pid_and_connections() {
    let daemon = start_daemon().await;
    let mut client = IpcClient::connect(&daemon.socket).await.unwrap();

    client.send(&add("web", 8080, 80)).await.unwrap();
    let status: StatusInfo = client.send(&Command::Status).await.unwrap().data_as().unwrap();
    assert!(status.running);
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.connections.len(), 1);
    assert_eq!(status.connections[0].resource_name, "web");

    daemon.daemon.shutdown().await;
}

async fn exchange(stream: &mut BufReader<UnixStream>, line: &str) -> serde_json::Value {
    stream.get_mut().write_all(line.as_bytes()).await.unwrap();
    let mut reply = String::new();
    stream.read_line(&mut reply).await.unwrap();
    serde_json::from_str(&reply).unwrap()
}

#[tokio::test]
async fn test_bad_lines_keep_connection_open() {
    let daemon = start_daemon().await;
    let stream = UnixStream::connect(&daemon.socket).await.unwrap();
    let mut stream = BufReader::new(stream);

    let reply = exchange(&mut stream, "this is not json\n").await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().starts_with("invalid request"));

    let reply = exchange(&mut stream, "{\"command\":\"teleport\",\"payload\":null}\n").await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("teleport"));

    let reply = exchange(&mut stream, "{\"command\":\"list\",\"payload\":null}\n").await;
    assert_eq!(reply["success"], true);
    assert!(reply["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_oversized_request_is_rejected() {
    let daemon = start_daemon().await;
    let stream = UnixStream::connect(&daemon.socket).await.unwrap();
    let mut stream = BufReader::new(stream);

    let mut huge = "x".repeat(MAX_LINE_LENGTH + 1);
    huge.push('\n');
    let reply = exchange(&mut stream, &huge).await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("exceeds"));

    let reply = exchange(&mut stream, "{\"command\":\"list\",\"payload\":null}\n").await;
    assert_eq!(reply["success"], true);
}

#[tokio::test]
async fn test_concurrent_clients() {
    let daemon = start_daemon().await;

    let mut handles = Vec::new();
    for port in 9000..9005u16 {
        let socket = daemon.socket.clone();
        handles.push(tokio::spawn(async move {
            let mut client = IpcClient::connect(&socket).await.unwrap();
            client.send(&add("postgres", port, 5432)).await.unwrap()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    assert_eq!(daemon.daemon.manager().list_active().len(), 5);
    daemon.daemon.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_replies_then_stops_serving() {
    let daemon = start_daemon().await;
    let mut client = IpcClient::connect(&daemon.socket).await.unwrap();

    let request = IpcRequest::from_command(&Command::Shutdown);
    let response = client.request(&request).await.unwrap();
    assert!(response.success);

    tokio::time::timeout(Duration::from_secs(2), daemon.serve)
        .await
        .expect("server should stop after shutdown")
        .unwrap();
    assert!(!daemon.socket.exists(), "socket removed when the server drops");
}
