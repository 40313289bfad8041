//! Terminal rendering of connection listings

use crate::protocol::ConnectionInfo;

fn status_cell(info: &ConnectionInfo) -> String {
    let icon = match info.status.as_str() {
        "starting" => "◌",
        "active" => "●",
        "error" => "✗",
        "reconnecting" => "↻",
        _ => "○",
    };
    match &info.error {
        Some(error) => format!("{} {}: {}", icon, info.status, error),
        None => format!("{} {}", icon, info.status),
    }
}

/// Table rows, header first
pub fn connection_rows(connections: &[ConnectionInfo]) -> Vec<String> {
    let mut rows = vec![format!(
        "{:<44} {:<8} {:<10} STATUS",
        "ID", "LOCAL", "DURATION"
    )];
    for info in connections {
        rows.push(format!(
            "{:<44} {:<8} {:<10} {}",
            info.id,
            format!(":{}", info.local_port),
            info.duration,
            status_cell(info)
        ));
    }
    rows
}

pub fn print_connection_table(connections: &[ConnectionInfo]) {
    if connections.is_empty() {
        println!("No connections.");
        return;
    }
    for row in connection_rows(connections) {
        println!("{}", row);
    }
}
