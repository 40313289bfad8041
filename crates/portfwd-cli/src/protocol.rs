//! IPC wire format shared by the daemon and the CLI
//!
//! One JSON object per line. Requests carry a command name and an optional
//! payload; responses carry a success flag plus a message, an error, or data.

use portfwd_core::{ResourceKind, TunnelSnapshot, TunnelTarget};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reasons a request line could not be turned into a [`Command`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Malformed(String),

    #[error("invalid request: unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid request: bad payload for '{command}': {reason}")]
    InvalidPayload { command: String, reason: String },
}

/// Payload of the `add` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRequest {
    pub namespace: String,
    pub resource_type: ResourceKind,
    pub resource_name: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl AddRequest {
    pub fn target(&self) -> TunnelTarget {
        TunnelTarget::new(
            self.namespace.clone(),
            self.resource_type,
            self.resource_name.clone(),
            self.local_port,
            self.remote_port,
        )
    }
}

impl From<&TunnelTarget> for AddRequest {
    fn from(target: &TunnelTarget) -> Self {
        Self {
            namespace: target.namespace.clone(),
            resource_type: target.kind,
            resource_name: target.name.clone(),
            local_port: target.local_port,
            remote_port: target.remote_port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IdPayload {
    id: String,
}

/// A decoded daemon command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(AddRequest),
    Remove { id: String },
    Stop { id: String },
    List,
    Status,
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Add(_) => "add",
            Command::Remove { .. } => "remove",
            Command::Stop { .. } => "stop",
            Command::List => "list",
            Command::Status => "status",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Request envelope: `{"command": "...", "payload": {...} | null}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    pub command: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl IpcRequest {
    pub fn from_command(command: &Command) -> Self {
        let payload = match command {
            Command::Add(req) => serde_json::to_value(req).ok(),
            Command::Remove { id } | Command::Stop { id } => {
                serde_json::to_value(IdPayload { id: id.clone() }).ok()
            }
            Command::List | Command::Status | Command::Shutdown => None,
        };
        Self {
            command: command.name().to_string(),
            payload,
        }
    }

    /// Parse one request line
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        serde_json::from_str(line.trim()).map_err(|e| RequestError::Malformed(e.to_string()))
    }

    pub fn into_command(self) -> Result<Command, RequestError> {
        match self.command.as_str() {
            "add" => Ok(Command::Add(payload_as(&self.command, self.payload)?)),
            "remove" => {
                let IdPayload { id } = payload_as(&self.command, self.payload)?;
                Ok(Command::Remove { id })
            }
            "stop" => {
                let IdPayload { id } = payload_as(&self.command, self.payload)?;
                Ok(Command::Stop { id })
            }
            "list" => Ok(Command::List),
            "status" => Ok(Command::Status),
            "shutdown" => Ok(Command::Shutdown),
            _ => Err(RequestError::UnknownCommand(self.command)),
        }
    }
}

fn payload_as<T: DeserializeOwned>(command: &str, payload: Option<Value>) -> Result<T, RequestError> {
    let invalid = |reason: String| RequestError::InvalidPayload {
        command: command.to_string(),
        reason,
    };
    let value = payload.ok_or_else(|| invalid("missing payload".to_string()))?;
    serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
}

/// Response envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn ok_with<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                ..Default::default()
            },
            Err(e) => Self::error(format!("failed to encode response: {}", e)),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Decode the `data` field
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }
}

/// Connection info as shown to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub namespace: String,
    pub resource_type: ResourceKind,
    pub resource_name: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: String,
}

impl From<&TunnelSnapshot> for ConnectionInfo {
    fn from(snapshot: &TunnelSnapshot) -> Self {
        Self {
            id: snapshot.id.to_string(),
            namespace: snapshot.target.namespace.clone(),
            resource_type: snapshot.target.kind,
            resource_name: snapshot.target.name.clone(),
            local_port: snapshot.target.local_port,
            remote_port: snapshot.target.remote_port,
            status: snapshot.status.to_string(),
            error: snapshot.error.clone(),
            duration: format_duration(snapshot.duration.as_secs()),
        }
    }
}

/// Payload of the `status` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub running: bool,
    pub pid: u32,
    pub uptime: String,
    pub connections: Vec<ConnectionInfo>,
}

/// Format seconds as `45s`, `3m 12s` or `2h 5m`
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
