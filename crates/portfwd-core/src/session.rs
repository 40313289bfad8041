//! Session persistence
//!
//! The session file records every known tunnel and whether it was active, so
//! the next process can bring active ones back and show the rest as stopped.

use crate::identity::{ResourceKind, TunnelIdentity, TunnelTarget};
use crate::manager::ForwardManager;
use crate::resolver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to access session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse session file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// One persisted tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConnection {
    pub namespace: String,
    pub resource_type: ResourceKind,
    pub resource_name: String,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default)]
    pub was_active: bool,
}

impl SavedConnection {
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

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connections: Vec<SavedConnection>,
}

/// YAML-backed session file
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the session, or an empty one if no file exists yet
    pub fn load(&self) -> Result<PersistedSession, SessionError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedSession::default())
            }
            Err(source) => return Err(self.io_error(source)),
        };

        if content.trim().is_empty() {
            return Ok(PersistedSession::default());
        }

        serde_yaml::from_str(&content).map_err(|source| SessionError::Yaml {
            path: self.path.clone(),
            source,
        })
    }

    /// Overwrite the file with `connections` and a fresh timestamp
    pub fn save(&self, connections: Vec<SavedConnection>) -> Result<PersistedSession, SessionError> {
        let session = PersistedSession {
            last_saved: Some(Utc::now()),
            connections,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let content = serde_yaml::to_string(&session).map_err(|source| SessionError::Yaml {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp, content).map_err(|source| self.io_error(source))?;
        std::fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))?;

        debug!(
            path = %self.path.display(),
            connections = session.connections.len(),
            "Session saved"
        );
        Ok(session)
    }

    /// Persist the manager's current registry
    ///
    /// Call this before `stop_all`, which would otherwise record every tunnel
    /// as inactive.
    pub fn save_manager(&self, manager: &ForwardManager) -> Result<PersistedSession, SessionError> {
        self.save(manager.for_save())
    }

    fn io_error(&self, source: std::io::Error) -> SessionError {
        SessionError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Outcome of a restore pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub started: Vec<TunnelIdentity>,
    pub placeholders: Vec<TunnelIdentity>,
}

/// Seed a manager from a saved session
///
/// Entries that were active are probed and restarted; everything else, and
/// every entry that cannot be restarted, comes back as a stopped placeholder.
/// Never fails as a whole.
pub async fn restore(manager: &ForwardManager, session: &PersistedSession) -> RestoreReport {
    let mut report = RestoreReport::default();

    for saved in &session.connections {
        let target = saved.target();
        let id = target.identity();

        if !saved.was_active {
            manager.add_placeholder(target);
            report.placeholders.push(id);
            continue;
        }

        if let Err(err) = resolver::probe(manager.inventory().as_ref(), &target).await {
            info!(id = %id, error = %err, "Saved target unavailable, restoring as stopped");
            manager.add_placeholder(target);
            report.placeholders.push(id);
            continue;
        }

        match manager.start(target.clone()).await {
            Ok(_) => {
                info!(id = %id, "Restored port-forward");
                report.started.push(id);
            }
            Err(err) => {
                warn!(id = %id, error = %err, "Failed to restore port-forward");
                if let Err(err) = manager.delete(id.as_str()) {
                    warn!(id = %id, error = %err, "Could not clear failed record");
                }
                manager.add_placeholder(target);
                report.placeholders.push(id);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{PodPhase, TargetPort};
    use crate::manager::ManagerConfig;
    use crate::record::TunnelStatus;
    use crate::testing::{pod, service, FakeInventory, FakeOpener, TunnelBehavior};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn saved(kind: ResourceKind, name: &str, local: u16, was_active: bool) -> SavedConnection {
        SavedConnection {
            namespace: "prod".to_string(),
            resource_type: kind,
            resource_name: name.to_string(),
            local_port: local,
            remote_port: 80,
            was_active,
        }
    }

    fn quick_config() -> ManagerConfig {
        ManagerConfig {
            start_timeout: Duration::from_millis(300),
            shutdown_grace: Duration::from_millis(200),
            stop_ack_timeout: Duration::from_millis(200),
            ..ManagerConfig::default()
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("state.yaml"));
        let session = store.load().unwrap();
        assert!(session.connections.is_empty());
        assert!(session.last_saved.is_none());
    }

    #[test]
    fn test_save_then_load_preserves_entries() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("nested").join("state.yaml"));
        let entries = vec![
            saved(ResourceKind::Service, "api", 8080, true),
            saved(ResourceKind::Pod, "worker-0", 9090, false),
            saved(ResourceKind::Service, "db", 5432, false),
        ];

        let written = store.save(entries.clone()).unwrap();
        let loaded = store.load().unwrap();

        let expected: HashSet<_> = entries.into_iter().collect();
        let actual: HashSet<_> = loaded.connections.iter().cloned().collect();
        assert_eq!(actual, expected);
        assert_eq!(loaded.last_saved, written.last_saved);
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("state.yaml"));
        store
            .save(vec![saved(ResourceKind::Service, "api", 8080, true)])
            .unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("lastSaved:"));
        assert!(content.contains("resourceType: service"));
        assert!(content.contains("resourceName: api"));
        assert!(content.contains("localPort: 8080"));
        assert!(content.contains("wasActive: true"));
    }

    #[test]
    fn test_load_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.yaml");
        std::fs::write(&path, "connections: [not: {valid").unwrap();

        let err = SessionStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SessionError::Yaml { .. }));
    }

    #[tokio::test]
    async fn test_save_manager_round_trip() {
        let inventory = Arc::new(FakeInventory::new());
        inventory.add_pod(pod("prod", "api-0", PodPhase::Running, &[("app", "api")]));
        let manager = ForwardManager::with_config(inventory, Arc::new(FakeOpener::new()), quick_config());
        manager.start_to_pod("prod", "api-0", 8080, 80).await.unwrap();
        manager.add_placeholder(TunnelTarget::pod("prod", "api-0", 8081, 80));

        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("state.yaml"));
        store.save_manager(&manager).unwrap();
        manager.stop_all().await;

        let loaded = store.load().unwrap();
        assert_eq!(loaded.connections.len(), 2);
        assert!(loaded.connections[0].was_active);
        assert!(!loaded.connections[1].was_active);
    }

    #[tokio::test]
    async fn test_restore_mixed_session() {
        let inventory = Arc::new(FakeInventory::new());
        let opener = Arc::new(FakeOpener::new());
        let manager = ForwardManager::with_config(inventory, opener.clone(), quick_config());

        let session = PersistedSession {
            last_saved: Some(Utc::now()),
            connections: vec![
                saved(ResourceKind::Pod, "deleted-pod", 8080, true),
                saved(ResourceKind::Service, "api", 9090, false),
            ],
        };

        let report = restore(&manager, &session).await;

        assert!(report.started.is_empty());
        assert_eq!(report.placeholders.len(), 2);
        assert_eq!(manager.len(), 2);
        for record in manager.list() {
            assert_eq!(record.status(), TunnelStatus::Stopped);
        }
        assert!(opener.opened().is_empty());
    }

    #[tokio::test]
    async fn test_restore_restarts_active_entries() {
        let inventory = Arc::new(FakeInventory::new());
        inventory.add_pod(pod("prod", "api-0", PodPhase::Running, &[("app", "api")]));
        inventory.add_service(service(
            "prod",
            "api",
            &[("app", "api")],
            80,
            Some(TargetPort::Name("http".into())),
        ));
        let manager =
            ForwardManager::with_config(inventory, Arc::new(FakeOpener::new()), quick_config());

        let session = PersistedSession {
            last_saved: None,
            connections: vec![saved(ResourceKind::Service, "api", 8080, true)],
        };
        let report = restore(&manager, &session).await;

        assert_eq!(report.started.len(), 1);
        let record = manager.get("prod/svc/api:8080->80").unwrap();
        assert_eq!(record.status(), TunnelStatus::Active);
        assert_eq!(record.backend(), Some(("api-0".to_string(), 8000)));
    }

    #[tokio::test]
    async fn test_restore_survives_start_failure() {
        let inventory = Arc::new(FakeInventory::new());
        inventory.add_pod(pod("prod", "api-0", PodPhase::Running, &[]));
        inventory.add_pod(pod("prod", "api-1", PodPhase::Running, &[]));
        let opener = Arc::new(FakeOpener::new());
        opener.set_behavior(TunnelBehavior::FailBeforeReady("address in use".into()));
        let manager = ForwardManager::with_config(inventory, opener, quick_config());

        let session = PersistedSession {
            last_saved: None,
            connections: vec![
                saved(ResourceKind::Pod, "api-0", 8080, true),
                saved(ResourceKind::Pod, "api-1", 8081, false),
            ],
        };
        let report = restore(&manager, &session).await;

        assert!(report.started.is_empty());
        assert_eq!(report.placeholders.len(), 2);
        assert_eq!(manager.len(), 2);
        for record in manager.list() {
            assert_eq!(record.status(), TunnelStatus::Stopped, "{}", record.identity());
            assert!(record.error().is_none());
        }
        let restored = manager.get("prod/pod/api-0:8080->80").unwrap();
        assert!(restored.logs().iter().any(|l| l.contains("Restored from previous session")));
    }
}
