//! Per-user application paths
//!
//! Everything lives under one directory, `<config dir>/portfwd` by default.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable overriding the application directory
pub const CONFIG_DIR_ENV: &str = "PORTFWD_CONFIG_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    dir: PathBuf,
}

impl AppPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Use `dir` if given, otherwise the platform config directory
    pub fn resolve(dir: Option<PathBuf>) -> Result<Self> {
        match dir {
            Some(dir) => Ok(Self::new(dir)),
            None => {
                let base = dirs::config_dir().context("Could not determine config directory")?;
                Ok(Self::new(base.join("portfwd")))
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saved session
    pub fn state_file(&self) -> PathBuf {
        self.dir.join("state.yaml")
    }

    /// Saved profiles
    pub fn config_file(&self) -> PathBuf {
        self.dir.join("config.yaml")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("portfwd.pid")
    }

    /// Control socket on Unix; on Windows a file holding the control port
    pub fn socket_path(&self) -> PathBuf {
        #[cfg(unix)]
        {
            self.dir.join("portfwd.sock")
        }
        #[cfg(not(unix))]
        {
            self.dir.join("portfwd.port")
        }
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.dir.join("daemon.log")
    }

    pub fn debug_log(&self) -> PathBuf {
        self.dir.join("debug.log")
    }

    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory {:?}", self.dir))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to set permissions on {:?}", self.dir))?;
        }
        Ok(())
    }
}
