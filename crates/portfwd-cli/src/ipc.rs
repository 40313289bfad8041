//! Daemon control channel
//!
//! Unix domain socket on Unix platforms. On Windows the daemon listens on a
//! loopback TCP port and writes the port number to the socket path instead.

use crate::protocol::{Command, IpcRequest, IpcResponse};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

#[cfg(unix)]
use tokio::net::{UnixListener as Listener, UnixStream as Stream};

#[cfg(windows)]
use tokio::net::{TcpListener as Listener, TcpStream as Stream};

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("daemon is not running (no listener at {path:?})")]
    NotConnected {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("daemon closed the connection")]
    Closed,

    #[error("invalid daemon response: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("message exceeds {} bytes", MAX_LINE_LENGTH)]
    LineTooLong,
}

impl From<LinesCodecError> for IpcError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => IpcError::LineTooLong,
            LinesCodecError::Io(e) => IpcError::Io(e),
        }
    }
}

/// Longest request or response line either side will buffer
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

type Lines = Framed<Stream, LinesCodec>;

fn framed(stream: Stream) -> Lines {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

async fn write_line<T: serde::Serialize>(lines: &mut Lines, value: &T) -> Result<(), IpcError> {
    let json = serde_json::to_string(value)?;
    lines.send(json).await?;
    Ok(())
}

#[cfg(unix)]
async fn connect_stream(path: &Path) -> std::io::Result<Stream> {
    Stream::connect(path).await
}

#[cfg(windows)]
async fn connect_stream(path: &Path) -> std::io::Result<Stream> {
    let port: u16 = std::fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid port file"))?;
    Stream::connect(("127.0.0.1", port)).await
}

/// Returns true if something answers on the control channel
pub async fn is_daemon_running(path: &Path) -> bool {
    connect_stream(path).await.is_ok()
}

/// CLI side of the control channel
pub struct IpcClient {
    lines: Lines,
}

impl IpcClient {
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = connect_stream(path)
            .await
            .map_err(|source| IpcError::NotConnected {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            lines: framed(stream),
        })
    }

    /// Send one request and wait for its response
    pub async fn request(&mut self, req: &IpcRequest) -> Result<IpcResponse, IpcError> {
        write_line(&mut self.lines, req).await?;

        let line = self.lines.next().await.ok_or(IpcError::Closed)??;
        Ok(serde_json::from_str(&line)?)
    }

    pub async fn send(&mut self, command: &Command) -> Result<IpcResponse, IpcError> {
        self.request(&IpcRequest::from_command(command)).await
    }
}

/// Daemon side of the control channel
pub struct IpcServer {
    listener: Listener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the control channel, replacing a stale socket left by a dead daemon
    pub async fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            if connect_stream(path).await.is_ok() {
                anyhow::bail!("Another daemon is already running (socket at {:?} is active)", path);
            }
            tracing::debug!(path = %path.display(), "Removing stale socket");
            std::fs::remove_file(path)?;
        }

        let listener = Self::listen(path).await?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    #[cfg(unix)]
    async fn listen(path: &Path) -> Result<Listener> {
        use std::os::unix::fs::PermissionsExt;

        let listener = Listener::bind(path)
            .with_context(|| format!("Failed to bind to socket at {:?}", path))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
        Ok(listener)
    }

    #[cfg(windows)]
    async fn listen(path: &Path) -> Result<Listener> {
        let listener = Listener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind control port")?;
        let port = listener.local_addr()?.port();
        std::fs::write(path, port.to_string())
            .with_context(|| format!("Failed to write port file {:?}", path))?;
        Ok(listener)
    }

    pub async fn accept(&self) -> std::io::Result<IpcConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection {
            lines: framed(stream),
            after_error: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// One accepted client connection
pub struct IpcConnection {
    lines: Lines,
    after_error: bool,
}

impl IpcConnection {
    /// Read the next request line, `None` once the client hangs up
    ///
    /// An oversized line is discarded up to its newline and reported as
    /// [`IpcError::LineTooLong`]; the connection stays usable.
    pub async fn recv_line(&mut self) -> Result<Option<String>, IpcError> {
        loop {
            match self.lines.next().await {
                Some(Ok(line)) => return Ok(Some(line)),
                Some(Err(e)) => {
                    self.after_error = true;
                    return Err(e.into());
                }
                // Framed yields a single None after a decode error, then resumes
                None if std::mem::take(&mut self.after_error) => continue,
                None => return Ok(None),
            }
        }
    }

    pub async fn send(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        write_line(&mut self.lines, response).await
    }
}
