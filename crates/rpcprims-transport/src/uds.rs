use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use futures_core::future::BoxFuture;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::dial::{Dialer, Listener};
use crate::error::{Result, TransportError};
use crate::stream::RpcStream;

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Unix domain socket listener.
///
/// Binds a filesystem-path socket, replacing a stale socket file left by a
/// previous run, and removes the path again on drop if it still refers to
/// the socket this listener created.
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    next_peer: std::sync::atomic::AtomicU64,
}

impl UnixAcceptor {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bind_err = |source: std::io::Error| TransportError::Bind {
            addr: path.display().to_string(),
            source,
        };

        let path_bytes = path.as_os_str().len();
        if path_bytes >= MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: MAX_PATH_LEN,
            });
        }

        // Remove stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            created_inode: Some((created.dev(), created.ino())),
            path,
            next_peer: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn accept_stream(&self) -> Result<RpcStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        let n = self
            .next_peer
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!(path = ?self.path, "accepted unix connection");
        Ok(RpcStream::from_unix(
            stream,
            format!("unix:{}#{n}", self.path.display()),
        ))
    }
}

impl Listener for UnixAcceptor {
    fn accept(&self) -> BoxFuture<'_, Result<RpcStream>> {
        Box::pin(self.accept_stream())
    }

    fn describe(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(
                    path = ?self.path,
                    "socket path identity changed; skipping cleanup"
                );
            }
        }
    }
}

/// Dials a filesystem-path Unix domain socket.
#[derive(Debug, Clone)]
pub struct UnixDialer {
    path: PathBuf,
}

impl UnixDialer {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn connect(&self) -> Result<RpcStream> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| TransportError::Connect {
                addr: self.path.display().to_string(),
                source,
            })?;
        debug!(path = ?self.path, "connected to unix domain socket");
        Ok(RpcStream::from_unix(
            stream,
            format!("unix:{}", self.path.display()),
        ))
    }
}

impl Dialer for UnixDialer {
    fn dial(&self) -> BoxFuture<'_, Result<RpcStream>> {
        Box::pin(self.connect())
    }

    fn describe(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}
