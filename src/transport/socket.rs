//! Unix domain socket listener and connector.
//!
//! # Example
//!
//! ```ignore
//! use shmwire::transport::{generate_socket_path, SocketListener};
//!
//! let path = generate_socket_path(std::env::temp_dir());
//! let listener = SocketListener::bind(&path)?;
//! let stream = listener.accept().await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{UnixListener, UnixStream};

use crate::error::Result;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique socket path inside `dir`.
///
/// Format: `{dir}/shmwire-{pid}-{random}.sock`
pub fn generate_socket_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(format!(
        "shmwire-{}-{:x}.sock",
        std::process::id(),
        random_u64()
    ))
}

/// Cheap unique-ish u64 from the clock, the pid and a process counter.
pub(crate) fn random_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    (nanos ^ count.rotate_left(32)).wrapping_mul(0x517cc1b727220a95) ^ pid
}

/// Listening Unix socket. The socket file is removed on drop.
#[derive(Debug)]
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind to `path`, replacing a leftover socket file.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!(target: "shmwire::transport", path = %path.display(), "Listening");
        Ok(Self { listener, path })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to a listening socket.
pub async fn connect(path: impl AsRef<Path>) -> Result<UnixStream> {
    Ok(UnixStream::connect(path.as_ref()).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_generate_socket_path_format() {
        let path = generate_socket_path("/run/test");
        let name = path.file_name().unwrap().to_str().unwrap();

        assert!(path.starts_with("/run/test"));
        assert!(name.starts_with(&format!("shmwire-{}-", std::process::id())));
        assert!(name.ends_with(".sock"));
    }

    #[test]
    fn test_generate_socket_path_uniqueness() {
        let paths: Vec<PathBuf> = (0..10).map(|_| generate_socket_path("/tmp")).collect();
        for (i, p1) in paths.iter().enumerate() {
            for p2 in &paths[i + 1..] {
                assert_ne!(p1, p2);
            }
        }
    }

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = generate_socket_path(dir.path());
        let listener = SocketListener::bind(&path).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let mut stream = connect(&path).await.unwrap();
                stream.write_all(b"hi").await.unwrap();
            }
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        let listener = SocketListener::bind(&path).unwrap();
        assert_eq!(listener.path(), path.as_path());
    }
}
