//! Configuration for sessions, channels and the arena repository.
//!
//! All config structs are plain data with builder-style setters and
//! documented defaults. [`SessionConfig::from_env`] overlays environment
//! variables on top of the defaults:
//!
//! | Variable | Effect |
//! |---|---|
//! | `SHMWIRE_RUNTIME_DIR` | directory holding session sockets |
//! | `SHMWIRE_POOL_DIR` | directory holding arena pool files |
//! | `SHMWIRE_DISABLE_SHM` | `1`/`true` forces in-band structured channels |
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use shmwire::config::SessionConfig;
//!
//! let config = SessionConfig::new()
//!     .runtime_dir("/tmp/my-app")
//!     .handshake_timeout(Duration::from_secs(2))
//!     .shm_enabled(false);
//! assert!(!config.shm_enabled);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bound on every handshake step.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default size of the arena pool each session lends to its peer (4 MB).
pub const DEFAULT_POOL_SIZE: usize = 4 * 1024 * 1024;

/// Default arena slot size. Segments are made of whole slots.
pub const DEFAULT_SLOT_SIZE: usize = 4096;

/// Default largest blob a raw channel accepts (16 MB).
pub const DEFAULT_MAX_BLOB_SIZE: usize = 16 * 1024 * 1024;

/// Default number of received-but-unclaimed blobs before the reader pauses.
pub const DEFAULT_MAX_BUFFERED_BLOBS: usize = 256;

/// Default socket read chunk size (64 KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Environment variable overriding the socket directory.
pub const ENV_RUNTIME_DIR: &str = "SHMWIRE_RUNTIME_DIR";

/// Environment variable overriding the pool directory.
pub const ENV_POOL_DIR: &str = "SHMWIRE_POOL_DIR";

/// Environment variable disabling shared memory.
pub const ENV_DISABLE_SHM: &str = "SHMWIRE_DISABLE_SHM";

/// Limits of a raw channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Largest blob accepted in either direction.
    pub max_blob_size: usize,
    /// Unclaimed inbound blobs buffered before the reader stops reading.
    pub max_buffered_blobs: usize,
    /// Size of each socket read.
    pub read_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            max_buffered_blobs: DEFAULT_MAX_BUFFERED_BLOBS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_blob_size(mut self, size: usize) -> Self {
        self.max_blob_size = size;
        self
    }

    pub fn max_buffered_blobs(mut self, count: usize) -> Self {
        self.max_buffered_blobs = count.max(1);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}

/// Settings of an [`ArenaRepository`](crate::arena::ArenaRepository).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Directory where pool files are created.
    pub pool_dir: PathBuf,
    /// Allocation granule inside a pool.
    pub slot_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            pool_dir: default_pool_dir(),
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}

impl ArenaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pool_dir = dir.into();
        self
    }

    /// Set the slot size; rounded up to a multiple of 64 bytes.
    pub fn slot_size(mut self, size: usize) -> Self {
        self.slot_size = size.max(64).div_ceil(64) * 64;
        self
    }
}

/// Settings shared by [`SessionServer`](crate::session::SessionServer) and
/// [`SessionClient`](crate::session::SessionClient).
///
/// Both peers must agree on `runtime_dir`; it is the only shared state the
/// two processes need before a session exists.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory holding the well-known server socket and channel sockets.
    pub runtime_dir: PathBuf,
    /// Bound on each handshake step.
    pub handshake_timeout: Duration,
    /// Whether sessions lend an arena pool to the peer.
    pub shm_enabled: bool,
    /// Size of the pool lent to the peer.
    pub pool_size: usize,
    /// Limits applied to every init-channel.
    pub channel: ChannelConfig,
    /// Pool directory and slot size of the arena repository.
    pub arena: ArenaConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shm_enabled: true,
            pool_size: DEFAULT_POOL_SIZE,
            channel: ChannelConfig::default(),
            arena: ArenaConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `SHMWIRE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_RUNTIME_DIR) {
            if !dir.is_empty() {
                config.runtime_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var(ENV_POOL_DIR) {
            if !dir.is_empty() {
                config.arena.pool_dir = PathBuf::from(dir);
            }
        }
        if let Ok(flag) = std::env::var(ENV_DISABLE_SHM) {
            if parse_flag(&flag) {
                config.shm_enabled = false;
            }
        }

        tracing::debug!(
            target: "shmwire::config",
            runtime_dir = %config.runtime_dir.display(),
            pool_dir = %config.arena.pool_dir.display(),
            shm_enabled = config.shm_enabled,
            "Loaded session config"
        );
        config
    }

    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn pool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.arena.pool_dir = dir.into();
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn shm_enabled(mut self, enabled: bool) -> Self {
        self.shm_enabled = enabled;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn arena(mut self, arena: ArenaConfig) -> Self {
        self.arena = arena;
        self
    }

    /// Well-known socket path of a server application.
    pub fn server_socket_path(&self, server_app: &str) -> PathBuf {
        self.runtime_dir.join(format!("shmwire-{}.sock", server_app))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_pool_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
