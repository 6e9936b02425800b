//! Shared-memory arena pools lent to and borrowed from peer processes.
//!
//! A process creates pools through its [`ArenaRepository`] and becomes their
//! lender. Lending a pool to a peer yields a [`LendToken`], which travels to
//! the peer over the session handshake; the peer turns it into a
//! [`BorrowedPool`] with [`ArenaRepository::borrow`].
//!
//! Pool contents are handed over in segments: the lender reserves a
//! [`SegmentMut`], fills it, and sends its [`ShmHandle`](crate::protocol::ShmHandle);
//! the borrower resolves the handle into a read-only [`SegmentView`]. Dropping
//! the view hands the segment back to the lender.
//!
//! # Example
//!
//! ```
//! use shmwire::app::ProcessIdentity;
//! use shmwire::arena::ArenaRepository;
//! use shmwire::config::ArenaConfig;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = ArenaConfig::new().pool_dir(dir.path());
//! let lender = ArenaRepository::new(ProcessIdentity::current("srv"), config.clone());
//! let borrower = ArenaRepository::new(ProcessIdentity::current("cli"), config);
//!
//! let pool = lender.create_pool(64 * 1024).unwrap();
//! let token = lender.lend(&pool, &borrower.identity()).unwrap();
//! let borrowed = borrower.borrow(&token).unwrap();
//! assert_eq!(pool.borrowers(), 1);
//!
//! borrower.release(borrowed);
//! assert_eq!(pool.borrowers(), 0);
//! ```

mod pool;
mod repository;
mod segment;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use pool::{SlotMeta, SlotState, POOL_HEADER_SIZE, POOL_MAGIC, POOL_VERSION};
pub use repository::{ArenaRepository, BorrowedPool, LendToken, PoolHandle};
pub use segment::{SegmentMut, SegmentView};

/// Identifier of a pool: lender process id plus a per-process sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId {
    pub lender_pid: u32,
    pub seq: u32,
}

impl PoolId {
    pub fn new(lender_pid: u32, seq: u32) -> Self {
        Self { lender_pid, seq }
    }

    /// File name of the pool inside the pool directory.
    pub fn file_name(&self) -> String {
        format!("shmwire-{}-{}.pool", self.lender_pid, self.seq)
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool {}:{}", self.lender_pid, self.seq)
    }
}
