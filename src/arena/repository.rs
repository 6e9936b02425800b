//! Process-wide bookkeeping of lent and borrowed pools.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::pool::{PoolLayout, PoolMapping, SlotState};
use super::segment::{SegmentMut, SegmentView};
use super::PoolId;
use crate::app::ProcessIdentity;
use crate::config::ArenaConfig;
use crate::error::{Result, ShmwireError};
use crate::protocol::ShmHandle;

/// Pool sequence numbers are unique per process, not per repository, so
/// several repositories in one process never collide on file names.
static NEXT_POOL_SEQ: AtomicU32 = AtomicU32::new(1);

/// Grant for one borrower to map one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendToken {
    pub pool: PoolId,
    pub path: PathBuf,
    /// Usable bytes in the pool.
    pub size: usize,
    pub lender: ProcessIdentity,
    pub borrower: ProcessIdentity,
}

pub(crate) struct LenderPool {
    mapping: Arc<PoolMapping>,
    alloc_lock: Mutex<()>,
    allocations: AtomicU64,
    destroyed: AtomicBool,
}

impl LenderPool {
    fn tear_down(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.mapping.mark_stale();
        if let Err(e) = std::fs::remove_file(self.mapping.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    target: "shmwire::arena",
                    pool = %self.mapping.id(),
                    error = %e,
                    "Failed to unlink pool file"
                );
            }
        }
        true
    }

    pub(crate) fn mapping(&self) -> &Arc<PoolMapping> {
        &self.mapping
    }

    pub(crate) fn free_unsent(&self, slot: u32, generation: u32) {
        let _guard = self.alloc_lock.lock();
        self.mapping
            .transition(slot, generation, SlotState::Allocated, SlotState::Free);
    }
}

impl Drop for LenderPool {
    fn drop(&mut self) {
        if self.tear_down() {
            tracing::debug!(target: "shmwire::arena", pool = %self.mapping.id(), "Pool dropped");
        }
    }
}

/// Lender-side handle to a pool created by [`ArenaRepository::create_pool`].
///
/// Cheap to clone. The pool is torn down when it is destroyed explicitly or
/// the last handle (including segments allocated from it) is dropped.
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<LenderPool>,
}

impl PoolHandle {
    pub fn id(&self) -> PoolId {
        self.inner.mapping.id()
    }

    /// Usable bytes in the pool.
    pub fn size(&self) -> usize {
        self.inner.mapping.layout().data_size()
    }

    pub fn path(&self) -> &Path {
        self.inner.mapping.path()
    }

    pub fn is_live(&self) -> bool {
        self.inner.mapping.is_live()
    }

    /// Processes currently mapping this pool.
    pub fn borrowers(&self) -> u32 {
        self.inner.mapping.borrowers()
    }

    /// Segments ever allocated from this pool.
    pub fn allocations(&self) -> u64 {
        self.inner.allocations.load(Ordering::Acquire)
    }

    /// Segments allocated or in flight right now.
    pub fn live_segments(&self) -> usize {
        self.inner.mapping.live_segments()
    }

    /// Reserve a segment of at least `capacity` bytes.
    ///
    /// # Errors
    ///
    /// `StalePool` after the pool was destroyed; `ResourceExhausted` when no
    /// free run is large enough.
    pub fn allocate(&self, capacity: usize) -> Result<SegmentMut> {
        if !self.is_live() {
            return Err(ShmwireError::StalePool(self.id().to_string()));
        }
        let run = {
            let _guard = self.inner.alloc_lock.lock();
            self.inner.mapping.allocate(capacity)
        };
        let run = run.ok_or_else(|| {
            ShmwireError::ResourceExhausted(format!(
                "{} has no free segment of {} bytes",
                self.id(),
                capacity
            ))
        })?;
        self.inner.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(SegmentMut::new(self.inner.clone(), run))
    }

    /// Give an in-flight segment back after its handle could not be delivered.
    pub(crate) fn reclaim(&self, handle: &ShmHandle) {
        if let Some(slot) = self.inner.mapping.slot_at(handle.offset as usize) {
            self.inner.mapping.transition(
                slot,
                handle.generation,
                SlotState::InFlight,
                SlotState::Released,
            );
        }
    }

    pub(crate) fn same_pool(&self, other: &Arc<LenderPool>) -> bool {
        Arc::ptr_eq(&self.inner, other)
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Borrower-side mapping of a peer's pool.
///
/// Dropping it is the same as [`ArenaRepository::release`].
pub struct BorrowedPool {
    mapping: Arc<PoolMapping>,
    lender: ProcessIdentity,
    repo: Weak<RepoShared>,
}

impl BorrowedPool {
    pub fn id(&self) -> PoolId {
        self.mapping.id()
    }

    pub fn lender(&self) -> &ProcessIdentity {
        &self.lender
    }

    pub fn size(&self) -> usize {
        self.mapping.layout().data_size()
    }

    /// False once the lender tore the pool down or was declared gone.
    pub fn is_live(&self) -> bool {
        self.mapping.is_live()
    }

    /// Turn a received handle into a read-only view of the segment.
    ///
    /// # Errors
    ///
    /// `StalePool` if the pool is stale; `InvalidArenaReference` if the handle
    /// does not name an in-flight segment of this pool.
    pub fn resolve(&self, handle: &ShmHandle) -> Result<SegmentView> {
        if !self.mapping.is_live() {
            return Err(ShmwireError::StalePool(self.id().to_string()));
        }
        SegmentView::resolve(&self.mapping, handle)
    }
}

impl Drop for BorrowedPool {
    fn drop(&mut self) {
        match self.repo.upgrade() {
            Some(repo) => repo.release_mapping(&self.mapping),
            None => self.mapping.remove_borrower(),
        }
    }
}

impl std::fmt::Debug for BorrowedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BorrowedPool")
            .field("id", &self.id())
            .field("lender", &self.lender)
            .field("live", &self.is_live())
            .finish()
    }
}

struct LentRecord {
    pool: Weak<LenderPool>,
    borrowers: HashSet<ProcessIdentity>,
}

struct BorrowRecord {
    mapping: Arc<PoolMapping>,
    lender: ProcessIdentity,
    refs: usize,
}

struct RepoShared {
    identity: ProcessIdentity,
    config: ArenaConfig,
    lent: Mutex<HashMap<PoolId, LentRecord>>,
    borrowed: Mutex<HashMap<PoolId, BorrowRecord>>,
}

impl RepoShared {
    fn release_mapping(&self, mapping: &Arc<PoolMapping>) {
        let mut borrowed = self.borrowed.lock();
        let id = mapping.id();
        let Some(record) = borrowed.get_mut(&id) else {
            return;
        };
        if !Arc::ptr_eq(&record.mapping, mapping) {
            return;
        }
        record.refs = record.refs.saturating_sub(1);
        if record.refs == 0 {
            borrowed.remove(&id);
            mapping.remove_borrower();
            tracing::debug!(target: "shmwire::arena", pool = %id, "Borrowed pool released");
        }
    }
}

/// Registry of the pools this process lends and borrows.
///
/// Cheap to clone; all clones share state. Create one per process (or per
/// test) and pass it to every session.
#[derive(Clone)]
pub struct ArenaRepository {
    shared: Arc<RepoShared>,
}

impl ArenaRepository {
    pub fn new(identity: ProcessIdentity, config: ArenaConfig) -> Self {
        Self {
            shared: Arc::new(RepoShared {
                identity,
                config,
                lent: Mutex::new(HashMap::new()),
                borrowed: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Identity borrowers present when borrowing.
    pub fn identity(&self) -> ProcessIdentity {
        self.shared.identity.clone()
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.shared.config
    }

    /// Create a pool with at least `size` usable bytes.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if the OS cannot back the pool; `Usage` for a zero
    /// or oversized request.
    pub fn create_pool(&self, size: usize) -> Result<PoolHandle> {
        let config = &self.shared.config;
        let layout = PoolLayout::for_size(size, config.slot_size)?;
        let id = PoolId::new(
            self.shared.identity.pid,
            NEXT_POOL_SEQ.fetch_add(1, Ordering::Relaxed),
        );

        std::fs::create_dir_all(&config.pool_dir)?;
        let path = config.pool_dir.join(id.file_name());
        let mapping = PoolMapping::create(&path, id, layout)?;

        let inner = Arc::new(LenderPool {
            mapping: Arc::new(mapping),
            alloc_lock: Mutex::new(()),
            allocations: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        });

        self.shared.lent.lock().insert(
            id,
            LentRecord {
                pool: Arc::downgrade(&inner),
                borrowers: HashSet::new(),
            },
        );

        tracing::debug!(
            target: "shmwire::arena",
            pool = %id,
            size = layout.data_size(),
            path = %path.display(),
            "Pool created"
        );
        Ok(PoolHandle { inner })
    }

    /// Share a pool with `borrower`. Repeated calls return the same token.
    pub fn lend(&self, pool: &PoolHandle, borrower: &ProcessIdentity) -> Result<LendToken> {
        if !pool.is_live() {
            return Err(ShmwireError::StalePool(pool.id().to_string()));
        }

        let mut lent = self.shared.lent.lock();
        let record = lent
            .get_mut(&pool.id())
            .filter(|r| r.pool.upgrade().is_some_and(|p| pool.same_pool(&p)))
            .ok_or_else(|| {
                ShmwireError::Usage(format!("{} was not created by this repository", pool.id()))
            })?;

        if record.borrowers.insert(borrower.clone()) {
            tracing::debug!(
                target: "shmwire::arena",
                pool = %pool.id(),
                borrower = %borrower,
                "Pool lent"
            );
        }

        Ok(LendToken {
            pool: pool.id(),
            path: pool.path().to_path_buf(),
            size: pool.size(),
            lender: self.shared.identity.clone(),
            borrower: borrower.clone(),
        })
    }

    /// Map a pool lent to this process.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if the token was issued to another identity;
    /// `StalePool` if the lender tore the pool down.
    pub fn borrow(&self, token: &LendToken) -> Result<BorrowedPool> {
        if token.borrower != self.shared.identity {
            return Err(ShmwireError::PermissionDenied(format!(
                "{} was lent to {}, not {}",
                token.pool, token.borrower, self.shared.identity
            )));
        }

        let mut borrowed = self.shared.borrowed.lock();
        if let Some(record) = borrowed.get_mut(&token.pool) {
            if !record.mapping.is_live() {
                return Err(ShmwireError::StalePool(token.pool.to_string()));
            }
            record.refs += 1;
            return Ok(BorrowedPool {
                mapping: record.mapping.clone(),
                lender: record.lender.clone(),
                repo: Arc::downgrade(&self.shared),
            });
        }

        let mapping = match PoolMapping::open(&token.path, token.pool) {
            Ok(mapping) => mapping,
            Err(ShmwireError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShmwireError::StalePool(token.pool.to_string()))
            }
            Err(e) => return Err(e),
        };
        if !mapping.is_live() {
            return Err(ShmwireError::StalePool(token.pool.to_string()));
        }
        mapping.add_borrower();

        let mapping = Arc::new(mapping);
        borrowed.insert(
            token.pool,
            BorrowRecord {
                mapping: mapping.clone(),
                lender: token.lender.clone(),
                refs: 1,
            },
        );

        tracing::debug!(
            target: "shmwire::arena",
            pool = %token.pool,
            lender = %token.lender,
            "Pool borrowed"
        );
        Ok(BorrowedPool {
            mapping,
            lender: token.lender.clone(),
            repo: Arc::downgrade(&self.shared),
        })
    }

    /// Drop one borrow of a pool. The last release unmaps it.
    pub fn release(&self, borrowed: BorrowedPool) {
        drop(borrowed);
    }

    /// Tear a lent pool down.
    ///
    /// Borrowers observe the pool as stale on their next access.
    ///
    /// # Errors
    ///
    /// `PoolInUse` if borrowers still mapped the pool. The pool is torn down
    /// regardless.
    pub fn destroy_pool(&self, pool: PoolHandle) -> Result<()> {
        let id = pool.id();
        let lent_to = self
            .shared
            .lent
            .lock()
            .remove(&id)
            .map(|record| record.borrowers.into_iter().map(|b| b.to_string()).collect::<Vec<_>>())
            .unwrap_or_default();

        let borrowers = pool.borrowers();
        pool.inner.tear_down();

        if borrowers > 0 {
            tracing::warn!(
                target: "shmwire::arena",
                pool = %id,
                borrowers,
                lent_to = ?lent_to,
                "Pool destroyed while borrowed"
            );
            return Err(ShmwireError::PoolInUse {
                pool: format!("{} (lent to {})", id, lent_to.join(", ")),
                borrowers,
            });
        }
        tracing::debug!(target: "shmwire::arena", pool = %id, lent_to = ?lent_to, "Pool destroyed");
        Ok(())
    }

    /// Identities `pool` has been lent to, in no particular order.
    pub fn lent_to(&self, pool: &PoolHandle) -> Vec<ProcessIdentity> {
        self.shared
            .lent
            .lock()
            .get(&pool.id())
            .map(|record| record.borrowers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark every pool borrowed from `lender` stale. Returns how many.
    pub fn mark_lender_gone(&self, lender: &ProcessIdentity) -> usize {
        let borrowed = self.shared.borrowed.lock();
        let mut marked = 0;
        for record in borrowed.values().filter(|r| &r.lender == lender) {
            record.mapping.mark_locally_stale();
            marked += 1;
        }
        if marked > 0 {
            tracing::debug!(target: "shmwire::arena", lender = %lender, marked, "Lender gone");
        }
        marked
    }

    /// Pools created here and not yet torn down.
    pub fn lent_pools(&self) -> usize {
        self.shared
            .lent
            .lock()
            .values()
            .filter(|r| r.pool.upgrade().is_some())
            .count()
    }

    /// Distinct pools currently mapped from peers.
    pub fn borrowed_pools(&self) -> usize {
        self.shared.borrowed.lock().len()
    }
}

impl std::fmt::Debug for ArenaRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaRepository")
            .field("identity", &self.shared.identity)
            .field("pool_dir", &self.shared.config.pool_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn repos(dir: &Path) -> (ArenaRepository, ArenaRepository) {
        let config = ArenaConfig::new().pool_dir(dir).slot_size(256);
        (
            ArenaRepository::new(ProcessIdentity::new("lender", 100), config.clone()),
            ArenaRepository::new(ProcessIdentity::new("borrower", 200), config),
        )
    }

    #[test]
    fn test_create_pool_file() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, _) = repos(dir.path());

        let pool = lender.create_pool(1000).unwrap();
        assert!(pool.path().exists());
        assert!(pool.size() >= 1000);
        assert!(pool.path().to_string_lossy().ends_with(".pool"));
        assert_eq!(lender.lent_pools(), 1);

        drop(pool);
        assert_eq!(lender.lent_pools(), 0);
    }

    #[test]
    fn test_create_zero_sized_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, _) = repos(dir.path());
        assert!(lender.create_pool(0).unwrap_err().is_usage_error());
    }

    #[test]
    fn test_lend_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, borrower) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();

        let a = lender.lend(&pool, &borrower.identity()).unwrap();
        let b = lender.lend(&pool, &borrower.identity()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_lent_to_tracks_borrowers() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, borrower) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();
        assert!(lender.lent_to(&pool).is_empty());

        let other = ProcessIdentity::new("other", 4242);
        lender.lend(&pool, &borrower.identity()).unwrap();
        lender.lend(&pool, &borrower.identity()).unwrap();
        lender.lend(&pool, &other).unwrap();

        let lent_to = lender.lent_to(&pool);
        assert_eq!(lent_to.len(), 2);
        assert!(lent_to.contains(&borrower.identity()));
        assert!(lent_to.contains(&other));

        lender.destroy_pool(pool.clone()).unwrap();
        assert!(lender.lent_to(&pool).is_empty());
    }

    #[test]
    fn test_lend_foreign_pool_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, other) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();

        let err = other.lend(&pool, &lender.identity()).unwrap_err();
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_borrow_with_wrong_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, borrower) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();
        let token = lender.lend(&pool, &ProcessIdentity::new("someone-else", 1)).unwrap();

        assert!(matches!(
            borrower.borrow(&token),
            Err(ShmwireError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_borrow_refcount_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, borrower) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();
        let token = lender.lend(&pool, &borrower.identity()).unwrap();

        let first = borrower.borrow(&token).unwrap();
        let second = borrower.borrow(&token).unwrap();
        assert_eq!(pool.borrowers(), 1);
        assert_eq!(borrower.borrowed_pools(), 1);

        borrower.release(first);
        assert_eq!(borrower.borrowed_pools(), 1);
        borrower.release(second);
        assert_eq!(borrower.borrowed_pools(), 0);
        assert_eq!(pool.borrowers(), 0);
    }

    #[test]
    fn test_destroy_unborrowed_pool() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, borrower) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();
        let token = lender.lend(&pool, &borrower.identity()).unwrap();
        let path = pool.path().to_path_buf();

        lender.destroy_pool(pool).unwrap();
        assert!(!path.exists());
        assert!(matches!(borrower.borrow(&token), Err(ShmwireError::StalePool(_))));
    }

    #[test]
    fn test_destroy_while_borrowed_reports_pool_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, borrower) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();
        let token = lender.lend(&pool, &borrower.identity()).unwrap();
        let borrowed = borrower.borrow(&token).unwrap();

        let err = lender.destroy_pool(pool).unwrap_err();
        match err {
            ShmwireError::PoolInUse { pool, borrowers } => {
                assert_eq!(borrowers, 1);
                assert!(pool.contains(&borrower.identity().to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(!borrowed.is_live());
        assert!(matches!(borrower.borrow(&token), Err(ShmwireError::StalePool(_))));
    }

    #[test]
    fn test_segment_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, borrower) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();
        let token = lender.lend(&pool, &borrower.identity()).unwrap();
        let borrowed = borrower.borrow(&token).unwrap();

        let mut segment = pool.allocate(300).unwrap();
        segment.write_all(b"in place").unwrap();
        let handle = segment.into_handle().unwrap();
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.live_segments(), 1);

        let view = borrowed.resolve(&handle).unwrap();
        assert_eq!(view.bytes().unwrap(), b"in place");

        // A second resolve of the same handle is still valid while in flight
        assert!(borrowed.resolve(&handle).is_ok());

        drop(view);
        assert_eq!(pool.live_segments(), 0);
        assert!(borrowed.resolve(&handle).is_err());
    }

    #[test]
    fn test_unsent_segment_is_freed() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, _) = repos(dir.path());
        let pool = lender.create_pool(512).unwrap();

        let segment = pool.allocate(512).unwrap();
        assert!(pool.allocate(1).is_err());
        drop(segment);
        assert!(pool.allocate(512).is_ok());
    }

    #[test]
    fn test_mark_lender_gone() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, borrower) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();
        let token = lender.lend(&pool, &borrower.identity()).unwrap();
        let borrowed = borrower.borrow(&token).unwrap();

        assert_eq!(borrower.mark_lender_gone(&ProcessIdentity::new("nobody", 9)), 0);
        assert_eq!(borrower.mark_lender_gone(&lender.identity()), 1);
        assert!(!borrowed.is_live());
        assert!(pool.is_live());
    }

    #[test]
    fn test_allocate_after_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let (lender, _) = repos(dir.path());
        let pool = lender.create_pool(4096).unwrap();
        let keep = pool.clone();

        lender.destroy_pool(pool).unwrap();
        assert!(matches!(keep.allocate(10), Err(ShmwireError::StalePool(_))));
    }
}
