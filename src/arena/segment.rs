//! Segments: the unit in which pool memory travels between processes.

use std::io;
use std::sync::Arc;

use super::pool::{PoolMapping, SlotRun, SlotState};
use super::repository::{LenderPool, PoolHandle};
use super::PoolId;
use crate::error::{Result, ShmwireError};
use crate::protocol::ShmHandle;

/// A writable segment reserved in a lent pool.
///
/// Bytes are appended through `std::io::Write`. Dropping a segment that was
/// never sent frees it.
pub struct SegmentMut {
    pool: Arc<LenderPool>,
    run: SlotRun,
    offset: usize,
    capacity: usize,
    len: usize,
    sent: bool,
}

impl SegmentMut {
    pub(crate) fn new(pool: Arc<LenderPool>, run: SlotRun) -> Self {
        let mapping = pool.mapping();
        let offset = mapping.slot_offset(run.slot);
        let capacity = run.slots as usize * mapping.layout().slot_size;
        Self {
            pool,
            run,
            offset,
            capacity,
            len: 0,
            sent: false,
        }
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool.mapping().id()
    }

    /// Whether this segment was allocated from `pool`.
    pub fn belongs_to(&self, pool: &PoolHandle) -> bool {
        pool.same_pool(&self.pool)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the run [offset, offset + capacity) is owned exclusively by
        // this segment until it is sent.
        unsafe { std::slice::from_raw_parts(self.pool.mapping().ptr_at(self.offset), self.len) }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Whether the segment is still allocated under the generation it was
    /// handed out with.
    pub fn is_valid(&self) -> bool {
        self.pool.mapping().is_live()
            && self.pool.mapping().slot_meta(self.run.slot).is_some_and(|m| {
                m.generation == self.run.generation && m.state == SlotState::Allocated
            })
    }

    /// Hand the segment over to the receiver and describe it.
    ///
    /// # Errors
    ///
    /// `StalePool` if the pool was torn down; `InvalidArenaReference` if the
    /// segment is no longer allocated under its generation.
    pub fn into_handle(mut self) -> Result<ShmHandle> {
        let mapping = self.pool.mapping();
        if !mapping.is_live() {
            return Err(ShmwireError::StalePool(mapping.id().to_string()));
        }
        if !mapping.transition(
            self.run.slot,
            self.run.generation,
            SlotState::Allocated,
            SlotState::InFlight,
        ) {
            return Err(ShmwireError::InvalidArenaReference(format!(
                "segment at slot {} of {} is not allocated under generation {}",
                self.run.slot,
                mapping.id(),
                self.run.generation
            )));
        }
        self.sent = true;
        Ok(ShmHandle {
            pool: mapping.id(),
            offset: self.offset as u64,
            len: self.len as u32,
            generation: self.run.generation,
        })
    }
}

impl io::Write for SegmentMut {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.remaining());
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("segment full ({} bytes)", self.capacity),
            ));
        }
        // SAFETY: [offset + len, offset + len + n) lies inside this segment's
        // run, which no one else reads or writes before it is sent.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                self.pool.mapping().ptr_at(self.offset + self.len),
                n,
            );
        }
        self.len += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SegmentMut {
    fn drop(&mut self) {
        if !self.sent {
            self.pool.free_unsent(self.run.slot, self.run.generation);
        }
    }
}

impl std::fmt::Debug for SegmentMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentMut")
            .field("pool", &self.pool_id())
            .field("slot", &self.run.slot)
            .field("generation", &self.run.generation)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Read-only view of a segment received from a peer.
///
/// Dropping the view releases the segment back to the lender.
pub struct SegmentView {
    mapping: Arc<PoolMapping>,
    slot: u32,
    generation: u32,
    offset: usize,
    len: usize,
}

impl SegmentView {
    pub(crate) fn resolve(mapping: &Arc<PoolMapping>, handle: &ShmHandle) -> Result<Self> {
        let invalid = |why: &str| {
            ShmwireError::InvalidArenaReference(format!(
                "{} offset {} len {}: {}",
                handle.pool, handle.offset, handle.len, why
            ))
        };

        if handle.pool != mapping.id() {
            return Err(invalid("handle names another pool"));
        }
        let offset = usize::try_from(handle.offset).map_err(|_| invalid("offset out of range"))?;
        let slot = mapping
            .slot_at(offset)
            .ok_or_else(|| invalid("offset is not a segment start"))?;
        let meta = mapping
            .slot_meta(slot)
            .ok_or_else(|| invalid("slot out of range"))?;
        if meta.generation != handle.generation || meta.state != SlotState::InFlight {
            return Err(invalid("segment is not in flight under this generation"));
        }
        let len = handle.len as usize;
        if len > meta.run_len as usize * mapping.layout().slot_size {
            return Err(invalid("length exceeds the segment"));
        }

        Ok(Self {
            mapping: mapping.clone(),
            slot,
            generation: handle.generation,
            offset,
            len,
        })
    }

    pub fn pool_id(&self) -> PoolId {
        self.mapping.id()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_live(&self) -> bool {
        self.mapping.is_live()
    }

    /// The segment contents, read in place.
    ///
    /// # Errors
    ///
    /// `StaleView` once the pool has gone stale.
    pub fn bytes(&self) -> Result<&[u8]> {
        if !self.mapping.is_live() {
            return Err(ShmwireError::StaleView);
        }
        // SAFETY: the lender does not touch an in-flight segment until this
        // view releases it, and the mapping outlives `self`.
        Ok(unsafe { std::slice::from_raw_parts(self.mapping.ptr_at(self.offset), self.len) })
    }
}

impl Drop for SegmentView {
    fn drop(&mut self) {
        if self.mapping.is_live() {
            self.mapping.transition(
                self.slot,
                self.generation,
                SlotState::InFlight,
                SlotState::Released,
            );
        }
    }
}

impl std::fmt::Debug for SegmentView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentView")
            .field("pool", &self.pool_id())
            .field("slot", &self.slot)
            .field("len", &self.len)
            .field("live", &self.is_live())
            .finish()
    }
}
