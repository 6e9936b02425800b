//! Memory-mapped pool file: header, slot table and data region.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (64 bytes)                                            │
//! │   magic u64 │ version u32 │ lender pid u32 │ seq u32 │       │
//! │   slot size u32 │ data size u64 │ slot count u32 │ pad u32 │ │
//! │   state AtomicU32 │ borrowers AtomicU32 │ data offset u64 │  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Slot table: slot count x AtomicU64                           │
//! │   [generation: 32 | run length: 24 | state: 8]               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Data region: slot count x slot size                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The slot table partitions the data region into runs of contiguous slots.
//! Only the head slot of a run carries meaningful metadata. Runs move through
//! `FREE → ALLOCATED → IN_FLIGHT → RELEASED → FREE`; the lender owns every
//! transition except `IN_FLIGHT → RELEASED`, which the receiver performs
//! with a single compare-and-swap.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use memmap2::{MmapOptions, MmapRaw};

use super::PoolId;
use crate::error::{Result, ShmwireError};

/// Magic number of pool files ("SHMWPOOL").
pub const POOL_MAGIC: u64 = 0x5348_4D57_504F_4F4C;

/// Current pool format version.
pub const POOL_VERSION: u32 = 1;

/// Size of the pool header.
pub const POOL_HEADER_SIZE: usize = 64;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_LENDER_PID: usize = 12;
const OFF_SEQ: usize = 16;
const OFF_SLOT_SIZE: usize = 20;
const OFF_DATA_SIZE: usize = 24;
const OFF_SLOT_COUNT: usize = 32;
const OFF_STATE: usize = 40;
const OFF_BORROWERS: usize = 44;
const OFF_DATA_OFFSET: usize = 48;

const POOL_LIVE: u32 = 1;
const POOL_STALE: u32 = 2;

/// Largest run a slot-table entry can describe.
pub const MAX_RUN_SLOTS: usize = 0x00FF_FFFF;

/// State of a slot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Free = 0,
    Allocated = 1,
    InFlight = 2,
    Released = 3,
}

impl SlotState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => SlotState::Allocated,
            2 => SlotState::InFlight,
            3 => SlotState::Released,
            _ => SlotState::Free,
        }
    }
}

/// Decoded slot-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMeta {
    pub generation: u32,
    pub run_len: u32,
    pub state: SlotState,
}

impl SlotMeta {
    pub fn pack(self) -> u64 {
        ((self.generation as u64) << 32)
            | (((self.run_len as u64) & MAX_RUN_SLOTS as u64) << 8)
            | self.state as u64
    }

    pub fn unpack(word: u64) -> Self {
        Self {
            generation: (word >> 32) as u32,
            run_len: ((word >> 8) & MAX_RUN_SLOTS as u64) as u32,
            state: SlotState::from_bits((word & 0xFF) as u8),
        }
    }
}

/// Geometry of a pool, derived from its requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub slot_size: usize,
    pub slot_count: usize,
    pub data_offset: usize,
    pub total_size: usize,
}

impl PoolLayout {
    pub fn for_size(size: usize, slot_size: usize) -> Result<Self> {
        if size == 0 {
            return Err(ShmwireError::Usage("arena pool size must be non-zero".into()));
        }
        let slot_count = size.div_ceil(slot_size);
        if slot_count > MAX_RUN_SLOTS {
            return Err(ShmwireError::Usage(format!(
                "arena pool of {} bytes needs {} slots, maximum is {}",
                size, slot_count, MAX_RUN_SLOTS
            )));
        }
        let data_offset = (POOL_HEADER_SIZE + slot_count * 8).div_ceil(64) * 64;
        let total_size = slot_count
            .checked_mul(slot_size)
            .and_then(|data| data.checked_add(data_offset))
            .ok_or_else(|| ShmwireError::ResourceExhausted(format!("pool size {}", size)))?;
        Ok(Self {
            slot_size,
            slot_count,
            data_offset,
            total_size,
        })
    }

    /// Capacity of the data region.
    pub fn data_size(&self) -> usize {
        self.slot_count * self.slot_size
    }
}

/// A segment reserved by [`PoolMapping::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRun {
    pub slot: u32,
    pub generation: u32,
    pub slots: u32,
}

/// A mapped pool file, shared by lender and borrowers.
pub struct PoolMapping {
    map: MmapRaw,
    _file: File,
    path: PathBuf,
    id: PoolId,
    layout: PoolLayout,
    locally_stale: AtomicBool,
}

impl PoolMapping {
    /// Create and map a new pool file. Fails if the file already exists.
    pub fn create(path: &Path, id: PoolId, layout: PoolLayout) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        if let Err(e) = file.set_len(layout.total_size as u64) {
            let _ = std::fs::remove_file(path);
            return Err(exhausted(path, e));
        }

        let map = match MmapOptions::new().len(layout.total_size).map_raw(&file) {
            Ok(map) => map,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(exhausted(path, e));
            }
        };

        let mut header = [0u8; POOL_HEADER_SIZE];
        header[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&POOL_MAGIC.to_le_bytes());
        header[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&POOL_VERSION.to_le_bytes());
        header[OFF_LENDER_PID..OFF_LENDER_PID + 4].copy_from_slice(&id.lender_pid.to_le_bytes());
        header[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&id.seq.to_le_bytes());
        header[OFF_SLOT_SIZE..OFF_SLOT_SIZE + 4]
            .copy_from_slice(&(layout.slot_size as u32).to_le_bytes());
        header[OFF_DATA_SIZE..OFF_DATA_SIZE + 8]
            .copy_from_slice(&(layout.data_size() as u64).to_le_bytes());
        header[OFF_SLOT_COUNT..OFF_SLOT_COUNT + 4]
            .copy_from_slice(&(layout.slot_count as u32).to_le_bytes());
        header[OFF_DATA_OFFSET..OFF_DATA_OFFSET + 8]
            .copy_from_slice(&(layout.data_offset as u64).to_le_bytes());

        // SAFETY: the mapping is at least POOL_HEADER_SIZE bytes and nobody
        // else can have opened a file we just created.
        unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), map.as_mut_ptr(), POOL_HEADER_SIZE);
        }

        let pool = Self {
            map,
            _file: file,
            path: path.to_path_buf(),
            id,
            layout,
            locally_stale: AtomicBool::new(false),
        };

        pool.slot_word(0).store(
            SlotMeta {
                generation: 0,
                run_len: layout.slot_count as u32,
                state: SlotState::Free,
            }
            .pack(),
            Ordering::Release,
        );
        pool.atomic_u32(OFF_BORROWERS).store(0, Ordering::Release);
        pool.atomic_u32(OFF_STATE).store(POOL_LIVE, Ordering::Release);

        Ok(pool)
    }

    /// Map an existing pool file and check it is the pool named `id`.
    pub fn open(path: &Path, id: PoolId) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < POOL_HEADER_SIZE {
            return Err(ShmwireError::StalePool(format!("{} is truncated", id)));
        }

        let map = MmapOptions::new().len(file_len).map_raw(&file)?;

        // SAFETY: the mapping is at least POOL_HEADER_SIZE bytes; the fixed
        // header fields are written once before the pool is lent.
        let header = unsafe { std::slice::from_raw_parts(map.as_ptr(), OFF_STATE) };
        let u32_at = |off: usize| {
            u32::from_le_bytes([header[off], header[off + 1], header[off + 2], header[off + 3]])
        };
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&header[OFF_MAGIC..OFF_MAGIC + 8]);

        if u64::from_le_bytes(magic) != POOL_MAGIC || u32_at(OFF_VERSION) != POOL_VERSION {
            return Err(ShmwireError::StalePool(format!("{} has an invalid header", id)));
        }
        if PoolId::new(u32_at(OFF_LENDER_PID), u32_at(OFF_SEQ)) != id {
            return Err(ShmwireError::StalePool(format!("{} was replaced", id)));
        }

        let slot_size = u32_at(OFF_SLOT_SIZE) as usize;
        let slot_count = u32_at(OFF_SLOT_COUNT) as usize;
        let layout = PoolLayout::for_size(slot_count * slot_size, slot_size.max(1))?;
        if layout.total_size != file_len || layout.slot_count != slot_count {
            return Err(ShmwireError::StalePool(format!("{} has inconsistent geometry", id)));
        }

        Ok(Self {
            map,
            _file: file,
            path: path.to_path_buf(),
            id,
            layout,
            locally_stale: AtomicBool::new(false),
        })
    }

    fn atomic_u32(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off % 4 == 0 && off + 4 <= POOL_HEADER_SIZE);
        // SAFETY: in bounds and 4-byte aligned (the mapping is page aligned);
        // the reference cannot outlive the mapping.
        unsafe { &*(self.map.as_ptr().add(off) as *const AtomicU32) }
    }

    fn slot_word(&self, slot: usize) -> &AtomicU64 {
        debug_assert!(slot < self.layout.slot_count);
        // SAFETY: the slot table lies between the header and data_offset,
        // entries are 8-byte aligned.
        unsafe { &*(self.map.as_ptr().add(POOL_HEADER_SIZE + slot * 8) as *const AtomicU64) }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> PoolLayout {
        self.layout
    }

    /// False once the lender tore the pool down or it was marked stale here.
    pub fn is_live(&self) -> bool {
        !self.locally_stale.load(Ordering::Acquire)
            && self.atomic_u32(OFF_STATE).load(Ordering::Acquire) == POOL_LIVE
    }

    /// Mark the pool stale for every process mapping it.
    pub fn mark_stale(&self) {
        self.atomic_u32(OFF_STATE).store(POOL_STALE, Ordering::Release);
        self.locally_stale.store(true, Ordering::Release);
    }

    /// Mark the pool stale for this process only.
    pub fn mark_locally_stale(&self) {
        self.locally_stale.store(true, Ordering::Release);
    }

    pub fn borrowers(&self) -> u32 {
        self.atomic_u32(OFF_BORROWERS).load(Ordering::Acquire)
    }

    pub fn add_borrower(&self) {
        self.atomic_u32(OFF_BORROWERS).fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_borrower(&self) {
        let _ = self.atomic_u32(OFF_BORROWERS).fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
    }

    pub fn slot_meta(&self, slot: u32) -> Option<SlotMeta> {
        ((slot as usize) < self.layout.slot_count)
            .then(|| SlotMeta::unpack(self.slot_word(slot as usize).load(Ordering::Acquire)))
    }

    /// Offset (from the start of the mapping) of the first byte of `slot`.
    pub fn slot_offset(&self, slot: u32) -> usize {
        self.layout.data_offset + slot as usize * self.layout.slot_size
    }

    /// Slot whose first byte is at `offset`, if `offset` is a slot boundary.
    pub fn slot_at(&self, offset: usize) -> Option<u32> {
        let rel = offset.checked_sub(self.layout.data_offset)?;
        if rel % self.layout.slot_size != 0 {
            return None;
        }
        let slot = rel / self.layout.slot_size;
        (slot < self.layout.slot_count).then_some(slot as u32)
    }

    /// Raw pointer to `offset` within the mapping.
    ///
    /// Callers must stay within the run they own.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.layout.total_size);
        // SAFETY: offset is within the mapping.
        unsafe { self.map.as_mut_ptr().add(offset) }
    }

    /// Reserve a run of slots holding at least `len` bytes (lender only).
    ///
    /// First fit over the slot table. Released runs are reclaimed and free
    /// neighbours coalesced on the way. Callers serialize allocations.
    pub fn allocate(&self, len: usize) -> Option<SlotRun> {
        let needed = len.max(1).div_ceil(self.layout.slot_size);
        let count = self.layout.slot_count;
        let mut slot = 0usize;

        while slot < count {
            let word = self.slot_word(slot);
            let mut meta = SlotMeta::unpack(word.load(Ordering::Acquire));
            let mut run = (meta.run_len as usize).max(1);

            if meta.state == SlotState::Released {
                meta.state = SlotState::Free;
            }

            if meta.state == SlotState::Free {
                // Absorb free or released runs that follow
                while slot + run < count {
                    let next = SlotMeta::unpack(self.slot_word(slot + run).load(Ordering::Acquire));
                    if !matches!(next.state, SlotState::Free | SlotState::Released) {
                        break;
                    }
                    run += (next.run_len as usize).max(1);
                }

                if run >= needed {
                    if run > needed {
                        let rest = self.slot_word(slot + needed);
                        let rest_gen = SlotMeta::unpack(rest.load(Ordering::Acquire)).generation;
                        rest.store(
                            SlotMeta {
                                generation: rest_gen,
                                run_len: (run - needed) as u32,
                                state: SlotState::Free,
                            }
                            .pack(),
                            Ordering::Release,
                        );
                    }
                    let generation = meta.generation.wrapping_add(1);
                    word.store(
                        SlotMeta {
                            generation,
                            run_len: needed as u32,
                            state: SlotState::Allocated,
                        }
                        .pack(),
                        Ordering::Release,
                    );
                    return Some(SlotRun {
                        slot: slot as u32,
                        generation,
                        slots: needed as u32,
                    });
                }

                word.store(
                    SlotMeta {
                        generation: meta.generation,
                        run_len: run as u32,
                        state: SlotState::Free,
                    }
                    .pack(),
                    Ordering::Release,
                );
            }

            slot += run;
        }

        None
    }

    /// Transition a run between states if its generation still matches.
    pub fn transition(&self, slot: u32, generation: u32, from: SlotState, to: SlotState) -> bool {
        let Some(meta) = self.slot_meta(slot) else {
            return false;
        };
        if meta.generation != generation || meta.state != from {
            return false;
        }
        let next = SlotMeta { state: to, ..meta };
        self.slot_word(slot as usize)
            .compare_exchange(meta.pack(), next.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Runs currently allocated or in flight.
    pub fn live_segments(&self) -> usize {
        let mut live = 0;
        let mut slot = 0usize;
        while slot < self.layout.slot_count {
            let meta = SlotMeta::unpack(self.slot_word(slot).load(Ordering::Acquire));
            if matches!(meta.state, SlotState::Allocated | SlotState::InFlight) {
                live += 1;
            }
            slot += (meta.run_len as usize).max(1);
        }
        live
    }
}

impl std::fmt::Debug for PoolMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMapping")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("live", &self.is_live())
            .finish()
    }
}

fn exhausted(path: &Path, err: std::io::Error) -> ShmwireError {
    ShmwireError::ResourceExhausted(format!("cannot back pool {}: {}", path.display(), err))
}
