//! Disk-backed swap store.
//!
//! A headerless slot store over a raw block device: slot `i` occupies
//! sectors `[i*k, (i+1)*k)` where `k = PAGE_SIZE / SECTOR_SIZE`, holding
//! raw page bytes with no metadata. Slot occupancy lives in an in-memory
//! bitmap sized once at startup from the device capacity.
//!
//! A single lock serializes the bitmap *and* the slot I/O; the frame
//! table drops its own lock before calling in here, so eviction never
//! holds the frame lock across disk I/O.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::{VmError, PAGE_SIZE};
use crate::drivers::block::{BlockDevice, SECTOR_SIZE};

/// Sectors per swap slot (one page)
pub const SECTORS_PER_SLOT: u64 = PAGE_SIZE / SECTOR_SIZE as u64;

const BITMAP_BITS: usize = 64;

/// Slots handed out over the store's lifetime
static SLOTS_ALLOCATED: AtomicU64 = AtomicU64::new(0);

struct SwapInner {
    device: Option<Box<dyn BlockDevice>>,
    /// Allocation bitmap (1 = used, 0 = free)
    bitmap: Vec<u64>,
    slot_count: usize,
    free_count: usize,
}

/// Process-wide swap store
pub struct SwapStore {
    inner: Mutex<SwapInner>,
}

impl SwapStore {
    /// Size the store from the device capacity. A missing or zero-sized
    /// device degrades to "no swap capacity": the store comes up and all
    /// later allocations fail.
    pub fn new(device: Option<Box<dyn BlockDevice>>) -> Self {
        let slot_count = device
            .as_ref()
            .map(|dev| (dev.sector_count() / SECTORS_PER_SLOT) as usize)
            .unwrap_or(0);

        if slot_count == 0 {
            crate::kwarn!("[vm] swap: no backing store, running without swap capacity");
        } else {
            crate::kinfo!(
                "[vm] swap: {} slots ({} KiB) on backing store",
                slot_count,
                slot_count as u64 * PAGE_SIZE / 1024
            );
        }

        let bitmap_words = (slot_count + BITMAP_BITS - 1) / BITMAP_BITS;
        Self {
            inner: Mutex::new(SwapInner {
                device,
                bitmap: vec![0u64; bitmap_words],
                slot_count,
                free_count: slot_count,
            }),
        }
    }

    /// Atomically scan-and-flip the first free bit. Fails with
    /// `SwapExhausted` when the store is full or has no capacity.
    pub fn alloc_slot(&self) -> Result<usize, VmError> {
        let mut inner = self.inner.lock();
        if inner.free_count == 0 {
            return Err(VmError::SwapExhausted);
        }
        for word_idx in 0..inner.bitmap.len() {
            let word = inner.bitmap[word_idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let slot = word_idx * BITMAP_BITS + bit;
            if slot >= inner.slot_count {
                break;
            }
            inner.bitmap[word_idx] = word | (1u64 << bit);
            inner.free_count -= 1;
            SLOTS_ALLOCATED.fetch_add(1, Ordering::Relaxed);
            return Ok(slot);
        }
        Err(VmError::SwapExhausted)
    }

    /// Clear the slot's bit. Freeing a free slot is a bug in the caller.
    pub fn free_slot(&self, slot: usize) {
        let mut inner = self.inner.lock();
        if slot >= inner.slot_count {
            crate::kerror!("[vm] swap: free of out-of-range slot {}", slot);
            return;
        }
        let word_idx = slot / BITMAP_BITS;
        let mask = 1u64 << (slot % BITMAP_BITS);
        debug_assert!(inner.bitmap[word_idx] & mask != 0, "double free of swap slot");
        if inner.bitmap[word_idx] & mask != 0 {
            inner.bitmap[word_idx] &= !mask;
            inner.free_count += 1;
        }
    }

    /// Write one page of data across the slot's sector range.
    pub fn write_slot(&self, slot: usize, data: &[u8]) -> Result<(), VmError> {
        debug_assert_eq!(data.len(), PAGE_SIZE as usize);
        let mut inner = self.inner.lock();
        if slot >= inner.slot_count {
            return Err(VmError::InvalidArgument);
        }
        let dev = inner.device.as_mut().ok_or(VmError::SwapExhausted)?;
        let base = slot as u64 * SECTORS_PER_SLOT;
        let mut buf = [0u8; SECTOR_SIZE];
        for s in 0..SECTORS_PER_SLOT {
            let start = (s as usize) * SECTOR_SIZE;
            buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
            dev.write_sector(base + s, &buf).map_err(|_| VmError::Io)?;
        }
        Ok(())
    }

    /// Read one page of data from the slot's sector range. Returns
    /// exactly the bytes last written for this slot.
    pub fn read_slot(&self, slot: usize, data: &mut [u8]) -> Result<(), VmError> {
        debug_assert_eq!(data.len(), PAGE_SIZE as usize);
        let mut inner = self.inner.lock();
        if slot >= inner.slot_count {
            return Err(VmError::InvalidArgument);
        }
        let dev = inner.device.as_mut().ok_or(VmError::SwapExhausted)?;
        let base = slot as u64 * SECTORS_PER_SLOT;
        let mut buf = [0u8; SECTOR_SIZE];
        for s in 0..SECTORS_PER_SLOT {
            dev.read_sector(base + s, &mut buf).map_err(|_| VmError::Io)?;
            let start = (s as usize) * SECTOR_SIZE;
            data[start..start + SECTOR_SIZE].copy_from_slice(&buf);
        }
        Ok(())
    }

    /// Total slot capacity
    pub fn slot_count(&self) -> usize {
        self.inner.lock().slot_count
    }

    /// Slots currently free
    pub fn free_slots(&self) -> usize {
        self.inner.lock().free_count
    }
}

/// Slots handed out since boot
pub fn slots_allocated() -> u64 {
    SLOTS_ALLOCATED.load(Ordering::Relaxed)
}
