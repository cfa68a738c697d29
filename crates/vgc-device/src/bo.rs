//! Buffer objects: device-addressable allocations referenced by command
//! words.
//!
//! A stream holds a strong reference (an `Arc` clone) for every BO that
//! appears in its relocation table, and drops it only after the fence
//! covering the submission has been allocated and stamped into the BO's
//! retirement timestamps. The per-BO cache (`current_stream` + `index`) is
//! the fast path for repeated relocations against the same stream; it is
//! mutated only while holding the owning device's BO-table lock.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;

use crate::device::StreamId;

bitflags! {
    /// Usage class of a buffer object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoFlags: u32 {
        /// Command buffer backing a ring slot.
        const COMMAND = 1 << 0;
        const VERTEX = 1 << 1;
        const INDEX = 1 << 2;
        const TEXTURE = 1 << 3;
        const RENDER_TARGET = 1 << 4;
    }
}

/// Mutable per-BO state shared across streams.
#[derive(Debug, Clone, Copy)]
pub struct BoCache {
    /// Stream whose table currently caches this BO, if any. This is a weak
    /// back-reference by identifier; it never implies ownership and is only
    /// meaningful while the named stream still holds the BO in its table.
    pub current_stream: Option<StreamId>,
    /// Table index cached for `current_stream`. Valid only while
    /// `current_stream` points at the stream reading it.
    pub index: u32,
    /// Fence of the last submission that wrote through this BO.
    pub timestamp_write: u32,
    /// Fence of the last submission that referenced this BO at all.
    pub timestamp_any: u32,
}

/// A device-addressable memory allocation.
#[derive(Debug)]
pub struct Bo {
    device_address: u32,
    size: u32,
    flags: BoFlags,
    cache: Mutex<BoCache>,
}

impl Bo {
    pub(crate) fn new(device_address: u32, size: u32, flags: BoFlags) -> Self {
        Self {
            device_address,
            size,
            flags,
            cache: Mutex::new(BoCache {
                current_stream: None,
                index: 0,
                timestamp_write: 0,
                timestamp_any: 0,
            }),
        }
    }

    /// Device-visible address of the allocation.
    pub fn device_address(&self) -> u32 {
        self.device_address
    }

    /// Size of the allocation in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    /// Lock the shared cache. Callers mutating `current_stream`/`index` must
    /// hold the device BO-table lock around this.
    pub fn cache(&self) -> MutexGuard<'_, BoCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fence of the last submission that referenced this BO (0 = never
    /// submitted).
    pub fn timestamp(&self) -> u32 {
        self.cache().timestamp_any
    }
}
