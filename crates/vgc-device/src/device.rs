//! The device object: cross-stream shared state for one GPU.
//!
//! Two pieces of state are shared by every stream created against a device,
//! and they are the only cross-stream state in the engine:
//! - the submit-order lock, a single critical section spanning
//!   allocate-fence -> enqueue-signals -> commit so that fence values are
//!   observed by the device in allocation order, and
//! - the BO-table lock, guarding every BO's `current_stream`/`index` cache
//!   and every stream's table mutation (a BO can be referenced from any
//!   stream at any time).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::bo::{Bo, BoFlags};
use crate::transport::Transport;

/// Identifier for a command stream on one device.
///
/// BOs keep a `StreamId` as a weak back-reference to the stream caching them;
/// it is never dereferenced, only compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

/// Monotonic fence allocator plus the committed-fence record, guarded by the
/// device submit-order lock.
///
/// Fences are strictly increasing 32-bit values; 0 is reserved as the
/// "no fence" sentinel. The allocator wraps around `u32::MAX` and skips 0,
/// matching the reference protocol where a wrapped fence is legal but 0 is
/// interpreted as an error value downstream.
#[derive(Debug)]
pub struct FenceAllocator {
    next: u32,
    last_submitted: u32,
}

impl FenceAllocator {
    fn new() -> Self {
        Self {
            next: 1,
            last_submitted: 0,
        }
    }

    /// Allocate the next fence value, never returning the reserved 0.
    pub fn allocate(&mut self) -> u32 {
        loop {
            let fence = self.next;
            self.next = self.next.wrapping_add(1);
            if fence != 0 {
                return fence;
            }
        }
    }

    /// Record `fence` as committed to the device.
    pub fn mark_submitted(&mut self, fence: u32) {
        self.last_submitted = fence;
    }

    /// Most recently committed fence on this device (0 = none yet).
    pub fn last_submitted(&self) -> u32 {
        self.last_submitted
    }
}

/// One GPU device as seen by the command-stream engine.
pub struct Device {
    transport: Arc<dyn Transport>,
    submit_order: Mutex<FenceAllocator>,
    bo_lock: Mutex<()>,
    next_stream_id: AtomicU64,
    next_bo_address: AtomicU32,
}

/// Device addresses are handed out at this alignment.
const BO_ADDRESS_ALIGN: u32 = 64;
/// First device address; 0 is kept invalid so a zero relocation word always
/// means "no relocation".
const BO_ADDRESS_BASE: u32 = 0x1000;

impl Device {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            submit_order: Mutex::new(FenceAllocator::new()),
            bo_lock: Mutex::new(()),
            next_stream_id: AtomicU64::new(1),
            next_bo_address: AtomicU32::new(BO_ADDRESS_BASE),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Enter the device-wide submit-order critical section.
    ///
    /// The guard must be held across fence allocation, signal queueing, and
    /// the transport commit, as one logical unit; no other stream may
    /// interleave a commit inside that window.
    pub fn submit_order(&self) -> MutexGuard<'_, FenceAllocator> {
        self.submit_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the device-wide BO-table lock.
    pub fn bo_lock(&self) -> MutexGuard<'_, ()> {
        self.bo_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recently committed fence on this device (monitoring/debug).
    pub fn last_submitted_fence(&self) -> u32 {
        self.submit_order().last_submitted()
    }

    pub fn mint_stream_id(&self) -> StreamId {
        StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate a buffer object with a stable device address.
    ///
    /// Buffer-object management proper (import, mapping, dumb buffers) lives
    /// outside this engine; the minimal allocation here exists so ring slots
    /// and clients get addresses relocations can resolve against.
    pub fn new_bo(&self, size: u32, flags: BoFlags) -> Arc<Bo> {
        let aligned = size
            .checked_add(BO_ADDRESS_ALIGN - 1)
            .map(|s| s & !(BO_ADDRESS_ALIGN - 1))
            .unwrap_or(u32::MAX & !(BO_ADDRESS_ALIGN - 1));
        let address = self.next_bo_address.fetch_add(aligned, Ordering::Relaxed);
        debug!(address, size, ?flags, "allocated buffer object");
        Arc::new(Bo::new(address, size, flags))
    }
}
