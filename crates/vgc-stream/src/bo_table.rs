//! Per-stream buffer-object reference table with deduplication.
//!
//! Every BO referenced by a stream's relocations appears at most once in the
//! table, so repeated references reuse the same index and reference-counting
//! stays balanced. Entries are only ever removed in bulk at flush time; a BO
//! stays in the table for the whole accumulation of one buffer.

use std::sync::Arc;

use vgc_device::{Bo, Device, StreamId};

use crate::error::StreamError;
use crate::stream::RelocFlags;

/// Entries the table starts with room for; growth past this is amortized
/// doubling via `Vec`.
const SOFT_CAP: usize = 64;
/// Hard bound on table size: relocation indices are encoded in 16 bits by
/// the device family, so a table past this cannot be patched.
const HARD_BOUND: usize = 1 << 16;

struct Entry {
    bo: Arc<Bo>,
    /// Accumulated access flags across every relocation of this BO in the
    /// current accumulation; decides which retirement timestamps get stamped
    /// on release.
    flags: RelocFlags,
}

pub(crate) struct BoTable {
    entries: Vec<Entry>,
}

impl BoTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::with_capacity(SOFT_CAP),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Register `bo` for this stream and return its table index.
    ///
    /// Fast paths: a BO cached against this stream returns its cached index;
    /// an unattached BO is appended and cached. Slow path: a BO cached
    /// against a *different* stream (shared across streams) is looked up by
    /// scanning this table, appended if absent, and its cache is left
    /// pointing at the other stream.
    pub(crate) fn register(
        &mut self,
        device: &Device,
        stream: StreamId,
        bo: &Arc<Bo>,
        flags: RelocFlags,
    ) -> Result<u32, StreamError> {
        let _table_lock = device.bo_lock();
        let mut cache = bo.cache();
        let index = match cache.current_stream {
            None => {
                let index = self.append(bo, flags)?;
                cache.current_stream = Some(stream);
                cache.index = index;
                index
            }
            Some(owner) if owner == stream => {
                let index = cache.index;
                self.entries[index as usize].flags |= flags;
                index
            }
            Some(_) => {
                match self
                    .entries
                    .iter()
                    .position(|entry| Arc::ptr_eq(&entry.bo, bo))
                {
                    Some(found) => {
                        self.entries[found].flags |= flags;
                        found as u32
                    }
                    None => self.append(bo, flags)?,
                }
            }
        };
        Ok(index)
    }

    fn append(&mut self, bo: &Arc<Bo>, flags: RelocFlags) -> Result<u32, StreamError> {
        if self.entries.len() >= HARD_BOUND {
            return Err(StreamError::ResourceExhausted { limit: HARD_BOUND });
        }
        self.entries.push(Entry {
            bo: Arc::clone(bo),
            flags,
        });
        Ok((self.entries.len() - 1) as u32)
    }

    /// Release every reference in bulk, stamping retirement timestamps with
    /// the fence covering the submission that used them.
    ///
    /// A BO's cache is cleared only if it still points at this stream;
    /// clearing unconditionally would invalidate another stream's live
    /// cached index for a shared BO.
    pub(crate) fn release_all(&mut self, device: &Device, stream: StreamId, fence: u32) {
        let _table_lock = device.bo_lock();
        for entry in self.entries.drain(..) {
            let mut cache = entry.bo.cache();
            if cache.current_stream == Some(stream) {
                cache.current_stream = None;
            }
            if entry.flags.contains(RelocFlags::WRITE) {
                cache.timestamp_write = fence;
            }
            cache.timestamp_any = fence;
        }
    }

    /// Drop every reference without touching retirement timestamps, for
    /// references accumulated after the last commit: no fence ever covered
    /// them, so stamping one would make the BOs read as retired at a
    /// submission that never used them.
    pub(crate) fn discard_all(&mut self, device: &Device, stream: StreamId) {
        let _table_lock = device.bo_lock();
        for entry in self.entries.drain(..) {
            let mut cache = entry.bo.cache();
            if cache.current_stream == Some(stream) {
                cache.current_stream = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vgc_device::{BoFlags, EmuTransport};

    fn device() -> Arc<Device> {
        Device::new(Arc::new(EmuTransport::immediate()))
    }

    #[test]
    fn repeated_registration_reuses_the_index() {
        let device = device();
        let stream = device.mint_stream_id();
        let bo = device.new_bo(256, BoFlags::VERTEX);
        let mut table = BoTable::new();

        let a = table.register(&device, stream, &bo, RelocFlags::READ).unwrap();
        let b = table.register(&device, stream, &bo, RelocFlags::READ).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        // One strong reference held by the table, one by the test.
        assert_eq!(Arc::strong_count(&bo), 2);
    }

    #[test]
    fn shared_bo_gets_one_slot_per_stream() {
        let device = device();
        let stream_a = device.mint_stream_id();
        let stream_b = device.mint_stream_id();
        let bo = device.new_bo(256, BoFlags::TEXTURE);
        let mut table_a = BoTable::new();
        let mut table_b = BoTable::new();

        table_a
            .register(&device, stream_a, &bo, RelocFlags::READ)
            .unwrap();
        // The BO is cached against stream A; stream B takes the slow path.
        let first = table_b
            .register(&device, stream_b, &bo, RelocFlags::READ)
            .unwrap();
        let second = table_b
            .register(&device, stream_b, &bo, RelocFlags::READ)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(table_a.len(), 1);
        assert_eq!(table_b.len(), 1);
        assert_eq!(Arc::strong_count(&bo), 3);

        // A's cache entry must survive B's release.
        table_b.release_all(&device, stream_b, 5);
        assert_eq!(bo.cache().current_stream, Some(stream_a));
        table_a.release_all(&device, stream_a, 6);
        assert_eq!(bo.cache().current_stream, None);
        assert_eq!(Arc::strong_count(&bo), 1);
    }

    #[test]
    fn release_stamps_write_timestamp_only_for_writes() {
        let device = device();
        let stream = device.mint_stream_id();
        let read_bo = device.new_bo(64, BoFlags::TEXTURE);
        let write_bo = device.new_bo(64, BoFlags::RENDER_TARGET);
        let mut table = BoTable::new();

        table
            .register(&device, stream, &read_bo, RelocFlags::READ)
            .unwrap();
        table
            .register(&device, stream, &write_bo, RelocFlags::WRITE)
            .unwrap();
        table.release_all(&device, stream, 42);

        assert_eq!(read_bo.cache().timestamp_any, 42);
        assert_eq!(read_bo.cache().timestamp_write, 0);
        assert_eq!(write_bo.cache().timestamp_write, 42);
        assert_eq!(write_bo.cache().timestamp_any, 42);
    }
}
