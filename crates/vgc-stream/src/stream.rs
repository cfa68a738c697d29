//! The command stream: ring management, the flush/finish state machine, and
//! relocation emission.

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, trace};

use vgc_device::{
    Bo, BoFlags, CommitRegion, ContextHandle, Device, SignalId, SignalStage, StreamId, Submission,
};

use crate::bo_table::BoTable;
use crate::error::StreamError;
use crate::queue::SignalQueue;
use crate::ring::CmdBuffer;

bitflags! {
    /// Access direction of a relocation, used to decide which retirement
    /// timestamps a BO gets stamped with at flush.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RelocFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// A deferred device-address patch: resolves to
/// `bo.device_address() + offset` at emission time.
#[derive(Debug, Clone, Copy)]
pub struct Reloc<'a> {
    pub bo: &'a Arc<Bo>,
    pub offset: u32,
    pub flags: RelocFlags,
}

/// Callback invoked synchronously, on the calling thread, immediately after
/// every ring rotation, so the client can re-emit hardware state invalidated
/// by switching buffers.
pub type ResetObserver = Box<dyn FnMut(&mut CmdStream) + Send>;

/// Command-stream tuning.
///
/// The defaults mirror the reference device family: five ring slots of 32 KiB
/// each, with 8-word head and tail clearances the device overwrites with
/// pipe-switch and link commands.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ring_slots: usize,
    /// Slot capacity in 32-bit words.
    pub slot_words: u32,
    /// Words reserved at the start of every committed region for
    /// device-inserted pipe-switch commands. Client writes must never touch
    /// this range.
    pub head_margin_words: u32,
    /// Words reserved at the end of a slot for device-inserted link/jump
    /// commands.
    pub tail_margin_words: u32,
    /// Bound on rotation and finish waits. `None` waits indefinitely (the
    /// reference behavior); bounded waits surface [`StreamError::Timeout`].
    pub wait_timeout: Option<Duration>,
    /// After this many flushes without an observed device acknowledgment the
    /// active slot is forced exhausted, so the next reserve rotates.
    /// Workaround for a device class that loses track of buffers carrying
    /// too many unacknowledged submissions.
    pub unsignaled_flush_limit: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ring_slots: 5,
            slot_words: 8192,
            head_margin_words: 8,
            tail_margin_words: 8,
            wait_timeout: None,
            unsignaled_flush_limit: 16,
        }
    }
}

impl StreamConfig {
    fn validate(&self) -> Result<(), StreamError> {
        if self.ring_slots < 2 {
            return Err(StreamError::InvalidConfig("ring needs at least two slots"));
        }
        if self.slot_words > u32::MAX / 4 {
            return Err(StreamError::InvalidConfig("slot size overflows byte count"));
        }
        if self.head_margin_words + self.tail_margin_words >= self.slot_words {
            return Err(StreamError::InvalidConfig(
                "slot too small for head and tail margins",
            ));
        }
        if self.unsignaled_flush_limit == 0 {
            return Err(StreamError::InvalidConfig(
                "unsignaled flush limit must be at least one",
            ));
        }
        Ok(())
    }
}

fn align_up_words(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// The command-submission engine for one logical rendering context.
///
/// Owns the ring of command buffers, the write cursor, the BO reference
/// table, and the hardware context it submits through. Created once per
/// context; dropping the stream tears down its device resources in order
/// (queue, ring buffers and their signals, finish signal, context).
pub struct CmdStream {
    device: Arc<Device>,
    id: StreamId,
    config: StreamConfig,
    context: ContextHandle,
    finish_signal: SignalId,
    ring: Vec<CmdBuffer>,
    current: usize,
    /// Write position in words within the active slot. Always <= `end`.
    cursor: u32,
    /// Writable limit: slot capacity minus the tail margin.
    end: u32,
    table: BoTable,
    queue: SignalQueue,
    /// Fence of the most recently committed buffer (0 = none yet).
    submit_fence: u32,
    /// Flushes since the last observed device acknowledgment (rotation).
    unsignaled_flushes: u32,
    reset_notify: Option<ResetObserver>,
}

impl CmdStream {
    pub fn new(device: Arc<Device>, config: StreamConfig) -> Result<Self, StreamError> {
        Self::with_observer(device, config, None)
    }

    /// Create a stream, attaching a hardware context and building the ring.
    ///
    /// Construction is transactional: on any failure every already-created
    /// signal is destroyed and the context detached, and no stream is
    /// returned.
    pub fn with_observer(
        device: Arc<Device>,
        config: StreamConfig,
        reset_notify: Option<ResetObserver>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let transport = Arc::clone(device.transport());
        let context = transport.attach().map_err(StreamError::from)?;

        let mut created: Vec<SignalId> = Vec::new();
        let parts = (|| -> Result<(SignalId, Vec<CmdBuffer>), StreamError> {
            let finish_signal = transport.signal_new()?;
            created.push(finish_signal);
            let mut ring = Vec::with_capacity(config.ring_slots);
            for _ in 0..config.ring_slots {
                let bo = device.new_bo(config.slot_words * 4, BoFlags::COMMAND);
                let reuse = transport.signal_new()?;
                created.push(reuse);
                // Fresh slots are immediately reusable.
                transport.signal_set(reuse)?;
                ring.push(CmdBuffer::new(bo, config.slot_words, reuse));
            }
            Ok((finish_signal, ring))
        })();

        let (finish_signal, ring) = match parts {
            Ok(parts) => parts,
            Err(err) => {
                for signal in created {
                    let _ = transport.signal_destroy(signal);
                }
                let _ = transport.detach(context);
                return Err(err);
            }
        };

        let id = device.mint_stream_id();
        let end = config.slot_words - config.tail_margin_words;
        let mut stream = Self {
            device,
            id,
            // Start "before" slot 0 so the initial rotation lands there; a
            // stream is never observable without an active buffer.
            current: config.ring_slots - 1,
            config,
            context,
            finish_signal,
            ring,
            cursor: 0,
            end,
            table: BoTable::new(),
            queue: SignalQueue::new(),
            submit_fence: 0,
            unsignaled_flushes: 0,
            reset_notify,
        };
        // Make sure there is an active buffer before handing the stream out.
        stream.next_buffer()?;
        Ok(stream)
    }

    /// Current write position, in words, within the active slot.
    pub fn offset(&self) -> u32 {
        self.cursor
    }

    /// Words still writable before the tail margin.
    pub fn avail(&self) -> u32 {
        self.end.saturating_sub(self.cursor)
    }

    /// Fence of the most recently committed buffer (0 = nothing committed).
    pub fn timestamp(&self) -> u32 {
        self.submit_fence
    }

    /// Index of the active ring slot.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Number of distinct BOs currently referenced by this accumulation.
    pub fn referenced_bo_count(&self) -> usize {
        self.table.len()
    }

    /// Ensure at least `n` words are writable at the cursor.
    ///
    /// Fast path is a no-op. Otherwise the active buffer is flushed and, if
    /// its recomputed window still cannot hold `n`, the stream rotates to
    /// the next ring slot, blocking until that slot's reuse signal fires.
    pub fn reserve(&mut self, n: u32) -> Result<(), StreamError> {
        let slot = &self.ring[self.current];
        if !slot.exhausted && self.cursor.saturating_add(n) <= self.end {
            return Ok(());
        }
        self.reserve_internal(n)
    }

    fn reserve_internal(&mut self, n: u32) -> Result<(), StreamError> {
        // A cursor past the writable limit means an earlier emit overran its
        // reservation; catch it before committing corrupt state.
        if self.cursor > self.end {
            return Err(StreamError::ProtocolViolation {
                cursor: self.cursor,
                limit: self.end,
            });
        }
        let max_window = self.end - self.config.head_margin_words;
        if n > max_window {
            return Err(StreamError::ProtocolViolation {
                cursor: self.config.head_margin_words.saturating_add(n),
                limit: self.end,
            });
        }
        self.flush()?;
        let slot = &self.ring[self.current];
        if !slot.exhausted && self.cursor.saturating_add(n) <= self.end {
            return Ok(());
        }
        // Rotating away from a slot whose commits never armed its reuse
        // signal would leave the next lap waiting forever. Arm it with a
        // signal-only commit before leaving; the device retires signals in
        // submission order, so it fires only after every commit of this
        // activation.
        if !self.ring[self.current].reuse_armed {
            let reuse = self.ring[self.current].reuse_signal;
            self.queue.queue_signal(reuse, SignalStage::Command);
            self.flush()?;
            self.ring[self.current].reuse_armed = true;
        }
        self.next_buffer()
    }

    /// Write one word at the cursor and advance.
    ///
    /// The caller must have reserved room; this path stays branch-free and
    /// only checks the contract in debug builds.
    #[inline]
    pub fn emit(&mut self, word: u32) {
        debug_assert!(self.cursor < self.end, "emit without sufficient reservation");
        self.ring[self.current].words[self.cursor as usize] = word;
        self.cursor += 1;
    }

    /// Read a previously written word at an absolute offset in the active
    /// slot.
    pub fn get(&self, offset: u32) -> Result<u32, StreamError> {
        if offset >= self.cursor {
            return Err(StreamError::ProtocolViolation {
                cursor: offset,
                limit: self.cursor,
            });
        }
        Ok(self.ring[self.current].words[offset as usize])
    }

    /// Patch a previously written word at an absolute offset in the active
    /// slot.
    pub fn set(&mut self, offset: u32, word: u32) -> Result<(), StreamError> {
        if offset >= self.cursor {
            return Err(StreamError::ProtocolViolation {
                cursor: offset,
                limit: self.cursor,
            });
        }
        self.ring[self.current].words[offset as usize] = word;
        Ok(())
    }

    /// Emit a relocation: the resolved device address of `reloc`, or a zero
    /// word for `None` (the legal "no relocation" encoding).
    ///
    /// Registers the BO in the stream's table so its address stays valid and
    /// its lifetime covers the submission.
    pub fn write_reloc(&mut self, reloc: Option<&Reloc<'_>>) -> Result<(), StreamError> {
        let address = match reloc {
            None => 0,
            Some(r) => {
                let base = r.bo.device_address();
                let address =
                    base.checked_add(r.offset)
                        .ok_or(StreamError::InvalidAddress {
                            address: base,
                            offset: r.offset,
                        })?;
                let device = Arc::clone(&self.device);
                self.table.register(&device, self.id, r.bo, r.flags)?;
                address
            }
        };
        self.emit(address);
        Ok(())
    }

    /// Register a BO with the stream without emitting a word.
    pub fn ref_bo(&mut self, bo: &Arc<Bo>, flags: RelocFlags) -> Result<(), StreamError> {
        let device = Arc::clone(&self.device);
        self.table.register(&device, self.id, bo, flags)?;
        Ok(())
    }

    /// Commit the accumulated region and queued signals to the device.
    ///
    /// With nothing written and nothing queued this is a true no-op. With an
    /// empty buffer but queued signals, the signals are still submitted
    /// (signal-only commit) so completion notifications are never dropped.
    /// Otherwise: a fresh fence is allocated, the fence-reached signal is
    /// queued, every table BO is released with its retirement timestamps
    /// stamped, and buffer plus signal queue are committed as one unit
    /// inside the device-wide submit-order critical section. The slot's
    /// write window is then recomputed; a window too small for the margins,
    /// or too many unacknowledged flushes, mark the slot exhausted so the
    /// next reserve rotates. The slot's binary reuse signal rides only on
    /// the commit that exhausts the slot: armed per partial commit, one
    /// early retirement could satisfy a later rotation while newer commits
    /// of the same slot are still in flight.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        let device = Arc::clone(&self.device);
        let transport = Arc::clone(device.transport());
        let start_offset = self.ring[self.current].start_offset;
        let head = self.config.head_margin_words;

        if self.cursor <= start_offset + head {
            if self.queue.is_empty() {
                return Ok(());
            }
            let _order = device.submit_order();
            let submission = Submission {
                context: self.context,
                region: None,
                signals: self.queue.drain(),
                fence: None,
            };
            transport.commit(submission).map_err(StreamError::from)?;
            debug!("signal-only commit");
            return Ok(());
        }
        if self.cursor > self.end {
            return Err(StreamError::ProtocolViolation {
                cursor: self.cursor,
                limit: self.end,
            });
        }

        let tail = self.config.tail_margin_words;
        let capacity = self.ring[self.current].capacity_words();
        let new_start = align_up_words(self.cursor, 2);
        let abandons = new_start + head + tail > capacity
            || self.unsignaled_flushes + 1 >= self.config.unsignaled_flush_limit;

        // Fence allocation through commit is one critical section so fences
        // reach the device in allocation order across all streams.
        let mut order = device.submit_order();
        let fence = order.allocate();
        self.queue.queue_fence_reached(fence);
        self.table.release_all(&device, self.id, fence);
        let (reuse_signal, device_address) = {
            let slot = &self.ring[self.current];
            (slot.reuse_signal, slot.bo.device_address())
        };
        if abandons {
            self.queue.queue_signal(reuse_signal, SignalStage::Command);
        }
        let words = self.ring[self.current].words[start_offset as usize..self.cursor as usize]
            .to_vec();
        let submission = Submission {
            context: self.context,
            region: Some(CommitRegion {
                device_address,
                start: start_offset,
                end: self.cursor,
                words,
            }),
            signals: self.queue.drain(),
            fence: Some(fence),
        };
        transport.commit(submission).map_err(StreamError::from)?;
        order.mark_submitted(fence);
        drop(order);

        self.submit_fence = fence;
        self.unsignaled_flushes += 1;
        debug!(fence, slot = self.current, "committed buffer");

        // Open the next write window in the same slot, 64-bit aligned.
        let slot = &mut self.ring[self.current];
        slot.start_offset = new_start;
        if abandons {
            slot.exhausted = true;
            slot.reuse_armed = true;
        }
        self.cursor = (new_start + head).min(self.end);
        Ok(())
    }

    /// Flush and block until every fence allocated before the call has
    /// retired.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        self.queue
            .queue_signal(self.finish_signal, SignalStage::Pixel);
        self.flush()?;
        let transport = Arc::clone(self.device.transport());
        trace!("waiting for finish signal");
        transport
            .signal_wait(self.finish_signal, self.config.wait_timeout)
            .map_err(StreamError::from)?;
        self.unsignaled_flushes = 0;
        Ok(())
    }

    /// Rotate to the next ring slot, blocking until its reuse signal fires.
    fn next_buffer(&mut self) -> Result<(), StreamError> {
        let next = (self.current + 1) % self.ring.len();
        let signal = self.ring[next].reuse_signal;
        let transport = Arc::clone(self.device.transport());
        trace!(slot = next, "waiting for ring slot reuse signal");
        transport
            .signal_wait(signal, self.config.wait_timeout)
            .map_err(StreamError::from)?;
        self.ring[next].reset();
        self.current = next;
        self.cursor = self.config.head_margin_words;
        self.unsignaled_flushes = 0;
        trace!(slot = next, "rotated to ring slot");
        self.notify_reset();
        Ok(())
    }

    fn notify_reset(&mut self) {
        if let Some(mut notify) = self.reset_notify.take() {
            notify(self);
            self.reset_notify = Some(notify);
        }
    }
}

impl Drop for CmdStream {
    fn drop(&mut self) {
        let device = Arc::clone(&self.device);
        let transport = Arc::clone(device.transport());
        // References from an accumulation that never flushed: no fence
        // covers them, so they are discarded without timestamp stamping.
        self.table.discard_all(&device, self.id);
        self.queue.clear();
        for slot in &self.ring {
            if let Err(err) = transport.signal_destroy(slot.reuse_signal) {
                debug!(?err, "reuse signal destroy failed during teardown");
            }
        }
        // Ring buffer objects are released with their slots.
        self.ring.clear();
        if let Err(err) = transport.signal_destroy(self.finish_signal) {
            debug!(?err, "finish signal destroy failed during teardown");
        }
        if let Err(err) = transport.detach(self.context) {
            debug!(?err, "context detach failed during teardown");
        }
    }
}
