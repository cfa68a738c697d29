//! Ring slots: the reusable command buffers cycled through by a stream.

use std::sync::Arc;

use vgc_device::{Bo, SignalId};

/// One slot of the command-buffer ring.
///
/// At any time a slot is in exactly one of three states: free and waitable
/// (its reuse signal will fire, or has fired, since its last commit), active
/// and being written (it is `CmdStream::current`), or committed and awaiting
/// completion. The slot's memory belongs to the buffer-object layer; `words`
/// is the exclusively owned CPU mapping the writer emits through.
pub(crate) struct CmdBuffer {
    /// Backing allocation; provides the device address commits point at.
    pub(crate) bo: Arc<Bo>,
    pub(crate) words: Box<[u32]>,
    /// Base of the region accumulated since the last commit, in words.
    pub(crate) start_offset: u32,
    /// Forces the next reserve to rotate instead of writing a too-small
    /// window (set when the remaining capacity cannot hold the margins, or
    /// by the unsignaled-flush workaround).
    pub(crate) exhausted: bool,
    /// Fires when the device is done reading the slot's last commit.
    /// Created once at stream construction, destroyed at teardown.
    pub(crate) reuse_signal: SignalId,
    /// Whether the reuse signal has been queued behind every commit of the
    /// slot's current activation. The signal is binary, so it must be armed
    /// exactly once per activation, with the last covering commit.
    pub(crate) reuse_armed: bool,
}

impl CmdBuffer {
    pub(crate) fn new(bo: Arc<Bo>, capacity_words: u32, reuse_signal: SignalId) -> Self {
        Self {
            bo,
            words: vec![0u32; capacity_words as usize].into_boxed_slice(),
            start_offset: 0,
            exhausted: false,
            reuse_signal,
            reuse_armed: false,
        }
    }

    pub(crate) fn capacity_words(&self) -> u32 {
        self.words.len() as u32
    }

    /// Prepare the slot for reuse after its reuse signal fired.
    pub(crate) fn reset(&mut self) {
        self.start_offset = 0;
        self.exhausted = false;
        self.reuse_armed = false;
    }
}
