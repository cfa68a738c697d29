//! Pending signal queue: completion requests accumulated between commits.

use vgc_device::{SignalId, SignalRequest, SignalStage};

/// FIFO of signal requests drained into the next submission.
///
/// This decouples "the buffer has bytes" from "there is work for the device
/// to acknowledge": a flush with an empty buffer but a non-empty queue still
/// submits, signal-only.
#[derive(Debug, Default)]
pub(crate) struct SignalQueue {
    pending: Vec<SignalRequest>,
}

impl SignalQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn queue_signal(&mut self, signal: SignalId, stage: SignalStage) {
        self.pending.push(SignalRequest::User { signal, stage });
    }

    /// Queue a fence-reached notification at pixel-engine granularity.
    pub(crate) fn queue_fence_reached(&mut self, fence: u32) {
        self.pending.push(SignalRequest::FenceReached {
            fence,
            stage: SignalStage::Pixel,
        });
    }

    pub(crate) fn drain(&mut self) -> Vec<SignalRequest> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
