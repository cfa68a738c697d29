//! The narrow boundary between the command-stream engine and the
//! kernel/device layer.
//!
//! Everything the engine consumes from the device fits in [`Transport`]:
//! attach/detach of a hardware context, kernel-visible binary signals, and an
//! atomic commit of a committed buffer region plus the queue of pending
//! signal requests. Real hardware would implement this over an ioctl-style
//! interface; tests use [`crate::EmuTransport`].

use std::time::Duration;

use crate::error::DeviceError;

/// Handle for a kernel-level binary signal.
///
/// Signals are auto-reset: a successful wait consumes the fired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(pub u32);

/// Opaque per-stream hardware context handle, obtained from
/// [`Transport::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Pipeline stage at which a queued signal fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStage {
    /// The command front-end has fetched past the queued point. Used for
    /// buffer-reusable signals: once the front-end is past a buffer, the
    /// writer may overwrite it.
    Command,
    /// The pixel engine has drained all work up to the queued point. Used for
    /// fence-reached and finish signals.
    Pixel,
}

/// One entry in a submission's pending signal queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalRequest {
    /// Fire a user-visible binary signal when `stage` reaches this point.
    User { signal: SignalId, stage: SignalStage },
    /// Advance the device's completed-fence watermark to `fence` when `stage`
    /// reaches this point.
    FenceReached { fence: u32, stage: SignalStage },
}

/// The committed region of a command buffer.
///
/// `start`/`end` are word offsets into the buffer; the region includes the
/// head margin the device may overwrite with a pipe-switch sequence. `words`
/// is the committed content as handed to the device (the device reads the
/// buffer by `device_address`; the copy exists so emulated transports and
/// tests can observe what was submitted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRegion {
    pub device_address: u32,
    pub start: u32,
    pub end: u32,
    pub words: Vec<u32>,
}

/// One atomic commit: an optional buffer region plus the drained signal
/// queue, covered by `fence` when the region is present.
///
/// A submission with `region: None` is a signal-only commit; the reference
/// protocol uses it to deliver queued completion notifications without
/// issuing a spurious empty buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub context: ContextHandle,
    pub region: Option<CommitRegion>,
    pub signals: Vec<SignalRequest>,
    pub fence: Option<u32>,
}

/// Kernel/device transport consumed by the engine.
pub trait Transport: Send + Sync {
    /// Attach a hardware context for a new stream.
    fn attach(&self) -> Result<ContextHandle, DeviceError>;

    /// Detach a context. All submissions against it must already be retired.
    fn detach(&self, context: ContextHandle) -> Result<(), DeviceError>;

    /// Create an auto-reset binary signal in the unfired state.
    fn signal_new(&self) -> Result<SignalId, DeviceError>;

    fn signal_destroy(&self, signal: SignalId) -> Result<(), DeviceError>;

    /// Fire a signal from the host side (the device fires queued signals
    /// itself as submissions retire).
    fn signal_set(&self, signal: SignalId) -> Result<(), DeviceError>;

    /// Block until `signal` fires, consuming the fired state. `None` waits
    /// indefinitely; a bounded wait that elapses returns
    /// [`DeviceError::Timeout`].
    fn signal_wait(&self, signal: SignalId, timeout: Option<Duration>) -> Result<(), DeviceError>;

    /// Hand a submission to the device. Must be atomic with respect to other
    /// commits on the same device; callers serialize through the device's
    /// submit-order lock so fences are committed in allocation order.
    fn commit(&self, submission: Submission) -> Result<(), DeviceError>;
}
