//! Device-side surface of the VGC command-submission engine.
//!
//! This crate models the kernel/device boundary the command stream submits
//! through, while keeping the transport itself behind a narrow trait:
//! - [`Transport`] is the ioctl-style boundary: context attach/detach, binary
//!   signals, and atomic commit of a buffer region plus its pending signal
//!   queue.
//! - [`Device`] owns the cross-stream shared state: the submit-order critical
//!   section (fence allocation must be observed in commit order across all
//!   streams on one device) and the device-wide buffer-object table lock.
//! - [`Bo`] is a device-addressable allocation referenced by command words,
//!   with the per-stream cache that makes relocation registration O(1) in the
//!   common case.
//! - [`EmuTransport`] is an in-memory transport used for testing without real
//!   hardware; it can complete submissions immediately or under test control.
#![forbid(unsafe_code)]

pub mod bo;
pub mod device;
pub mod emu;
pub mod error;
pub mod transport;

pub use bo::{Bo, BoCache, BoFlags};
pub use device::{Device, FenceAllocator, StreamId};
pub use emu::{CompletionMode, EmuTransport};
pub use error::DeviceError;
pub use transport::{
    CommitRegion, ContextHandle, SignalId, SignalRequest, SignalStage, Submission, Transport,
};
