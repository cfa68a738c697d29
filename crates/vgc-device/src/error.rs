use thiserror::Error;

use crate::transport::SignalId;

/// Errors surfaced by the device/transport boundary.
///
/// The reference behavior for most of these conditions was to abort the
/// process; here every one of them is a typed result so the caller can tear
/// the stream down cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("context attach rejected: {0}")]
    Attach(&'static str),

    #[error("context detach rejected: {0}")]
    Detach(&'static str),

    #[error("commit rejected: {0}")]
    Commit(&'static str),

    #[error("signal creation rejected: {0}")]
    SignalCreate(&'static str),

    #[error("unknown signal {0:?}")]
    UnknownSignal(SignalId),

    #[error("wait on signal {signal:?} timed out after {waited_ms} ms")]
    Timeout { signal: SignalId, waited_ms: u64 },
}
