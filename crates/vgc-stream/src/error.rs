use thiserror::Error;

use vgc_device::DeviceError;

/// Errors surfaced by the command-stream engine.
///
/// `ProtocolViolation` and `DeviceCommit` during the reserve/flush path are
/// unrecoverable for the stream: the accumulated buffer state cannot be
/// partially un-committed, so callers should tear the stream down rather
/// than retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("relocation of address {address:#x} + offset {offset:#x} overflows the device address space")]
    InvalidAddress { address: u32, offset: u32 },

    #[error("buffer-object table exceeded its bound of {limit} entries")]
    ResourceExhausted { limit: usize },

    #[error(
        "write cursor {cursor} exceeds writable limit {limit} words \
         (command accounting bug in the caller)"
    )]
    ProtocolViolation { cursor: u32, limit: u32 },

    #[error("device rejected operation: {0}")]
    DeviceCommit(#[source] DeviceError),

    #[error("wait did not observe its signal within {waited_ms} ms")]
    Timeout { waited_ms: u64 },
}

impl From<DeviceError> for StreamError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Timeout { waited_ms, .. } => StreamError::Timeout { waited_ms },
            other => StreamError::DeviceCommit(other),
        }
    }
}
