//! VGC command-stream engine.
//!
//! This crate is the user-space half of GPU command submission: it
//! accumulates 32-bit instruction words into a ring of reusable command
//! buffers, tracks which buffer objects the commands reference so their
//! addresses can be patched in and their lifetimes pinned, and submits
//! batches to the device context with fence-ordered completion signals.
//!
//! The flow is one-directional: the encoder layer calls
//! [`CmdStream::reserve`], emits words and relocations into the active
//! buffer, and either lets a full buffer trigger a flush or calls
//! [`CmdStream::flush`] / [`CmdStream::finish`] explicitly. The engine
//! guarantees three invariants under concurrent buffer-object release:
//! the writer never overwrites a buffer still in flight, fences are committed
//! in allocation order, and a buffer object is never freed while an
//! outstanding submission references it.
#![forbid(unsafe_code)]

mod bo_table;
mod queue;
mod ring;

pub mod error;
pub mod stream;

pub use error::StreamError;
pub use stream::{CmdStream, Reloc, RelocFlags, ResetObserver, StreamConfig};
