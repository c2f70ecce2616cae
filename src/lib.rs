//! A memory-mapped, file-backed flight-recorder tracing substrate:
//! cross-process ring buffers with CRC-framed entries, a content-addressed
//! metadata dictionary, and the robust-mutex write protocol that lets many
//! producer threads and processes share one tracebuffer file safely.
//!
//! See `crc8`/`mutex` for the primitives, `ring`/`stack`/`definition` for
//! the three sections a tracebuffer file is built from, `tracebuffer` for
//! assembly and the file manager, `tracepoint`/`codec` for the write path,
//! `live` for the streaming consumer, and `snapshot` for archiving.

#[macro_use]
extern crate failure_derive;

pub mod codec;
pub mod crc8;
pub mod definition;
pub mod error;
pub mod live;
pub mod mutex;
pub mod platform;
pub mod ring;
pub mod snapshot;
pub mod stack;
pub mod tracebuffer;
pub mod tracepoint;

pub use error::{Error, Result};
