//! Userspace access to eBPF maps and ring buffers pinned by an external loader.
//!
//! [`BpfMap`] gives a typed key/value view whose access mode is part of its
//! type, [`RawMap`] the same over byte vectors, and [`BpfRingbuf`] drains a
//! kernel ring buffer through shared memory. [`sys`] is the thin syscall
//! layer underneath them all.

pub mod dump;
pub mod error;
pub mod kernel;
pub mod map;
pub mod raw_map;
pub mod ringbuf;
pub mod sys;

#[cfg(test)]
mod testing;

pub use bpfkit_common as abi;
pub use error::{Error, Result};
pub use map::mode::{ReadOnly, ReadWrite, WriteOnly};
pub use map::{BpfMap, BpfMapRO, BpfMapWO, MapRead, MapSchema, MapWrite, Pod};
pub use raw_map::RawMap;
pub use ringbuf::{BpfRingbuf, BpfRingbufBase};
