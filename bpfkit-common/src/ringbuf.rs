//! BPF ring buffer record framing.
//!
//! Every record starts with an 8-byte header. The first word holds the payload
//! length with two control bits on top; the second is the page offset the
//! kernel uses to find the owning map. Records are padded to 8 bytes.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Producer has reserved the record but not committed it yet.
pub const BPF_RINGBUF_BUSY_BIT: u32 = 1 << 31;
/// Producer committed the record as discarded; skip its payload.
pub const BPF_RINGBUF_DISCARD_BIT: u32 = 1 << 30;
pub const BPF_RINGBUF_HDR_SZ: u32 = 8;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RingbufHeader {
    pub len: u32,
    pub pg_off: u32,
}

impl RingbufHeader {
    pub const fn is_busy(&self) -> bool {
        self.len & BPF_RINGBUF_BUSY_BIT != 0
    }

    pub const fn is_discarded(&self) -> bool {
        self.len & BPF_RINGBUF_DISCARD_BIT != 0
    }

    pub const fn payload_len(&self) -> u32 {
        self.len & !(BPF_RINGBUF_BUSY_BIT | BPF_RINGBUF_DISCARD_BIT)
    }
}

/// Bytes a record with header word `len` occupies in the ring, header included.
pub const fn round_length(len: u32) -> u32 {
    let len = (len & !(BPF_RINGBUF_BUSY_BIT | BPF_RINGBUF_DISCARD_BIT)) + BPF_RINGBUF_HDR_SZ;
    (len + 7) & !7
}
