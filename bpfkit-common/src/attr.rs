//! Fixed-layout argument blocks for the `bpf(2)` system call.
//!
//! The kernel's `union bpf_attr` is modelled as a zeroed byte block; each
//! command writes its own struct into the prefix. The kernel rejects a call
//! whose unused tail is not zero, so every block starts out zeroed.

use core::mem::size_of;

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Size handed to the kernel for every call. Larger than any block used here.
pub const BPF_ATTR_SIZE: usize = 128;

#[repr(C, align(8))]
#[derive(Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BpfAttr {
    bytes: [u8; BPF_ATTR_SIZE],
}

impl BpfAttr {
    /// Zeroed block with `args` copied into its prefix.
    pub fn new<T: IntoBytes + Immutable>(args: &T) -> Self {
        let mut attr = Self::new_zeroed();
        let src = args.as_bytes();
        let n = src.len().min(BPF_ATTR_SIZE);
        attr.bytes[..n].copy_from_slice(&src[..n]);
        attr
    }

    /// Read the prefix back as `T`, picking up fields the kernel wrote.
    pub fn get<T: FromBytes + IntoBytes>(&self) -> T {
        let mut out = T::new_zeroed();
        let dst = out.as_mut_bytes();
        let n = dst.len().min(BPF_ATTR_SIZE);
        dst[..n].copy_from_slice(&self.bytes[..n]);
        out
    }

    pub const fn size() -> u32 {
        BPF_ATTR_SIZE as u32
    }
}

/// BPF_MAP_CREATE
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MapCreateAttr {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub inner_map_fd: u32,
}

/// BPF_MAP_LOOKUP_ELEM, BPF_MAP_UPDATE_ELEM, BPF_MAP_DELETE_ELEM and
/// BPF_MAP_GET_NEXT_KEY. `value` doubles as `next_key`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MapElemAttr {
    pub map_fd: u32,
    pub _pad0: u32,
    pub key: u64,
    pub value: u64,
    pub flags: u64,
}

/// BPF_OBJ_PIN and BPF_OBJ_GET
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ObjAttr {
    pub pathname: u64,
    pub bpf_fd: u32,
    pub file_flags: u32,
}

/// BPF_PROG_ATTACH and BPF_PROG_DETACH
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ProgAttachAttr {
    pub target_fd: u32,
    pub attach_bpf_fd: u32,
    pub attach_type: u32,
    pub attach_flags: u32,
    pub replace_bpf_fd: u32,
}

/// BPF_PROG_QUERY
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ProgQueryAttr {
    pub target_fd: u32,
    pub attach_type: u32,
    pub query_flags: u32,
    pub attach_flags: u32,
    pub prog_ids: u64,
    pub prog_cnt: u32,
    pub _pad0: u32,
}

/// BPF_PROG_TEST_RUN
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TestRunAttr {
    pub prog_fd: u32,
    pub retval: u32,
    pub data_size_in: u32,
    pub data_size_out: u32,
    pub data_in: u64,
    pub data_out: u64,
    pub repeat: u32,
    pub duration: u32,
}

/// BPF_OBJ_GET_INFO_BY_FD
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InfoAttr {
    pub bpf_fd: u32,
    pub info_len: u32,
    pub info: u64,
}

// Layouts must match include/uapi/linux/bpf.h
const _: () = assert!(size_of::<MapCreateAttr>() == 24);
const _: () = assert!(size_of::<MapElemAttr>() == 32);
const _: () = assert!(size_of::<ObjAttr>() == 16);
const _: () = assert!(size_of::<ProgAttachAttr>() == 20);
const _: () = assert!(size_of::<ProgQueryAttr>() == 32);
const _: () = assert!(size_of::<TestRunAttr>() == 40);
const _: () = assert!(size_of::<InfoAttr>() == 16);
