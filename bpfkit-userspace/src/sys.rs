//! Typed wrappers over the multiplexed `bpf(2)` system call.
//!
//! Each function marshals one argument block and hands back the raw kernel
//! outcome: success, or the errno captured right after the call. Nothing in
//! this module retries or interprets error codes.

use std::ffi::CString;
use std::io;
use std::mem::{offset_of, size_of};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use bpfkit_common::attr::{
    BpfAttr, InfoAttr, MapCreateAttr, MapElemAttr, ObjAttr, ProgAttachAttr, ProgQueryAttr,
    TestRunAttr,
};
use bpfkit_common::info::{MapInfo, ProgInfo};
use bpfkit_common::{
    BPF_F_RDONLY, BPF_F_WRONLY, BPF_MAP_CREATE, BPF_MAP_DELETE_ELEM, BPF_MAP_GET_NEXT_KEY,
    BPF_MAP_LOOKUP_ELEM, BPF_MAP_UPDATE_ELEM, BPF_OBJ_GET, BPF_OBJ_GET_INFO_BY_FD, BPF_OBJ_PIN,
    BPF_PROG_ATTACH, BPF_PROG_DETACH, BPF_PROG_QUERY, BPF_PROG_TEST_RUN,
};
use zerocopy::{FromBytes, IntoBytes};

fn ptr_to_u64<T>(ptr: *const T) -> u64 {
    ptr as usize as u64
}

fn fd_arg(fd: BorrowedFd<'_>) -> u32 {
    fd.as_raw_fd() as u32
}

fn path_arg(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Issue one `bpf(2)` command. Returns the non-negative syscall result.
pub fn bpf(cmd: u32, attr: &mut BpfAttr) -> io::Result<i32> {
    // SAFETY: attr is a fully initialised block of BpfAttr::size() bytes and
    // any pointers inside it were set up by the caller for this call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd as libc::c_int,
            attr as *mut BpfAttr,
            BpfAttr::size() as libc::c_uint,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as i32)
    }
}

fn bpf_fd(cmd: u32, attr: &mut BpfAttr) -> io::Result<OwnedFd> {
    let fd = bpf(cmd, attr)?;
    // SAFETY: commands that return descriptors hand over a fresh one we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn create(args: MapCreateAttr) -> io::Result<OwnedFd> {
    bpf_fd(BPF_MAP_CREATE, &mut BpfAttr::new(&args))
}

/// Create an anonymous map. The kernel marks the descriptor close-on-exec.
pub fn create_map(
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
) -> io::Result<OwnedFd> {
    create(MapCreateAttr {
        map_type,
        key_size,
        value_size,
        max_entries,
        map_flags,
        inner_map_fd: 0,
    })
}

/// Create an array-of-maps or hash-of-maps whose slots hold maps shaped like
/// `inner_map`.
pub fn create_outer_map(
    map_type: u32,
    key_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map: BorrowedFd<'_>,
) -> io::Result<OwnedFd> {
    create(MapCreateAttr {
        map_type,
        key_size,
        value_size: size_of::<u32>() as u32,
        max_entries,
        map_flags,
        inner_map_fd: fd_arg(inner_map),
    })
}

fn elem(cmd: u32, map: BorrowedFd<'_>, key: u64, value: u64, flags: u64) -> io::Result<()> {
    let mut attr = BpfAttr::new(&MapElemAttr {
        map_fd: fd_arg(map),
        _pad0: 0,
        key,
        value,
        flags,
    });
    bpf(cmd, &mut attr).map(drop)
}

/// Insert or update one element.
///
/// # Safety
///
/// `key` and `value` must be at least as long as the map's key and value
/// sizes; the kernel reads exactly that many bytes through each pointer.
pub unsafe fn write_to_map_entry(
    map: BorrowedFd<'_>,
    key: &[u8],
    value: &[u8],
    flags: u64,
) -> io::Result<()> {
    elem(
        BPF_MAP_UPDATE_ELEM,
        map,
        ptr_to_u64(key.as_ptr()),
        ptr_to_u64(value.as_ptr()),
        flags,
    )
}

/// Copy one element's value into `value`.
///
/// # Safety
///
/// `key` must cover the map's key size and `value` its value size.
pub unsafe fn find_map_entry(map: BorrowedFd<'_>, key: &[u8], value: &mut [u8]) -> io::Result<()> {
    elem(
        BPF_MAP_LOOKUP_ELEM,
        map,
        ptr_to_u64(key.as_ptr()),
        ptr_to_u64(value.as_mut_ptr()),
        0,
    )
}

/// # Safety
///
/// `key` must cover the map's key size.
pub unsafe fn delete_map_entry(map: BorrowedFd<'_>, key: &[u8]) -> io::Result<()> {
    elem(BPF_MAP_DELETE_ELEM, map, ptr_to_u64(key.as_ptr()), 0, 0)
}

/// Store the key following `key` in `next_key`. ENOENT means `key` was last.
///
/// # Safety
///
/// `key` and `next_key` must both cover the map's key size.
pub unsafe fn get_next_map_key(
    map: BorrowedFd<'_>,
    key: &[u8],
    next_key: &mut [u8],
) -> io::Result<()> {
    elem(
        BPF_MAP_GET_NEXT_KEY,
        map,
        ptr_to_u64(key.as_ptr()),
        ptr_to_u64(next_key.as_mut_ptr()),
        0,
    )
}

/// Store the first key in `first_key`. ENOENT means the map is empty.
///
/// # Safety
///
/// `first_key` must cover the map's key size.
pub unsafe fn get_first_map_key(map: BorrowedFd<'_>, first_key: &mut [u8]) -> io::Result<()> {
    // A NULL key asks for the first one.
    elem(
        BPF_MAP_GET_NEXT_KEY,
        map,
        0,
        ptr_to_u64(first_key.as_mut_ptr()),
        0,
    )
}

/// Pin `fd` at `path` on a bpf filesystem.
pub fn pin_object(fd: BorrowedFd<'_>, path: &Path) -> io::Result<()> {
    let path = path_arg(path)?;
    let mut attr = BpfAttr::new(&ObjAttr {
        pathname: ptr_to_u64(path.as_ptr()),
        bpf_fd: fd_arg(fd),
        file_flags: 0,
    });
    bpf(BPF_OBJ_PIN, &mut attr).map(drop)
}

/// Open the object pinned at `path`. `file_flags` is zero or one of
/// `BPF_F_RDONLY` / `BPF_F_WRONLY`.
pub fn get_object(path: &Path, file_flags: u32) -> io::Result<OwnedFd> {
    let path = path_arg(path)?;
    let mut attr = BpfAttr::new(&ObjAttr {
        pathname: ptr_to_u64(path.as_ptr()),
        bpf_fd: 0,
        file_flags,
    });
    bpf_fd(BPF_OBJ_GET, &mut attr)
}

pub fn map_retrieve_rw(path: &Path) -> io::Result<OwnedFd> {
    get_object(path, 0)
}

pub fn map_retrieve_ro(path: &Path) -> io::Result<OwnedFd> {
    get_object(path, BPF_F_RDONLY)
}

pub fn map_retrieve_wo(path: &Path) -> io::Result<OwnedFd> {
    get_object(path, BPF_F_WRONLY)
}

pub fn retrieve_program(path: &Path) -> io::Result<OwnedFd> {
    get_object(path, BPF_F_RDONLY)
}

/// Whether a program is pinned at `path` and can be opened.
pub fn usable_program(path: &Path) -> bool {
    retrieve_program(path).is_ok()
}

pub fn attach_program(
    attach_type: u32,
    prog: BorrowedFd<'_>,
    cgroup: BorrowedFd<'_>,
    attach_flags: u32,
) -> io::Result<()> {
    let mut attr = BpfAttr::new(&ProgAttachAttr {
        target_fd: fd_arg(cgroup),
        attach_bpf_fd: fd_arg(prog),
        attach_type,
        attach_flags,
        replace_bpf_fd: 0,
    });
    bpf(BPF_PROG_ATTACH, &mut attr).map(drop)
}

/// Detach whatever program is attached to `cgroup` at `attach_type`.
pub fn detach_program(attach_type: u32, cgroup: BorrowedFd<'_>) -> io::Result<()> {
    let mut attr = BpfAttr::new(&ProgAttachAttr {
        target_fd: fd_arg(cgroup),
        attach_type,
        ..Default::default()
    });
    bpf(BPF_PROG_DETACH, &mut attr).map(drop)
}

/// Detach exactly `prog`, needed when several programs share an attach point.
pub fn detach_single_program(
    attach_type: u32,
    prog: BorrowedFd<'_>,
    cgroup: BorrowedFd<'_>,
) -> io::Result<()> {
    let mut attr = BpfAttr::new(&ProgAttachAttr {
        target_fd: fd_arg(cgroup),
        attach_bpf_fd: fd_arg(prog),
        attach_type,
        ..Default::default()
    });
    bpf(BPF_PROG_DETACH, &mut attr).map(drop)
}

/// Id of the program attached to `cgroup` at `attach_type`, or 0 if none.
///
/// Room is left for a single id, so the kernel fails with ENOSPC when more
/// than one program is attached.
pub fn query_program(
    cgroup: BorrowedFd<'_>,
    attach_type: u32,
    query_flags: u32,
    attach_flags: u32,
) -> io::Result<u32> {
    let mut prog_id: u32 = 0;
    let mut attr = BpfAttr::new(&ProgQueryAttr {
        target_fd: fd_arg(cgroup),
        attach_type,
        query_flags,
        attach_flags,
        prog_ids: ptr_to_u64(&mut prog_id as *mut u32),
        prog_cnt: 1,
        _pad0: 0,
    });
    bpf(BPF_PROG_QUERY, &mut attr)?;
    let out: ProgQueryAttr = attr.get();
    Ok(if out.prog_cnt == 0 { 0 } else { prog_id })
}

/// Run `prog` once over `data` and return its return value.
pub fn run_program(prog: BorrowedFd<'_>, data: &[u8]) -> io::Result<u32> {
    let data_size_in = u32::try_from(data.len())
        .map_err(|_| io::Error::from_raw_os_error(libc::E2BIG))?;
    let mut attr = BpfAttr::new(&TestRunAttr {
        prog_fd: fd_arg(prog),
        data_size_in,
        data_in: ptr_to_u64(data.as_ptr()),
        repeat: 1,
        ..Default::default()
    });
    bpf(BPF_PROG_TEST_RUN, &mut attr)?;
    let out: TestRunAttr = attr.get();
    Ok(out.retval)
}

fn obj_info<T: FromBytes + IntoBytes>(fd: BorrowedFd<'_>) -> io::Result<(T, usize)> {
    let mut info = T::new_zeroed();
    let mut attr = BpfAttr::new(&InfoAttr {
        bpf_fd: fd_arg(fd),
        info_len: size_of::<T>() as u32,
        info: ptr_to_u64(info.as_mut_bytes().as_mut_ptr()),
    });
    bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr)?;
    let out: InfoAttr = attr.get();
    Ok((info, out.info_len as usize))
}

/// Full map metadata record plus the number of bytes the kernel filled in.
pub fn get_map_info(map: BorrowedFd<'_>) -> io::Result<(MapInfo, usize)> {
    obj_info(map)
}

pub fn get_prog_info(prog: BorrowedFd<'_>) -> io::Result<(ProgInfo, usize)> {
    obj_info(prog)
}

/// EOPNOTSUPP unless the kernel's record reaches past `end`.
pub(crate) fn require_field(info_len: usize, end: usize) -> io::Result<()> {
    if info_len < end {
        Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
    } else {
        Ok(())
    }
}

macro_rules! fd_info_getter {
    ($(#[$doc:meta])* $name:ident, $info:ty, $field:ident) => {
        $(#[$doc])*
        pub fn $name(fd: BorrowedFd<'_>) -> io::Result<u32> {
            let (info, len) = obj_info::<$info>(fd)?;
            require_field(len, offset_of!($info, $field) + size_of::<u32>())?;
            Ok(info.$field)
        }
    };
}

fd_info_getter!(get_fd_map_type, MapInfo, map_type);
fd_info_getter!(get_fd_map_id, MapInfo, id);
fd_info_getter!(get_fd_key_size, MapInfo, key_size);
fd_info_getter!(get_fd_value_size, MapInfo, value_size);
fd_info_getter!(get_fd_max_entries, MapInfo, max_entries);
fd_info_getter!(
    /// Creation flags, including `BPF_F_RDONLY_PROG` / `BPF_F_WRONLY_PROG`.
    get_fd_map_flags,
    MapInfo,
    map_flags
);
fd_info_getter!(get_fd_prog_id, ProgInfo, id);

/// Wait for an RCU grace period.
///
/// Closing a PF_KEY socket makes the kernel call `synchronize_rcu()`, which
/// is the cheapest way to force one from userspace. Useful after removing a
/// map entry that a program may still be reading.
pub fn synchronize_kernel_rcu() -> io::Result<()> {
    const PF_KEY_V2: libc::c_int = 2;

    // SAFETY: plain socket(2); the descriptor is closed below.
    let fd = unsafe { libc::socket(libc::AF_KEY, libc::SOCK_RAW | libc::SOCK_CLOEXEC, PF_KEY_V2) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // The grace period happens inside close, so its result matters.
    // SAFETY: fd was returned by socket above and is not used again.
    if unsafe { libc::close(fd) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
