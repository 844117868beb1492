//! Typed handles to pinned eBPF maps.
//!
//! NOTE: a kernel map is shared with kernel programs and with any other
//! userspace handle. Point operations are atomic, but iteration is not
//! snapshot-isolated: entries removed by someone else mid-walk may be
//! visited twice or not at all.

use std::marker::PhantomData;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::process;

use log::{debug, error};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::{Error, Result};
use crate::{kernel, sys};
use mode::{AccessMode, CanRead, CanWrite, ReadOnly, ReadWrite, WriteOnly};

/// Plain fixed-size data that can cross the kernel boundary byte for byte.
pub trait Pod: FromBytes + IntoBytes + Immutable + Copy {}

impl<T> Pod for T where T: FromBytes + IntoBytes + Immutable + Copy {}

/// Type-level access modes for map handles.
pub mod mode {
    use bpfkit_common::{BPF_F_RDONLY, BPF_F_WRONLY};

    mod sealed {
        pub trait Sealed {}
    }

    pub trait AccessMode: sealed::Sealed {
        /// Flags passed to BPF_OBJ_GET.
        const OPEN_FLAGS: u32;
        /// Creation flag that makes a map unusable in this mode.
        const FORBIDDEN_MAP_FLAGS: u32;
        const NAME: &'static str;
    }

    pub trait CanRead: AccessMode {}
    pub trait CanWrite: AccessMode {}

    #[derive(Debug)]
    pub enum ReadWrite {}
    #[derive(Debug)]
    pub enum ReadOnly {}
    #[derive(Debug)]
    pub enum WriteOnly {}

    impl sealed::Sealed for ReadWrite {}
    impl sealed::Sealed for ReadOnly {}
    impl sealed::Sealed for WriteOnly {}

    // Maps created with BPF_F_RDONLY or BPF_F_WRONLY keep that restriction
    // for every userspace descriptor.
    impl AccessMode for ReadWrite {
        const OPEN_FLAGS: u32 = 0;
        const FORBIDDEN_MAP_FLAGS: u32 = BPF_F_RDONLY | BPF_F_WRONLY;
        const NAME: &'static str = "read-write";
    }

    impl AccessMode for ReadOnly {
        const OPEN_FLAGS: u32 = BPF_F_RDONLY;
        const FORBIDDEN_MAP_FLAGS: u32 = BPF_F_WRONLY;
        const NAME: &'static str = "read-only";
    }

    impl AccessMode for WriteOnly {
        const OPEN_FLAGS: u32 = BPF_F_WRONLY;
        const FORBIDDEN_MAP_FLAGS: u32 = BPF_F_RDONLY;
        const NAME: &'static str = "write-only";
    }

    impl CanRead for ReadWrite {}
    impl CanRead for ReadOnly {}
    impl CanWrite for ReadWrite {}
    impl CanWrite for WriteOnly {}
}

/// Read side of a key/value map.
///
/// Only the three primitive lookups are required; emptiness checks and
/// iteration come for free on top of them.
pub trait MapRead<K, V> {
    /// First key in the kernel's iteration order. `NotFound` when empty.
    fn get_first_key(&self) -> Result<K>;

    /// Key after `key`. `NotFound` when `key` was the last one.
    fn get_next_key(&self, key: &K) -> Result<K>;

    fn read_value(&self, key: &K) -> Result<V>;

    fn is_empty(&self) -> Result<bool> {
        match self.get_first_key() {
            Ok(_) => Ok(false),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Visit every key. The walk stops at the first error from the map or the
    /// visitor and returns it. The visitor may delete the key it is given.
    fn iterate<F>(&self, mut visitor: F) -> Result<()>
    where
        Self: Sized,
        F: FnMut(&K, &Self) -> Result<()>,
    {
        let mut current = self.get_first_key();
        loop {
            let key = match current {
                Ok(key) => key,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            // Fetched before the visitor runs so deleting `key` cannot end the walk.
            let next = self.get_next_key(&key);
            visitor(&key, self)?;
            current = next;
        }
    }

    /// Like [`MapRead::iterate`] but reads each value first. A failed read
    /// stops the walk with that error.
    fn iterate_with_value<F>(&self, mut visitor: F) -> Result<()>
    where
        Self: Sized,
        F: FnMut(&K, &V, &Self) -> Result<()>,
    {
        let mut current = self.get_first_key();
        loop {
            let key = match current {
                Ok(key) => key,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            let next = self.get_next_key(&key);
            let value = self.read_value(&key)?;
            visitor(&key, &value, self)?;
            current = next;
        }
    }
}

/// Write side of a key/value map.
pub trait MapWrite<K, V> {
    /// `flags` is one of `BPF_ANY`, `BPF_NOEXIST` or `BPF_EXIST`, optionally
    /// or'ed with `BPF_F_LOCK`.
    fn write_value(&self, key: &K, value: &V, flags: u64) -> Result<()>;

    /// `NotFound` if the key was already absent.
    fn delete_value(&self, key: &K) -> Result<()>;

    /// Delete entries until the map reports empty. Losing a race to another
    /// deleter is not an error.
    fn clear(&self) -> Result<()>
    where
        Self: MapRead<K, V>,
    {
        loop {
            let key = match self.get_first_key() {
                Ok(key) => key,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            match self.delete_value(&key) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    error!("Failed to delete map entry while clearing: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

/// Key size, value size and creation flags of an open map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSchema {
    pub key_size: u32,
    pub value_size: u32,
    pub map_flags: u32,
}

impl MapSchema {
    pub fn query(fd: BorrowedFd<'_>) -> std::io::Result<Self> {
        Ok(Self {
            key_size: sys::get_fd_key_size(fd)?,
            value_size: sys::get_fd_value_size(fd)?,
            map_flags: sys::get_fd_map_flags(fd)?,
        })
    }

    /// Describes why a handle of mode `A` with the given sizes cannot use
    /// this map, or `None` if it can.
    pub fn mismatch<A: AccessMode>(&self, key_size: usize, value_size: usize) -> Option<String> {
        if self.key_size as usize != key_size {
            return Some(format!(
                "key size {} does not match handle key size {}",
                self.key_size, key_size
            ));
        }
        if self.value_size as usize != value_size {
            return Some(format!(
                "value size {} does not match handle value size {}",
                self.value_size, value_size
            ));
        }
        let forbidden = self.map_flags & A::FORBIDDEN_MAP_FLAGS;
        if forbidden != 0 {
            return Some(format!(
                "map flags {:#x} forbid a {} handle",
                forbidden,
                A::NAME
            ));
        }
        None
    }
}

/// Aborts the process if the map behind `fd` does not match a handle of mode
/// `A` over `key_size`/`value_size`.
fn abort_on_schema_mismatch<A: AccessMode>(fd: BorrowedFd<'_>, key_size: usize, value_size: usize) {
    if !kernel::supports_map_info() {
        return;
    }
    let problem = match MapSchema::query(fd) {
        Ok(schema) => schema.mismatch::<A>(key_size, value_size),
        Err(e) => Some(format!("map metadata query failed: {}", e)),
    };
    if let Some(problem) = problem {
        error!("bpf map fd {}: {}", fd.as_raw_fd(), problem);
        process::abort();
    }
}

/// Handle to a map with fixed-size keys `K` and values `V`, opened in mode `A`.
///
/// The descriptor closes when the handle drops. Writes go through `&self`
/// because the kernel serializes element operations.
pub struct BpfMap<K, V, A = ReadWrite> {
    fd: OwnedFd,
    _marker: PhantomData<(fn() -> K, fn() -> V, A)>,
}

pub type BpfMapRO<K, V> = BpfMap<K, V, ReadOnly>;
pub type BpfMapWO<K, V> = BpfMap<K, V, WriteOnly>;

impl<K: Pod, V: Pod, A: AccessMode> BpfMap<K, V, A> {
    /// Open the map pinned at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Open`] if the pin cannot be opened in this mode.
    /// A map whose key size, value size or flags disagree with this handle
    /// aborts the process instead of returning.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fd = sys::get_object(path, A::OPEN_FLAGS).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Opened {} map {:?} (fd {})", A::NAME, path, fd.as_raw_fd());
        Ok(Self::from_fd(fd))
    }

    /// Like [`BpfMap::open`] but aborts on failure, for maps the process
    /// cannot run without.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::open(path) {
            Ok(map) => map,
            Err(e) => {
                error!("Required bpf map {:?} is unusable: {}", path, e);
                process::abort();
            }
        }
    }

    /// Adopt an already open map descriptor, checking it like [`BpfMap::open`].
    pub fn from_fd(fd: OwnedFd) -> Self {
        abort_on_schema_mismatch::<A>(fd.as_fd(), size_of::<K>(), size_of::<V>());
        Self {
            fd,
            _marker: PhantomData,
        }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn pin(&self, path: impl AsRef<Path>) -> Result<()> {
        sys::pin_object(self.fd(), path.as_ref()).map_err(|source| Error::Io { op: "pin map", source })
    }

    /// Second handle on the same map through a duplicated descriptor.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = self
            .fd
            .try_clone()
            .map_err(|source| Error::Io { op: "duplicate map fd", source })?;
        Ok(Self {
            fd,
            _marker: PhantomData,
        })
    }
}

impl<K: Pod, V: Pod> BpfMap<K, V, ReadWrite> {
    /// Create an anonymous map sized for `K` and `V`. Mostly useful in tests
    /// and for maps that are pinned afterwards.
    pub fn create(map_type: u32, max_entries: u32, map_flags: u32) -> Result<Self> {
        let fd = sys::create_map(
            map_type,
            size_of::<K>() as u32,
            size_of::<V>() as u32,
            max_entries,
            map_flags,
        )
        .map_err(|source| Error::Io { op: "create map", source })?;
        Ok(Self::from_fd(fd))
    }
}

impl<K, V, A> AsFd for BpfMap<K, V, A> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl<K: Pod, V: Pod, A: CanRead> MapRead<K, V> for BpfMap<K, V, A> {
    fn get_first_key(&self) -> Result<K> {
        let mut key = K::new_zeroed();
        // SAFETY: the map's key size equals size_of::<K>(), checked when opened.
        unsafe { sys::get_first_map_key(self.fd(), key.as_mut_bytes()) }
            .map_err(Error::from_io("get first key"))?;
        Ok(key)
    }

    fn get_next_key(&self, key: &K) -> Result<K> {
        let mut next = K::new_zeroed();
        // SAFETY: as above.
        unsafe { sys::get_next_map_key(self.fd(), key.as_bytes(), next.as_mut_bytes()) }
            .map_err(Error::from_io("get next key"))?;
        Ok(next)
    }

    fn read_value(&self, key: &K) -> Result<V> {
        let mut value = V::new_zeroed();
        // SAFETY: key and value sizes were checked when opened.
        unsafe { sys::find_map_entry(self.fd(), key.as_bytes(), value.as_mut_bytes()) }
            .map_err(Error::from_io("read value"))?;
        Ok(value)
    }
}

impl<K: Pod, V: Pod, A: CanWrite> MapWrite<K, V> for BpfMap<K, V, A> {
    fn write_value(&self, key: &K, value: &V, flags: u64) -> Result<()> {
        // SAFETY: key and value sizes were checked when opened.
        unsafe { sys::write_to_map_entry(self.fd(), key.as_bytes(), value.as_bytes(), flags) }
            .map_err(Error::from_io("write value"))
    }

    fn delete_value(&self, key: &K) -> Result<()> {
        // SAFETY: the map's key size equals size_of::<K>().
        unsafe { sys::delete_map_entry(self.fd(), key.as_bytes()) }
            .map_err(Error::from_io("delete value"))
    }
}
