use std::marker::PhantomData;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::map::mode::{AccessMode, CanRead, CanWrite, ReadWrite};
use crate::map::{MapRead, MapSchema, MapWrite};
use crate::{kernel, sys};

/// Map handle whose key and value sizes are learned from the kernel at open
/// time. Keys and values travel as byte vectors.
pub struct RawMap<A = ReadWrite> {
    fd: OwnedFd,
    schema: MapSchema,
    _mode: PhantomData<A>,
}

impl<A: AccessMode> RawMap<A> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fd = sys::get_object(path, A::OPEN_FLAGS).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_fd(fd)
    }

    /// Fails with [`Error::Unsupported`] on kernels that cannot report the
    /// map's key and value sizes.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        if !kernel::supports_map_info() {
            return Err(Error::Unsupported { field: "key_size" });
        }
        let schema = MapSchema::query(fd.as_fd()).map_err(Error::from_io("query map schema"))?;
        debug!(
            "Raw map: key size {}, value size {}, flags {:#x}",
            schema.key_size, schema.value_size, schema.map_flags
        );
        Ok(Self {
            fd,
            schema,
            _mode: PhantomData,
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn key_size(&self) -> usize {
        self.schema.key_size as usize
    }

    pub fn value_size(&self) -> usize {
        self.schema.value_size as usize
    }

    pub fn map_flags(&self) -> u32 {
        self.schema.map_flags
    }

    fn check_key(&self, op: &'static str, key: &[u8]) -> Result<()> {
        check_len(op, key, self.key_size())
    }

    fn check_value(&self, op: &'static str, value: &[u8]) -> Result<()> {
        check_len(op, value, self.value_size())
    }
}

fn check_len(op: &'static str, buf: &[u8], want: usize) -> Result<()> {
    if buf.len() == want {
        Ok(())
    } else {
        Err(Error::BufferSize {
            op,
            want,
            got: buf.len(),
        })
    }
}

impl<A> AsFd for RawMap<A> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl<A: CanRead> MapRead<Vec<u8>, Vec<u8>> for RawMap<A> {
    fn get_first_key(&self) -> Result<Vec<u8>> {
        let mut key = vec![0u8; self.key_size()];
        // SAFETY: key is exactly the map's key size.
        unsafe { sys::get_first_map_key(self.fd(), &mut key) }
            .map_err(Error::from_io("get first key"))?;
        Ok(key)
    }

    fn get_next_key(&self, key: &Vec<u8>) -> Result<Vec<u8>> {
        self.check_key("get next key", key)?;
        let mut next = vec![0u8; self.key_size()];
        // SAFETY: both buffers are exactly the map's key size.
        unsafe { sys::get_next_map_key(self.fd(), key, &mut next) }
            .map_err(Error::from_io("get next key"))?;
        Ok(next)
    }

    fn read_value(&self, key: &Vec<u8>) -> Result<Vec<u8>> {
        self.check_key("read value", key)?;
        let mut value = vec![0u8; self.value_size()];
        // SAFETY: key and value buffers match the map's sizes.
        unsafe { sys::find_map_entry(self.fd(), key, &mut value) }
            .map_err(Error::from_io("read value"))?;
        Ok(value)
    }
}

impl<A: CanWrite> MapWrite<Vec<u8>, Vec<u8>> for RawMap<A> {
    fn write_value(&self, key: &Vec<u8>, value: &Vec<u8>, flags: u64) -> Result<()> {
        self.check_key("write value", key)?;
        self.check_value("write value", value)?;
        // SAFETY: key and value buffers match the map's sizes.
        unsafe { sys::write_to_map_entry(self.fd(), key, value, flags) }
            .map_err(Error::from_io("write value"))
    }

    fn delete_value(&self, key: &Vec<u8>) -> Result<()> {
        self.check_key("delete value", key)?;
        // SAFETY: key matches the map's key size.
        unsafe { sys::delete_map_entry(self.fd(), key) }.map_err(Error::from_io("delete value"))
    }
}
