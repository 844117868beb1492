//! In-memory stand-in for a kernel hash map, ordered by key.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::ops::Bound::{Excluded, Unbounded};

use bpfkit_common::{BPF_EXIST, BPF_NOEXIST};

use crate::error::{Error, Result};
use crate::map::{MapRead, MapWrite};

#[derive(Default)]
pub(crate) struct MemMap<K, V> {
    entries: RefCell<BTreeMap<K, V>>,
    steal_delete: Cell<bool>,
}

impl<K, V> MemMap<K, V> {
    /// The next delete behaves as if another process removed the key first.
    pub(crate) fn steal_next_delete(&self) {
        self.steal_delete.set(true);
    }
}

impl<K: Ord + Copy, V: Copy> MapRead<K, V> for MemMap<K, V> {
    fn get_first_key(&self) -> Result<K> {
        self.entries
            .borrow()
            .keys()
            .next()
            .copied()
            .ok_or(Error::NotFound { op: "get first key" })
    }

    /// Like a kernel hash map, a key that is no longer present restarts the
    /// walk at the first key.
    fn get_next_key(&self, key: &K) -> Result<K> {
        let entries = self.entries.borrow();
        let next = if entries.contains_key(key) {
            entries.range((Excluded(key), Unbounded)).next()
        } else {
            entries.iter().next()
        };
        next.map(|(k, _)| *k)
            .ok_or(Error::NotFound { op: "get next key" })
    }

    fn read_value(&self, key: &K) -> Result<V> {
        self.entries
            .borrow()
            .get(key)
            .copied()
            .ok_or(Error::NotFound { op: "read value" })
    }
}

impl<K: Ord + Copy, V: Copy> MapWrite<K, V> for MemMap<K, V> {
    fn write_value(&self, key: &K, value: &V, flags: u64) -> Result<()> {
        let mut entries = self.entries.borrow_mut();
        let exists = entries.contains_key(key);
        if flags == BPF_NOEXIST && exists {
            return Err(Error::Io {
                op: "write value",
                source: io::Error::from_raw_os_error(libc::EEXIST),
            });
        }
        if flags == BPF_EXIST && !exists {
            return Err(Error::NotFound { op: "write value" });
        }
        entries.insert(*key, *value);
        Ok(())
    }

    fn delete_value(&self, key: &K) -> Result<()> {
        let removed = self.entries.borrow_mut().remove(key);
        if self.steal_delete.replace(false) {
            return Err(Error::NotFound { op: "delete value" });
        }
        removed
            .map(drop)
            .ok_or(Error::NotFound { op: "delete value" })
    }
}
