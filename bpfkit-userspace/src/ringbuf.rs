//! Consumer side of the BPF ring buffer.
//!
//! The kernel exposes the ring through two mappings of the map descriptor:
//! a writable page holding the consumer position, and a read-only region
//! holding the producer position page followed by the data area. The data
//! area is mapped twice back to back, so a record that wraps past the end is
//! still contiguous in memory.
//!
//! NOTE: every userspace consumer of one ring shares a single consumer
//! position in the kernel. Two readers on the same pinned path race on it and
//! each sees an unpredictable subset of the messages. Use one reader and fan
//! out behind it.

use std::ffi::c_void;
use std::io;
use std::marker::PhantomData;
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::process;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bpfkit_common::ringbuf::{round_length, BPF_RINGBUF_BUSY_BIT, BPF_RINGBUF_DISCARD_BIT, BPF_RINGBUF_HDR_SZ};
use bpfkit_common::BPF_MAP_TYPE_RINGBUF;
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::{sysconf, SysconfVar};

use crate::error::{Error, Result};
use crate::map::Pod;
use crate::sys;

fn page_size() -> Result<usize> {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => Ok(size as usize),
        Ok(_) => Err(Error::Io {
            op: "query page size",
            source: io::Error::from_raw_os_error(libc::EINVAL),
        }),
        Err(errno) => Err(Error::Io {
            op: "query page size",
            source: errno.into(),
        }),
    }
}

/// Length of the producer mapping: the position page then the data area twice.
fn producer_len(page: usize, max_entries: u32) -> Result<usize> {
    usize::try_from(max_entries)
        .ok()
        .and_then(|n| n.checked_mul(2))
        .and_then(|n| n.checked_add(page))
        .ok_or(Error::InvalidMaxEntries(max_entries))
}

/// Shared mapping of a kernel object, unmapped on drop.
struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl Mapping {
    fn new(
        fd: BorrowedFd<'_>,
        len: usize,
        prot: ProtFlags,
        offset: usize,
        region: &'static str,
    ) -> Result<Self> {
        let einval = || Error::Mmap {
            region,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        let length = NonZeroUsize::new(len).ok_or_else(einval)?;
        let offset = libc::off_t::try_from(offset).map_err(|_| einval())?;
        // SAFETY: a fresh shared mapping that nothing else in this process aliases.
        let ptr = unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, fd.as_raw_fd(), offset) }
            .map_err(|errno| Error::Mmap {
                region,
                source: errno.into(),
            })?;
        let ptr = NonNull::new(ptr).ok_or_else(einval)?;
        Ok(Self { ptr, len })
    }

    fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.len);
        // SAFETY: offset lies inside the mapping, which is never null.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().cast::<u8>().add(offset)) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping created in Mapping::new.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr(), self.len) } {
            warn!("Failed to unmap ring buffer region: {}", e);
        }
    }
}

/// Positions and data area of one ring, wherever they live.
pub(crate) struct RingView {
    consumer_pos: NonNull<AtomicU64>,
    producer_pos: NonNull<AtomicU32>,
    data: NonNull<u8>,
    mask: u64,
}

impl RingView {
    /// # Safety
    ///
    /// For as long as the view is used: `consumer_pos` must be valid and
    /// 8-byte aligned, `producer_pos` valid and 4-byte aligned, and `data`
    /// valid for reads of `2 * max_entries` bytes laid out as the ring mapped
    /// twice. `max_entries` must be a power of two.
    pub(crate) unsafe fn new(
        consumer_pos: NonNull<u8>,
        producer_pos: NonNull<u8>,
        data: NonNull<u8>,
        max_entries: u32,
    ) -> Self {
        Self {
            consumer_pos: consumer_pos.cast(),
            producer_pos: producer_pos.cast(),
            data,
            mask: u64::from(max_entries) - 1,
        }
    }

    fn consumer(&self) -> &AtomicU64 {
        // SAFETY: valid and aligned per RingView::new.
        unsafe { self.consumer_pos.as_ref() }
    }

    fn producer(&self) -> &AtomicU32 {
        // SAFETY: valid and aligned per RingView::new.
        unsafe { self.producer_pos.as_ref() }
    }

    /// Advisory: the answer may be stale by the time the caller acts on it.
    pub(crate) fn is_empty(&self) -> bool {
        let prod = self.producer().load(Ordering::Relaxed);
        let cons = self.consumer().load(Ordering::Relaxed);
        cons as u32 == prod
    }

    /// Deliver every committed record up to the producer position observed on
    /// entry. Stops early at a record still being written. A record whose
    /// length is not `value_size` is consumed and reported as
    /// [`Error::MessageSize`]; the records after it stay queued.
    pub(crate) fn consume_all(
        &mut self,
        value_size: usize,
        mut callback: impl FnMut(&[u8]),
    ) -> Result<usize> {
        let mut count = 0;
        let prod_pos = self.producer().load(Ordering::Acquire);
        // Only the consumer writes this position, so a relaxed load suffices.
        let mut cons_pos = self.consumer().load(Ordering::Relaxed);
        // Positions grow forever; the kernel publishes only the low 32 bits
        // of the producer position.
        while cons_pos as u32 != prod_pos {
            let offset = (cons_pos & self.mask) as usize;
            // SAFETY: offset < max_entries and positions are 8-byte aligned,
            // so the header word is in bounds and aligned.
            let record = unsafe { self.data.as_ptr().add(offset) };
            let length = unsafe { &*record.cast::<AtomicU32>() }.load(Ordering::Acquire);

            if length & BPF_RINGBUF_BUSY_BIT != 0 {
                return Ok(count);
            }

            cons_pos += u64::from(round_length(length));

            if length & BPF_RINGBUF_DISCARD_BIT == 0 {
                if length as usize != value_size {
                    self.consumer().store(cons_pos, Ordering::Release);
                    return Err(Error::MessageSize {
                        want: value_size,
                        got: length,
                    });
                }
                // SAFETY: a committed record fits in the ring, and the second
                // copy of the data area covers the part past the end.
                let payload = unsafe {
                    slice::from_raw_parts(record.add(BPF_RINGBUF_HDR_SZ as usize), value_size)
                };
                callback(payload);
                count += 1;
            }
            self.consumer().store(cons_pos, Ordering::Release);
        }
        Ok(count)
    }
}

/// Ring buffer consumer with a message size fixed at runtime.
pub struct BpfRingbufBase {
    value_size: usize,
    view: RingView,
    // Dropped in declaration order: the view's pointers go before the mappings
    // they point into, and the mappings before the descriptor.
    _producer: Mapping,
    _consumer: Mapping,
    fd: OwnedFd,
}

// SAFETY: the mappings belong to this handle alone and move with it. Sync is
// not implemented because draining mutates the shared consumer position.
unsafe impl Send for BpfRingbufBase {}

impl BpfRingbufBase {
    /// Open the ring pinned at `path` and map it for consumption.
    pub fn create(path: impl AsRef<Path>, value_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let fd = sys::map_retrieve_rw(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Opened ring buffer {:?}", path);
        Self::from_fd(fd, value_size)
    }

    /// Like [`BpfRingbufBase::create`] but aborts on failure.
    pub fn new(path: impl AsRef<Path>, value_size: usize) -> Self {
        let path = path.as_ref();
        match Self::create(path, value_size) {
            Ok(ring) => ring,
            Err(e) => {
                error!("Required ring buffer {:?} is unusable: {}", path, e);
                process::abort();
            }
        }
    }

    /// Map an already open ring buffer descriptor.
    pub fn from_fd(fd: OwnedFd, value_size: usize) -> Result<Self> {
        let map_type =
            sys::get_fd_map_type(fd.as_fd()).map_err(Error::from_io("query ring buffer map type"))?;
        if map_type != BPF_MAP_TYPE_RINGBUF {
            return Err(Error::WrongMapType {
                want: BPF_MAP_TYPE_RINGBUF,
                got: map_type,
            });
        }
        let max_entries = sys::get_fd_max_entries(fd.as_fd())
            .map_err(Error::from_io("query ring buffer size"))?;
        if !max_entries.is_power_of_two() {
            return Err(Error::InvalidMaxEntries(max_entries));
        }

        let page = page_size()?;
        let consumer = Mapping::new(
            fd.as_fd(),
            page,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            0,
            "consumer",
        )?;
        let producer = Mapping::new(
            fd.as_fd(),
            producer_len(page, max_entries)?,
            ProtFlags::PROT_READ,
            page,
            "producer",
        )?;
        // SAFETY: both mappings are page aligned and live as long as the view;
        // the producer mapping holds the position page then the doubled data area.
        let view = unsafe { RingView::new(consumer.at(0), producer.at(0), producer.at(page), max_entries) };
        debug!(
            "Mapped ring buffer of {} bytes for {}-byte messages",
            max_entries, value_size
        );
        Ok(Self {
            value_size,
            view,
            _producer: producer,
            _consumer: consumer,
            fd,
        })
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Advisory emptiness check.
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Block until the kernel signals data or `timeout` elapses (`None` waits
    /// forever), then report whether messages are pending. Interrupted polls
    /// resume with the remaining time. A `true` result is a hint only and a
    /// following drain may deliver nothing.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        // A timeout too large to represent waits forever.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => poll_millis(deadline.saturating_duration_since(Instant::now())),
            };
            let mut fds = [PollFd::new(self.fd.as_raw_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout_ms) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("poll on ring buffer failed: {}", e);
                    break;
                }
            }
        }
        !self.is_empty()
    }

    /// Drain committed messages as raw byte slices of `value_size` bytes.
    pub fn consume_all_raw(&mut self, callback: impl FnMut(&[u8])) -> Result<usize> {
        let value_size = self.value_size;
        self.view.consume_all(value_size, callback)
    }
}

impl AsFd for BpfRingbufBase {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Milliseconds to pass to poll, rounded up so the wait is never shorter
/// than asked.
fn poll_millis(left: Duration) -> libc::c_int {
    let ms = left.as_nanos().div_ceil(1_000_000);
    libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
}

/// Ring buffer consumer for messages of type `V`.
pub struct BpfRingbuf<V> {
    base: BpfRingbufBase,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Pod> BpfRingbuf<V> {
    /// # Errors
    ///
    /// [`Error::Open`] if the pin cannot be opened, [`Error::WrongMapType`]
    /// if it is not a ring buffer, [`Error::InvalidMaxEntries`] for a size
    /// that is not a power of two and [`Error::Mmap`] if mapping fails.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        BpfRingbufBase::create(path, size_of::<V>()).map(Self::from_base)
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::from_base(BpfRingbufBase::new(path, size_of::<V>()))
    }

    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        BpfRingbufBase::from_fd(fd, size_of::<V>()).map(Self::from_base)
    }

    fn from_base(base: BpfRingbufBase) -> Self {
        Self {
            base,
            _marker: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.base.wait(timeout)
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.base.fd()
    }

    /// Drain committed messages, handing each to `callback` in FIFO order.
    /// Returns how many were delivered.
    pub fn consume_all(&mut self, mut callback: impl FnMut(&V)) -> Result<usize> {
        self.base.consume_all_raw(|payload| deliver(payload, &mut callback))
    }
}

/// Decode a payload whose size was already checked against `V`. Any `Pod`
/// decodes from a slice of exactly its size.
fn deliver<V: Pod>(payload: &[u8], callback: &mut impl FnMut(&V)) {
    if let Ok(value) = V::read_from_bytes(payload) {
        callback(&value);
    }
}
