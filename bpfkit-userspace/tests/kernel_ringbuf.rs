//! Ring buffer setup and draining against the running kernel. Skips without
//! privileges or on kernels older than 5.8.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use bpfkit_userspace::abi::attr::BpfAttr;
use bpfkit_userspace::abi::{BPF_MAP_TYPE_HASH, BPF_MAP_TYPE_RINGBUF, BPF_PROG_LOAD};
use bpfkit_userspace::{kernel, sys, BpfRingbuf, BpfRingbufBase, Error};
use serial_test::serial;
use zerocopy::{Immutable, IntoBytes};

const RING_SIZE: u32 = 4096;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ring_fd() -> Option<OwnedFd> {
    init();
    if !kernel::is_at_least_kernel_version(5, 8, 0) {
        eprintln!("skipping: kernel {} has no ring buffers", kernel::kernel_version());
        return None;
    }
    match sys::create_map(BPF_MAP_TYPE_RINGBUF, 0, 0, RING_SIZE, 0) {
        Ok(fd) => Some(fd),
        Err(e) => {
            eprintln!("skipping: cannot create ring buffer: {}", e);
            None
        }
    }
}

#[test]
#[serial]
fn fresh_ring_is_empty() {
    let Some(fd) = ring_fd() else { return };
    let mut ring = BpfRingbuf::<u64>::from_fd(fd).unwrap();
    assert!(ring.is_empty());
    let mut calls = 0;
    assert_eq!(ring.consume_all(|_| calls += 1).unwrap(), 0);
    assert_eq!(calls, 0);
}

#[test]
#[serial]
fn wait_times_out_on_empty_ring() {
    let Some(fd) = ring_fd() else { return };
    let ring = BpfRingbufBase::from_fd(fd, 8).unwrap();
    let timeout = Duration::from_millis(100);
    let start = Instant::now();
    assert!(!ring.wait(Some(timeout)));
    assert!(start.elapsed() >= timeout);
}

#[test]
#[serial]
fn non_ring_maps_are_rejected() {
    init();
    let fd = match sys::create_map(BPF_MAP_TYPE_HASH, 4, 4, 4, 0) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("skipping: cannot create bpf map: {}", e);
            return;
        }
    };
    if !kernel::supports_map_info() {
        return;
    }
    let err = BpfRingbufBase::from_fd(fd, 4).err().unwrap();
    assert!(matches!(
        err,
        Error::WrongMapType {
            want: BPF_MAP_TYPE_RINGBUF,
            got: BPF_MAP_TYPE_HASH
        }
    ));
    assert_eq!(err.code(), libc::EINVAL);
}

#[test]
#[serial]
fn missing_pin_is_not_found() {
    init();
    let err = BpfRingbuf::<u64>::create("/sys/fs/bpf/bpfkit-no-such-ring").err().unwrap();
    // Sandboxes without bpf access fail before the path lookup.
    if err.code() == libc::EPERM || err.code() == libc::ENOSYS {
        return;
    }
    assert!(err.is_not_found(), "{}", err);
}

#[test]
#[serial]
fn ring_fd_is_usable_for_metadata() {
    let Some(fd) = ring_fd() else { return };
    let ring = BpfRingbufBase::from_fd(fd, 16).unwrap();
    assert_eq!(ring.value_size(), 16);
    assert_eq!(sys::get_fd_max_entries(ring.as_fd()).unwrap(), RING_SIZE);
}

type Record = [u64; 4];

const ETH_HLEN: usize = 14;
const BPF_PROG_TYPE_SOCKET_FILTER: u32 = 1;
const BPF_PSEUDO_MAP_FD: u8 = 1;
const BPF_FUNC_SKB_LOAD_BYTES: i32 = 26;
const BPF_FUNC_RINGBUF_OUTPUT: i32 = 130;

/// BPF_PROG_LOAD, up to the log buffer.
#[repr(C)]
#[derive(Default, IntoBytes, Immutable)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
}

fn record(seq: u64) -> Record {
    [seq, seq ^ 0xa5a5_a5a5_a5a5_a5a5, !seq, seq.rotate_left(17)]
}

fn insn(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw[0] = code;
    raw[1] = dst | (src << 4);
    raw[2..4].copy_from_slice(&off.to_le_bytes());
    raw[4..].copy_from_slice(&imm.to_le_bytes());
    raw
}

/// Socket filter that copies the first 32 bytes of the packet into `ring`.
fn ring_writer(ring: BorrowedFd<'_>) -> Option<OwnedFd> {
    let size = std::mem::size_of::<Record>() as i32;
    let insns = [
        insn(0xbf, 6, 1, 0, 0),                       // r6 = ctx
        insn(0xb7, 2, 0, 0, 0),                       // r2 = 0
        insn(0xbf, 3, 10, 0, 0),                      // r3 = fp
        insn(0x07, 3, 0, 0, -size),                   // r3 += -32
        insn(0xb7, 4, 0, 0, size),                    // r4 = 32
        insn(0x85, 0, 0, 0, BPF_FUNC_SKB_LOAD_BYTES), // skb_load_bytes(ctx, 0, r3, 32)
        insn(0x55, 0, 0, 7, 0),                       // if r0 != 0 goto out
        insn(0x18, 1, BPF_PSEUDO_MAP_FD, 0, ring.as_raw_fd()),
        insn(0, 0, 0, 0, 0),
        insn(0xbf, 2, 10, 0, 0),
        insn(0x07, 2, 0, 0, -size),
        insn(0xb7, 3, 0, 0, size),
        insn(0xb7, 4, 0, 0, 0),
        insn(0x85, 0, 0, 0, BPF_FUNC_RINGBUF_OUTPUT), // ringbuf_output(ring, r2, 32, 0)
        insn(0xb7, 0, 0, 0, 0),                       // out: r0 = 0
        insn(0x95, 0, 0, 0, 0),
    ];
    let license = b"GPL\0";
    let mut log = vec![0u8; 64 * 1024];
    let mut attr = BpfAttr::new(&ProgLoadAttr {
        prog_type: BPF_PROG_TYPE_SOCKET_FILTER,
        insn_cnt: insns.len() as u32,
        insns: insns.as_ptr() as u64,
        license: license.as_ptr() as u64,
        log_level: 1,
        log_size: log.len() as u32,
        log_buf: log.as_mut_ptr() as u64,
    });
    match sys::bpf(BPF_PROG_LOAD, &mut attr) {
        // SAFETY: BPF_PROG_LOAD returns a new descriptor owned by the caller.
        Ok(fd) => Some(unsafe { OwnedFd::from_raw_fd(fd) }),
        Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
            eprintln!("skipping: cannot load socket filters: {}", e);
            None
        }
        Err(e) => {
            let end = log.iter().position(|b| *b == 0).unwrap_or(log.len());
            panic!("verifier rejected ring writer: {}\n{}", e, String::from_utf8_lossy(&log[..end]));
        }
    }
}

/// Run the writer once over a packet carrying `record(seq)`.
fn emit(prog: &OwnedFd, seq: u64) -> std::io::Result<()> {
    let mut packet = vec![0u8; ETH_HLEN];
    packet.extend_from_slice(record(seq).as_bytes());
    sys::run_program(prog.as_fd(), &packet).map(drop)
}

fn kernel_producer() -> Option<(OwnedFd, OwnedFd)> {
    let ring = ring_fd()?;
    let prog = ring_writer(ring.as_fd())?;
    if let Err(e) = emit(&prog, u64::MAX) {
        eprintln!("skipping: cannot test-run programs: {}", e);
        return None;
    }
    Some((ring, prog))
}

#[test]
#[serial]
fn drains_kernel_records_across_wraps() {
    let Some((fd, prog)) = kernel_producer() else { return };
    let mut ring = BpfRingbuf::<Record>::from_fd(fd.try_clone().unwrap()).unwrap();
    let mut seen = Vec::new();
    assert_eq!(ring.consume_all(|r| seen.push(*r)).unwrap(), 1);
    assert_eq!(seen, vec![record(u64::MAX)]);
    assert!(!ring.wait(Some(Duration::from_millis(10))));

    // 40 bytes per record in a 4 KiB ring: 1200 records wrap it 11 times.
    let mut seq = 0;
    for _ in 0..20 {
        let batch: Vec<Record> = (seq..seq + 60).map(record).collect();
        for s in seq..seq + 60 {
            emit(&prog, s).unwrap();
        }
        seq += 60;

        let start = Instant::now();
        assert!(ring.wait(Some(Duration::from_secs(1))));
        assert!(start.elapsed() < Duration::from_secs(1));

        let mut seen = Vec::new();
        assert_eq!(ring.consume_all(|r| seen.push(*r)).unwrap(), 60);
        assert_eq!(seen, batch);
        assert!(ring.is_empty());
    }
}

#[test]
#[serial]
fn wrong_size_record_is_skipped_once() {
    let Some((fd, prog)) = kernel_producer() else { return };
    let mut ring = BpfRingbuf::<Record>::from_fd(fd.try_clone().unwrap()).unwrap();
    assert_eq!(ring.consume_all(|_| {}).unwrap(), 1);

    // Both handles share the kernel's consumer position.
    let mut narrow = BpfRingbuf::<[u64; 2]>::from_fd(fd.try_clone().unwrap()).unwrap();
    emit(&prog, 1).unwrap();
    emit(&prog, 2).unwrap();

    let err = narrow.consume_all(|_| panic!("mis-sized record delivered")).unwrap_err();
    assert!(matches!(err, Error::MessageSize { want: 16, got: 32 }), "{}", err);
    assert_eq!(err.code(), libc::EMSGSIZE);

    let mut seen = Vec::new();
    assert_eq!(ring.consume_all(|r| seen.push(*r)).unwrap(), 1);
    assert_eq!(seen, vec![record(2)]);
    assert!(ring.is_empty());
}
