//! Map round trips against the running kernel. Every test skips when the
//! process may not create bpf maps.

use std::fs;
use std::path::{Path, PathBuf};

use bpfkit_userspace::abi::{
    BPF_ANY, BPF_EXIST, BPF_MAP_TYPE_ARRAY, BPF_MAP_TYPE_ARRAY_OF_MAPS, BPF_MAP_TYPE_HASH,
    BPF_NOEXIST,
};
use bpfkit_userspace::{
    dump, kernel, sys, BpfMap, BpfMapRO, MapRead, MapSchema, MapWrite, RawMap, ReadOnly,
};
use serial_test::serial;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn hash_map() -> Option<BpfMap<u32, u64>> {
    init();
    if !kernel::supports_map_info() {
        eprintln!("skipping: kernel {} cannot report map metadata", kernel::kernel_version());
        return None;
    }
    match BpfMap::create(BPF_MAP_TYPE_HASH, 16, 0) {
        Ok(map) => Some(map),
        Err(e) => {
            eprintln!("skipping: cannot create bpf map: {}", e);
            None
        }
    }
}

fn bpffs_pin(name: &str) -> Option<PathBuf> {
    let root = Path::new("/sys/fs/bpf");
    if !root.is_dir() {
        eprintln!("skipping: no bpf filesystem at {}", root.display());
        return None;
    }
    let path = root.join(format!("bpfkit-test-{}-{}", name, std::process::id()));
    let _ = fs::remove_file(&path);
    Some(path)
}

#[test]
#[serial]
fn write_read_delete() {
    let Some(map) = hash_map() else { return };

    assert!(map.is_empty().unwrap());
    assert!(map.read_value(&1).unwrap_err().is_not_found());

    map.write_value(&1, &100, BPF_ANY).unwrap();
    assert_eq!(map.read_value(&1).unwrap(), 100);
    assert_eq!(map.get_first_key().unwrap(), 1);
    assert!(map.get_next_key(&1).unwrap_err().is_not_found());

    assert_eq!(map.write_value(&1, &5, BPF_NOEXIST).unwrap_err().code(), libc::EEXIST);
    assert!(map.write_value(&2, &5, BPF_EXIST).unwrap_err().is_not_found());

    map.delete_value(&1).unwrap();
    assert!(map.delete_value(&1).unwrap_err().is_not_found());
    assert!(map.is_empty().unwrap());
}

#[test]
#[serial]
fn iterate_while_deleting_and_clear() {
    let Some(map) = hash_map() else { return };

    for k in 0..10u32 {
        map.write_value(&k, &(u64::from(k) * 3), BPF_ANY).unwrap();
    }
    let mut total = 0;
    map.iterate_with_value(|k, v, _| {
        assert_eq!(*v, u64::from(*k) * 3);
        total += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(total, 10);

    let mut seen = Vec::new();
    map.iterate(|k, m| {
        seen.push(*k);
        if k % 2 == 0 {
            m.delete_value(k)?;
        }
        Ok(())
    })
    .unwrap();
    seen.sort();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());

    map.clear().unwrap();
    assert!(map.is_empty().unwrap());
}

#[test]
#[serial]
fn metadata_matches_creation() {
    let Some(map) = hash_map() else { return };
    let schema = MapSchema::query(map.fd()).unwrap();
    assert_eq!(schema.key_size, 4);
    assert_eq!(schema.value_size, 8);
    assert_eq!(sys::get_fd_map_type(map.fd()).unwrap(), BPF_MAP_TYPE_HASH);
    assert_eq!(sys::get_fd_max_entries(map.fd()).unwrap(), 16);
    assert!(sys::get_fd_map_id(map.fd()).unwrap() > 0);
}

#[test]
#[serial]
fn clone_shares_the_map() {
    let Some(map) = hash_map() else { return };
    let other = map.try_clone().unwrap();
    map.write_value(&9, &81, BPF_ANY).unwrap();
    assert_eq!(other.read_value(&9).unwrap(), 81);
}

#[test]
#[serial]
fn raw_map_sees_typed_writes() {
    let Some(map) = hash_map() else { return };
    map.write_value(&123, &456, BPF_ANY).unwrap();

    let raw: RawMap<ReadOnly> = RawMap::from_fd(map.fd().try_clone_to_owned().unwrap()).unwrap();
    assert_eq!(raw.key_size(), 4);
    assert_eq!(raw.value_size(), 8);
    let key = raw.get_first_key().unwrap();
    assert_eq!(key, 123u32.to_ne_bytes());
    assert_eq!(raw.read_value(&key).unwrap(), 456u64.to_ne_bytes());
    assert!(raw.read_value(&vec![0u8; 3]).is_err());

    let mut out = Vec::new();
    dump::dump_raw_map(&raw, &mut out, "raw", false).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("raw:\n  key size 4, value size 8\n"), "{}", text);
    assert!(text.contains("key=7b000000, val=c801000000000000"), "{}", text);
}

#[test]
#[serial]
fn pin_and_reopen_read_only() {
    let Some(map) = hash_map() else { return };
    let Some(path) = bpffs_pin("ro") else { return };
    if let Err(e) = map.pin(&path) {
        eprintln!("skipping: cannot pin: {}", e);
        return;
    }
    map.write_value(&5, &25, BPF_ANY).unwrap();

    let ro: BpfMapRO<u32, u64> = BpfMap::open(&path).unwrap();
    assert_eq!(ro.read_value(&5).unwrap(), 25);

    let mut status = Vec::new();
    dump::dump_map_status(Some(&ro), &mut status, "pinned", &path).unwrap();
    assert_eq!(String::from_utf8(status).unwrap(), "pinned: OK\n");

    fs::remove_file(&path).unwrap();
    let err = BpfMapRO::<u32, u64>::open(&path).err().unwrap();
    assert!(err.is_not_found());
}

#[test]
#[serial]
fn outer_map_from_template() {
    init();
    let inner = match sys::create_map(BPF_MAP_TYPE_ARRAY, 4, 4, 1, 0) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("skipping: cannot create bpf map: {}", e);
            return;
        }
    };
    use std::os::fd::AsFd;
    let outer = sys::create_outer_map(BPF_MAP_TYPE_ARRAY_OF_MAPS, 4, 2, 0, inner.as_fd()).unwrap();
    assert_eq!(sys::get_fd_map_type(outer.as_fd()).unwrap(), BPF_MAP_TYPE_ARRAY_OF_MAPS);
}
