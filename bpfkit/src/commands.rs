use std::io::Write;
use std::os::fd::AsFd;
use std::path::Path;

use anyhow::Context;
use bpfkit_userspace::abi::info::obj_name;
use bpfkit_userspace::abi::map_type_name;
use bpfkit_userspace::{dump, kernel, sys, MapWrite, RawMap, ReadOnly, ReadWrite};
use log::info;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct KernelReport {
    pub version: String,
    pub arch: String,
    pub kernel_64bit: bool,
    pub userspace_64bit: bool,
    pub supports_map_info: bool,
}

impl KernelReport {
    pub fn current() -> Self {
        KernelReport {
            version: kernel::kernel_version().to_string(),
            arch: kernel::describe_arch(),
            kernel_64bit: kernel::is_kernel_64bit(),
            userspace_64bit: kernel::is_userspace_64bit(),
            supports_map_info: kernel::supports_map_info(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MapMetadata {
    pub id: u32,
    pub name: String,
    pub map_type: u32,
    pub type_name: &'static str,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
}

/// Read the metadata of the map pinned at `path`.
///
/// # Arguments
///
/// * `path` - Pinned map path.
///
/// # Returns
///
/// The kernel's metadata record, or an error if the map cannot be opened or
/// the kernel predates metadata queries.
pub fn map_metadata(path: &Path) -> Result<MapMetadata, anyhow::Error> {
    let fd = sys::map_retrieve_ro(path).with_context(|| format!("opening {}", path.display()))?;
    let (info, _) = sys::get_map_info(fd.as_fd())
        .with_context(|| format!("querying {}", path.display()))?;
    Ok(MapMetadata {
        id: info.id,
        name: obj_name(&info.name).to_string(),
        map_type: info.map_type,
        type_name: map_type_name(info.map_type),
        key_size: info.key_size,
        value_size: info.value_size,
        max_entries: info.max_entries,
        map_flags: info.map_flags,
    })
}

/// Print every entry of the map pinned at `path`.
///
/// # Arguments
///
/// * `path` - Pinned map path.
/// * `base64` - Write `key,value` base64 lines instead of hex.
/// * `out` - Destination for the dump.
pub fn dump_map<W: Write + ?Sized>(path: &Path, base64: bool, out: &mut W) -> Result<(), anyhow::Error> {
    let map: RawMap<ReadOnly> =
        RawMap::open(path).with_context(|| format!("opening {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    dump::dump_raw_map(&map, out, &name, base64)?;
    Ok(())
}

/// Delete every entry of the map pinned at `path`.
pub fn clear_map(path: &Path) -> Result<(), anyhow::Error> {
    let map: RawMap<ReadWrite> =
        RawMap::open(path).with_context(|| format!("opening {}", path.display()))?;
    map.clear()
        .with_context(|| format!("clearing {}", path.display()))?;
    info!("Cleared {}", path.display());
    Ok(())
}

/// One status line telling whether the map pinned at `path` opens. Only the
/// pin is retrieved, so kernels without metadata queries still report `OK`.
pub fn map_status<W: Write + ?Sized>(name: &str, path: &Path, out: &mut W) -> Result<(), anyhow::Error> {
    let fd = sys::map_retrieve_ro(path).ok();
    dump::dump_map_status(fd.as_ref(), out, name, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpfkit_userspace::abi::BPF_MAP_TYPE_HASH;

    #[test]
    fn kernel_report_matches_library() {
        let report = KernelReport::current();
        assert_eq!(report.version, kernel::kernel_version().to_string());
        assert!(report.arch.contains("-on-"));
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("supports_map_info").is_some());
    }

    #[test]
    fn status_of_missing_pin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        let mut out = Vec::new();
        map_status("events", &path, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!(
                "events: NULL(map is not pinned to {}: No such file or directory)\n",
                path.display()
            )
        );
    }

    #[test]
    fn status_of_pinned_map() {
        let root = Path::new("/sys/fs/bpf");
        let fd = match sys::create_map(BPF_MAP_TYPE_HASH, 4, 4, 4, 0) {
            Ok(fd) if root.is_dir() => fd,
            _ => {
                eprintln!("skipping: cannot create and pin bpf maps here");
                return;
            }
        };
        let path = root.join(format!("bpfkit-status-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        if let Err(e) = sys::pin_object(fd.as_fd(), &path) {
            eprintln!("skipping: cannot pin to {}: {}", path.display(), e);
            return;
        }

        let mut out = Vec::new();
        map_status("events", &path, &mut out).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "events: OK\n");
    }

    #[test]
    fn status_of_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        std::fs::write(&path, b"").unwrap();
        let mut out = Vec::new();
        map_status("events", &path, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("events: NULL(map is pinned to {})\n", path.display())
        );
    }

    #[test]
    fn missing_map_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing");
        let err = dump_map(&path, false, &mut Vec::new()).unwrap_err();
        assert!(format!("{:#}", err).contains("nothing"));
    }
}
