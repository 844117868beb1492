//! Facts about the running kernel that gate optional behaviour.

use std::fmt;

use lazy_static::lazy_static;
use log::warn;
use nix::sys::utsname::uname;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the leading `major.minor.patch` of a release string such as
    /// `6.1.0-13-amd64`. Parsing stops at the first component that is not a
    /// number; missing components read as zero.
    pub fn parse(release: &str) -> Self {
        let mut parts = [0u32; 3];
        let mut rest = release.trim_start();
        for (i, slot) in parts.iter_mut().enumerate() {
            if i > 0 {
                match rest.strip_prefix('.') {
                    Some(r) => rest = r,
                    None => break,
                }
            }
            let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            match rest[..digits].parse() {
                Ok(v) => *slot = v,
                Err(_) => break,
            }
            rest = &rest[digits..];
        }
        Self::new(parts[0], parts[1], parts[2])
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

lazy_static! {
    static ref KERNEL_VERSION: KernelVersion = uncached_kernel_version();
    static ref KERNEL_64BIT: bool = detect_kernel_64bit();
}

fn uncached_kernel_version() -> KernelVersion {
    match uname() {
        Ok(uts) => KernelVersion::parse(&uts.release().to_string_lossy()),
        Err(e) => {
            warn!("uname failed, assuming kernel 0.0.0: {}", e);
            KernelVersion::default()
        }
    }
}

/// Version of the running kernel, computed once per process.
pub fn kernel_version() -> KernelVersion {
    *KERNEL_VERSION
}

pub fn is_at_least_kernel_version(major: u32, minor: u32, patch: u32) -> bool {
    kernel_version() >= KernelVersion::new(major, minor, patch)
}

/// Map metadata queries (key size, value size, flags) need 4.14.
pub fn supports_map_info() -> bool {
    is_at_least_kernel_version(4, 14, 0)
}

pub const fn is_userspace_64bit() -> bool {
    cfg!(target_pointer_width = "64")
}

pub const fn is_userspace_32bit() -> bool {
    cfg!(target_pointer_width = "32")
}

pub fn is_kernel_64bit() -> bool {
    is_userspace_64bit() || *KERNEL_64BIT
}

pub fn is_kernel_32bit() -> bool {
    !is_kernel_64bit()
}

/// A 32-bit process under `linux32` sees a 32-bit `uname -m`. Clearing the
/// personality's execution domain bits first reveals the real machine.
fn detect_kernel_64bit() -> bool {
    const PER_MASK: libc::c_int = 0x00ff;
    const PER_LINUX: libc::c_int = 0x0000;

    // SAFETY: 0xffffffff only queries the current personality.
    let old = unsafe { libc::personality(0xffff_ffff) };
    if old == -1 {
        return false;
    }
    let wanted = (old & !PER_MASK) | PER_LINUX;
    if wanted != old {
        // SAFETY: only the execution domain bits change; restored below.
        let prev = unsafe { libc::personality(wanted as libc::c_ulong) };
        if prev == -1 {
            return false;
        }
    }
    let machine = uname().map(|uts| uts.machine().to_string_lossy().into_owned());
    if wanted != old {
        // SAFETY: restores the value read above.
        unsafe { libc::personality(old as libc::c_ulong) };
    }
    match machine {
        Ok(machine) => machine.contains("64"),
        Err(e) => {
            warn!("uname failed while probing kernel bitness: {}", e);
            false
        }
    }
}

/// Architecture this binary was built for.
pub const fn native_arch() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "x86-64"
    } else if cfg!(target_arch = "x86") {
        "x86"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else if cfg!(target_arch = "arm") {
        "arm"
    } else if cfg!(target_arch = "riscv64") {
        "riscv64"
    } else {
        "unknown"
    }
}

/// Kernel bitness on top of the native arch, e.g. `64-on-x86-64` or
/// `64-on-x86` for a 32-bit build running on a 64-bit kernel.
pub fn describe_arch() -> String {
    let bits = if is_kernel_64bit() { 64 } else { 32 };
    format!("{}-on-{}", bits, native_arch())
}
