use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by map and ring buffer handles.
///
/// Every variant maps onto a kernel-style errno through [`Error::code`], so
/// callers that speak errno (or forward it across a process boundary) lose
/// nothing by going through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// The key (or, for first/next key queries, any further key) is absent.
    #[error("{op}: no such entry")]
    NotFound { op: &'static str },

    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to open pinned object {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("wrong map type: expected {want}, found {got}")]
    WrongMapType { want: u32, got: u32 },

    #[error("ring buffer size {0} is not a power of two")]
    InvalidMaxEntries(u32),

    #[error("failed to map ring buffer {region} region: {source}")]
    Mmap {
        region: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("ring buffer message of {got} bytes, expected {want}")]
    MessageSize { want: usize, got: u32 },

    #[error("{op}: buffer of {got} bytes, map uses {want}")]
    BufferSize {
        op: &'static str,
        want: usize,
        got: usize,
    },

    #[error("kernel does not report {field}")]
    Unsupported { field: &'static str },

    #[error("invalid map dump line: {0}")]
    InvalidDump(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// errno equivalent of this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound { .. } => libc::ENOENT,
            Error::Io { source, .. } | Error::Open { source, .. } | Error::Mmap { source, .. } => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            Error::WrongMapType { .. } | Error::InvalidMaxEntries(_) => libc::EINVAL,
            Error::BufferSize { .. } | Error::InvalidDump(_) => libc::EINVAL,
            Error::MessageSize { .. } => libc::EMSGSIZE,
            Error::Unsupported { .. } => libc::EOPNOTSUPP,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == libc::ENOENT
    }

    /// Wraps a failed syscall, keeping ENOENT distinguishable from the rest.
    pub(crate) fn from_io(op: &'static str) -> impl Fn(io::Error) -> Error {
        move |source| match source.raw_os_error() {
            Some(libc::ENOENT) => Error::NotFound { op },
            _ => Error::Io { op, source },
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io { source, .. } | Error::Open { source, .. } | Error::Mmap { source, .. } => source,
            other => io::Error::from_raw_os_error(other.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enoent_becomes_not_found() {
        let err = Error::from_io("lookup")(io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(err, Error::NotFound { op: "lookup" }));
        assert!(err.is_not_found());

        let err = Error::from_io("update")(io::Error::from_raw_os_error(libc::E2BIG));
        assert!(!err.is_not_found());
        assert_eq!(err.code(), libc::E2BIG);
    }

    #[test]
    fn codes() {
        assert_eq!(Error::MessageSize { want: 16, got: 8 }.code(), libc::EMSGSIZE);
        assert_eq!(Error::WrongMapType { want: 27, got: 1 }.code(), libc::EINVAL);
        assert_eq!(Error::Unsupported { field: "map_flags" }.code(), libc::EOPNOTSUPP);
        let open = Error::Open {
            path: PathBuf::from("/sys/fs/bpf/missing"),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(open.is_not_found());
        assert_eq!(io::Error::from(open).raw_os_error(), Some(libc::ENOENT));
    }
}
