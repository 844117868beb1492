//! Text renderings of map contents for diagnostics output.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::mem::size_of;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use nix::unistd::{access, AccessFlags};

use crate::error::{Error, Result};
use crate::map::mode::CanRead;
use crate::map::{MapRead, Pod};
use crate::raw_map::RawMap;

pub const BASE64_DELIMITER: char = ',';

/// `"<base64 key>,<base64 value>"` over the raw bytes of `key` and `value`.
pub fn to_base64_encoded_string<K: Pod, V: Pod>(key: &K, value: &V) -> String {
    encode_entry(key.as_bytes(), value.as_bytes())
}

fn encode_entry(key: &[u8], value: &[u8]) -> String {
    format!(
        "{}{}{}",
        STANDARD.encode(key),
        BASE64_DELIMITER,
        STANDARD.encode(value)
    )
}

/// Strict inverse of [`to_base64_encoded_string`]: exactly two fields, each
/// valid base64 of exactly the size of its type.
pub fn from_base64_encoded_string<K: Pod, V: Pod>(line: &str) -> Result<(K, V)> {
    let fields: Vec<&str> = line.split(BASE64_DELIMITER).collect();
    if fields.len() != 2 {
        return Err(Error::InvalidDump(format!(
            "expected 2 fields, found {}",
            fields.len()
        )));
    }
    Ok((decode_field(fields[0], "key")?, decode_field(fields[1], "value")?))
}

fn decode_field<T: Pod>(field: &str, what: &str) -> Result<T> {
    let bytes = STANDARD
        .decode(field)
        .map_err(|e| Error::InvalidDump(format!("{} is not valid base64: {}", what, e)))?;
    T::read_from_bytes(&bytes).map_err(|_| {
        Error::InvalidDump(format!(
            "{} decodes to {} bytes, expected {}",
            what,
            bytes.len(),
            size_of::<T>()
        ))
    })
}

/// Lower-case hex, two digits per byte.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Writes `name:`, then the indented `header` if not empty, then one indented
/// `format(key, value)` line per entry. A failed walk is reported in the
/// output after the entries read so far.
pub fn dump_map<K, V, M, W>(
    map: &M,
    w: &mut W,
    name: &str,
    header: &str,
    format: impl Fn(&K, &V) -> String,
) -> io::Result<()>
where
    M: MapRead<K, V>,
    W: Write + ?Sized,
{
    writeln!(w, "{}:", name)?;
    if !header.is_empty() {
        writeln!(w, "  {}", header)?;
    }
    let mut lines = Vec::new();
    let walk = map.iterate_with_value(|key, value, _| {
        lines.push(format(key, value));
        Ok(())
    });
    for line in lines {
        writeln!(w, "  {}", line)?;
    }
    if let Err(e) = walk {
        writeln!(w, "Map dump end with error: {}", e)?;
    }
    Ok(())
}

/// One status line for a map the caller may have failed to open: `OK`, or
/// why it is missing judging by the pin at `path`.
pub fn dump_map_status<M, W>(map: Option<&M>, w: &mut W, name: &str, path: &Path) -> io::Result<()>
where
    W: Write + ?Sized,
{
    if map.is_some() {
        return writeln!(w, "{}: OK", name);
    }
    match access(path, AccessFlags::R_OK) {
        Ok(()) => writeln!(w, "{}: NULL(map is pinned to {})", name, path.display()),
        Err(errno) => writeln!(
            w,
            "{}: NULL(map is not pinned to {}: {})",
            name,
            path.display(),
            errno.desc()
        ),
    }
}

/// Dump a raw map as `key=<hex>, val=<hex>` lines, or base64 entry lines.
pub fn dump_raw_map<A: CanRead, W: Write + ?Sized>(
    map: &RawMap<A>,
    w: &mut W,
    name: &str,
    base64: bool,
) -> io::Result<()> {
    let header = format!("key size {}, value size {}", map.key_size(), map.value_size());
    if base64 {
        dump_map(map, w, name, &header, |k: &Vec<u8>, v: &Vec<u8>| encode_entry(k, v))
    } else {
        dump_map(map, w, name, &header, |k: &Vec<u8>, v: &Vec<u8>| {
            format!("key={}, val={}", hex(k), hex(v))
        })
    }
}
