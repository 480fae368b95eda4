//! Indirection records.
//!
//! A record is a small regular file left at the fast-store path of a Slow-tier
//! file. It carries a fixed magic header followed by the slow-store path, so
//! it can never be mistaken for a user-created symbolic link. The bytes are
//! payload only: a file is a record because it carries the mark written by
//! [`Storage::write_record`](crate::storage::Storage::write_record), whatever
//! it contains.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const MAGIC: &[u8] = b"TIERFS\0IND";
const FORMAT: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 2;

/// Largest file that may be a record: header plus a PATH_MAX target.
pub const MAX_RECORD_LEN: u64 = (HEADER_LEN + libc::PATH_MAX as usize) as u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndirectionRecord {
    pub target: PathBuf,
}

impl IndirectionRecord {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let target = self.target.as_os_str().as_bytes();
        let mut buf = Vec::with_capacity(HEADER_LEN + target.len());
        buf.extend_from_slice(MAGIC);
        buf.push(FORMAT);
        buf.push(b'\n');
        buf.extend_from_slice(target);
        buf
    }

    /// Decode a record; `None` when the bytes are not a record at all.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if !has_magic(bytes) || bytes.len() <= HEADER_LEN {
            return None;
        }
        if bytes[MAGIC.len()] != FORMAT || bytes[MAGIC.len() + 1] != b'\n' {
            return None;
        }
        let target = Path::new(OsStr::from_bytes(&bytes[HEADER_LEN..]));
        if !target.is_absolute() || target.as_os_str().as_bytes().contains(&0) {
            return None;
        }
        Some(Self::new(target))
    }
}

fn has_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

/// Whether a file of this length could hold a record.
pub fn plausible_len(len: u64) -> bool {
    len > HEADER_LEN as u64 && len <= MAX_RECORD_LEN
}
