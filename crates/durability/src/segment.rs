//! WAL segment files.
//!
//! Segments are named `wal-NNNNNNNN.seg`. Each starts with a fixed 32-byte
//! header; records follow back to back. Only the newest segment is
//! writable; closed segments are immutable until pruned.

use helio_core::error::{Error, PersistenceKind, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a HelioDB WAL segment.
pub const SEGMENT_MAGIC: [u8; 4] = *b"HLWL";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Fixed header at the start of every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes.
    pub magic: [u8; 4],
    /// Format version.
    pub format_version: u32,
    /// Monotonic segment number within its stream.
    pub segment_number: u64,
    /// Owning database UUID.
    pub database_uuid: [u8; 16],
}

impl SegmentHeader {
    /// Header for a fresh segment.
    pub fn new(segment_number: u64, database_uuid: [u8; 16]) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            segment_number,
            database_uuid,
        }
    }

    /// Serialize to the fixed layout.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.segment_number.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.database_uuid);
        bytes
    }

    /// Parse from the fixed layout.
    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Option<Self> {
        let header = SegmentHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            segment_number: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            database_uuid: bytes[16..32].try_into().ok()?,
        };
        (header.magic == SEGMENT_MAGIC).then_some(header)
    }
}

/// An open, writable WAL segment.
pub struct WalSegment {
    file: File,
    path: PathBuf,
    segment_number: u64,
    write_position: u64,
}

impl WalSegment {
    /// File name for a segment number.
    pub fn file_name(segment_number: u64) -> String {
        format!("wal-{segment_number:08}.seg")
    }

    /// Parse a segment number out of a file name.
    pub fn parse_file_name(name: &str) -> Option<u64> {
        name.strip_prefix("wal-")?
            .strip_suffix(".seg")?
            .parse()
            .ok()
    }

    /// Create a fresh segment and write its header.
    pub fn create(dir: &Path, segment_number: u64, database_uuid: [u8; 16]) -> Result<Self> {
        let path = dir.join(Self::file_name(segment_number));
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| sharing_or_io(&path, e))?;
        file.write_all(&SegmentHeader::new(segment_number, database_uuid).to_bytes())?;
        file.sync_all()?;
        Ok(WalSegment {
            file,
            path,
            segment_number,
            write_position: SEGMENT_HEADER_SIZE as u64,
        })
    }

    /// Open an existing segment for appending, verifying its header.
    pub fn open_for_append(path: &Path, database_uuid: [u8; 16]) -> Result<Self> {
        let (header, len) = Self::read_header(path)?;
        if header.database_uuid != database_uuid {
            return Err(Error::Persistence(PersistenceKind::CorruptLog(format!(
                "segment {} belongs to another database",
                path.display()
            ))));
        }
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| sharing_or_io(path, e))?;
        Ok(WalSegment {
            file,
            path: path.to_path_buf(),
            segment_number: header.segment_number,
            write_position: len,
        })
    }

    /// Read and validate a segment header plus the file length.
    pub fn read_header(path: &Path) -> Result<(SegmentHeader, u64)> {
        let mut file = File::open(path).map_err(|e| sharing_or_io(path, e))?;
        let len = file.metadata()?.len();
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut bytes).map_err(|_| {
            Error::Persistence(PersistenceKind::CorruptLog(format!(
                "segment {} shorter than its header",
                path.display()
            )))
        })?;
        let header = SegmentHeader::from_bytes(&bytes).ok_or_else(|| {
            Error::Persistence(PersistenceKind::CorruptLog(format!(
                "segment {} has a bad header",
                path.display()
            )))
        })?;
        if header.format_version != SEGMENT_FORMAT_VERSION {
            return Err(Error::Persistence(PersistenceKind::CorruptLog(format!(
                "segment {} format {} unsupported",
                path.display(),
                header.format_version
            ))));
        }
        Ok((header, len))
    }

    /// Read a segment's record bytes (everything after the header).
    pub fn read_records(path: &Path) -> Result<Vec<u8>> {
        let (_, _) = Self::read_header(path)?;
        let mut file = File::open(path).map_err(|e| sharing_or_io(path, e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes.split_off(SEGMENT_HEADER_SIZE))
    }

    /// Append framed record bytes.
    pub fn append(&mut self, framed: &[u8]) -> Result<()> {
        self.file.write_all(framed)?;
        self.write_position += framed.len() as u64;
        Ok(())
    }

    /// Flush to the OS and force to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Truncate the file to `len` bytes. Recovery uses this to cut a torn
    /// tail.
    pub fn truncate(path: &Path, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| sharing_or_io(path, e))?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    /// Bytes written so far, header included.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// This segment's number.
    pub fn segment_number(&self) -> u64 {
        self.segment_number
    }

    /// This segment's path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sharing_or_io(path: &Path, e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::WouldBlock => {
            Error::Persistence(PersistenceKind::SharingViolation(path.display().to_string()))
        }
        _ => Error::Persistence(PersistenceKind::IoError(format!(
            "{}: {e}",
            path.display()
        ))),
    }
}
