//! MP4 atom definitions and header encoding.

use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Size of a compact box header (32-bit size + type).
pub const HEADER_SIZE: u8 = 8;

/// Size of an extended box header (size field = 1, followed by a 64-bit size).
pub const LARGE_HEADER_SIZE: u8 = 16;

/// Four-character atom type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomType(pub [u8; 4]);

impl AtomType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MDAT: Self = Self(*b"mdat");
    pub const FREE: Self = Self(*b"free");
    pub const SKIP: Self = Self(*b"skip");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const MVEX: Self = Self(*b"mvex");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const EDTS: Self = Self(*b"edts");
    pub const ELST: Self = Self(*b"elst");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const STTS: Self = Self(*b"stts");
    pub const CTTS: Self = Self(*b"ctts");
    pub const STSS: Self = Self(*b"stss");
    pub const STSC: Self = Self(*b"stsc");
    pub const STSZ: Self = Self(*b"stsz");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    /// Whether boxes of this type are walked into when the movie box is parsed.
    ///
    /// Other containers (`udta`, `dinf`, `meta`) are carried as opaque payload.
    pub fn is_container(&self) -> bool {
        matches!(
            *self,
            Self::MOOV | Self::TRAK | Self::EDTS | Self::MDIA | Self::MINF | Self::STBL
        )
    }

    /// Sample-indexed tables that go stale once chunks are added or removed.
    pub fn is_stale_after_edit(&self) -> bool {
        matches!(
            &self.0,
            b"sdtp" | b"sbgp" | b"sgpd" | b"stps" | b"subs" | b"saiz" | b"saio" | b"cslg"
                | b"stsh" | b"padb"
        )
    }
}

impl std::fmt::Display for AtomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed atom header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Atom {
    /// Atom type code.
    pub atom_type: AtomType,
    /// Atom size including header.
    pub size: u64,
    /// File offset of the first header byte.
    pub offset: u64,
    /// Size of the header (8 or 16 bytes).
    pub header_size: u8,
}

impl Atom {
    /// File offset where atom data starts (after header).
    pub fn data_offset(&self) -> u64 {
        self.offset + self.header_size as u64
    }

    /// Get the data size (size - header).
    pub fn data_size(&self) -> u64 {
        self.size.saturating_sub(self.header_size as u64)
    }

    /// File offset one past the last byte of this atom.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Decode the box header at `offset` whose parent ends at `limit`.
///
/// `header` holds the bytes starting at `offset` (at least 8, or 16 for an
/// extended size when available). A size field of 0 means the box runs to
/// `limit`; 1 means a 64-bit size follows the type.
pub fn decode_header(header: &[u8], offset: u64, limit: u64) -> Result<Atom> {
    let available = limit.saturating_sub(offset);
    if available < HEADER_SIZE as u64 || header.len() < HEADER_SIZE as usize {
        return Err(Error::malformed(format!(
            "{available} bytes left at offset {offset}, too few for a box header"
        )));
    }

    let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
    let atom_type = AtomType::from_bytes([header[4], header[5], header[6], header[7]]);

    let (size, header_size) = match size {
        0 => (available, HEADER_SIZE),
        1 => {
            if available < LARGE_HEADER_SIZE as u64 || header.len() < LARGE_HEADER_SIZE as usize {
                return Err(Error::malformed(format!(
                    "{atom_type} at offset {offset} has a truncated 64-bit size"
                )));
            }
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&header[8..16]);
            (u64::from_be_bytes(ext), LARGE_HEADER_SIZE)
        }
        n => (n, HEADER_SIZE),
    };

    if size < header_size as u64 {
        return Err(Error::malformed(format!(
            "{atom_type} at offset {offset} declares size {size}, smaller than its header"
        )));
    }
    if size > available {
        return Err(Error::malformed(format!(
            "{atom_type} at offset {offset} declares size {size} but only {available} bytes remain in its parent"
        )));
    }

    Ok(Atom {
        atom_type,
        size,
        offset,
        header_size,
    })
}

/// Header width needed for a box carrying `payload_len` bytes.
pub fn header_size_for(payload_len: u64) -> u8 {
    if payload_len + HEADER_SIZE as u64 > u32::MAX as u64 {
        LARGE_HEADER_SIZE
    } else {
        HEADER_SIZE
    }
}

/// Append a box header sized for `payload_len` bytes of payload.
pub fn put_header(buf: &mut BytesMut, atom_type: AtomType, payload_len: u64) {
    let header_size = header_size_for(payload_len);
    // Cannot fail: the width was chosen to fit.
    let _ = put_header_with_width(buf, atom_type, payload_len + header_size as u64, header_size);
}

/// Append a box header of a fixed width. Returns `false` if `total_size`
/// does not fit a compact header.
pub fn put_header_with_width(
    buf: &mut BytesMut,
    atom_type: AtomType,
    total_size: u64,
    header_size: u8,
) -> bool {
    if header_size == LARGE_HEADER_SIZE {
        buf.put_u32(1);
        buf.put_slice(&atom_type.0);
        buf.put_u64(total_size);
        true
    } else if total_size <= u32::MAX as u64 {
        buf.put_u32(total_size as u32);
        buf.put_slice(&atom_type.0);
        true
    } else {
        false
    }
}

/// Bounds-checked big-endian field reader over a box payload.
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
    atom_type: AtomType,
}

impl<'a> FieldReader<'a> {
    pub fn new(atom_type: AtomType, data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            atom_type,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(Error::malformed(format!(
                "{} payload truncated: need {} bytes at {}, have {}",
                self.atom_type,
                n,
                self.pos,
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read the FullBox version byte and 24-bit flags.
    pub fn version_and_flags(&mut self) -> Result<(u8, u32)> {
        let word = self.u32()?;
        Ok(((word >> 24) as u8, word & 0x00FF_FFFF))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Read an entry count and check that `entry_size * count` bytes remain.
    pub fn entry_count(&mut self, entry_size: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        let needed = count.checked_mul(entry_size).ok_or_else(|| {
            Error::malformed(format!("{} entry count {} overflows", self.atom_type, count))
        })?;
        if self.remaining() < needed {
            return Err(Error::malformed(format!(
                "{} declares {} entries but only {} bytes remain",
                self.atom_type,
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

/// Append a FullBox version/flags word.
pub fn put_version_and_flags(buf: &mut BytesMut, version: u8, flags: u32) {
    buf.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
}
