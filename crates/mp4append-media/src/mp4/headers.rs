//! Header boxes whose durations follow the sample tables: mvhd, mdhd, tkhd, elst.
//! Also stsd, which is carried entry by entry so descriptions can be merged.

use super::atoms::{put_version_and_flags, AtomType, FieldReader};
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};

/// Movie header (mvhd) or media header (mdhd).
///
/// Both share creation/modification/timescale/duration and differ only in
/// the trailing fields, which are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingHeader {
    pub version: u8,
    pub flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    pub duration: u64,
    pub rest: Bytes,
}

impl TimingHeader {
    pub fn decode(atom_type: AtomType, payload: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(atom_type, payload);
        let (version, flags) = r.version_and_flags()?;
        let (creation_time, modification_time, timescale, duration) = if version == 1 {
            (r.u64()?, r.u64()?, r.u32()?, r.u64()?)
        } else {
            (r.u32()? as u64, r.u32()? as u64, r.u32()?, r.u32()? as u64)
        };
        Ok(Self {
            version,
            flags,
            creation_time,
            modification_time,
            timescale,
            duration,
            rest: Bytes::copy_from_slice(r.rest()),
        })
    }

    /// Version 1 is kept once present and chosen when a field outgrows 32 bits.
    fn wide(&self) -> bool {
        self.version == 1
            || self.creation_time > u32::MAX as u64
            || self.modification_time > u32::MAX as u64
            || self.duration > u32::MAX as u64
    }

    pub fn encode_payload(&self, buf: &mut BytesMut) {
        if self.wide() {
            put_version_and_flags(buf, 1, self.flags);
            buf.put_u64(self.creation_time);
            buf.put_u64(self.modification_time);
            buf.put_u32(self.timescale);
            buf.put_u64(self.duration);
        } else {
            put_version_and_flags(buf, 0, self.flags);
            buf.put_u32(self.creation_time as u32);
            buf.put_u32(self.modification_time as u32);
            buf.put_u32(self.timescale);
            buf.put_u32(self.duration as u32);
        }
        buf.put_slice(&self.rest);
    }
}

/// Track header (tkhd).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHeader {
    pub version: u8,
    pub flags: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub track_id: u32,
    pub reserved: u32,
    pub duration: u64,
    /// Reserved words, layer, alternate group, volume and matrix.
    pub layout: Bytes,
    /// Width in 16.16 fixed point.
    pub width: u32,
    /// Height in 16.16 fixed point.
    pub height: u32,
}

impl TrackHeader {
    const LAYOUT_SIZE: usize = 52;

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(AtomType::TKHD, payload);
        let (version, flags) = r.version_and_flags()?;
        let (creation_time, modification_time, track_id, reserved, duration) = if version == 1 {
            (r.u64()?, r.u64()?, r.u32()?, r.u32()?, r.u64()?)
        } else {
            (
                r.u32()? as u64,
                r.u32()? as u64,
                r.u32()?,
                r.u32()?,
                r.u32()? as u64,
            )
        };
        let layout = Bytes::copy_from_slice(r.bytes(Self::LAYOUT_SIZE)?);
        let width = r.u32()?;
        let height = r.u32()?;
        Ok(Self {
            version,
            flags,
            creation_time,
            modification_time,
            track_id,
            reserved,
            duration,
            layout,
            width,
            height,
        })
    }

    pub fn encode_payload(&self, buf: &mut BytesMut) {
        let wide = self.version == 1
            || self.creation_time > u32::MAX as u64
            || self.modification_time > u32::MAX as u64
            || self.duration > u32::MAX as u64;
        if wide {
            put_version_and_flags(buf, 1, self.flags);
            buf.put_u64(self.creation_time);
            buf.put_u64(self.modification_time);
            buf.put_u32(self.track_id);
            buf.put_u32(self.reserved);
            buf.put_u64(self.duration);
        } else {
            put_version_and_flags(buf, 0, self.flags);
            buf.put_u32(self.creation_time as u32);
            buf.put_u32(self.modification_time as u32);
            buf.put_u32(self.track_id);
            buf.put_u32(self.reserved);
            buf.put_u32(self.duration as u32);
        }
        buf.put_slice(&self.layout);
        buf.put_u32(self.width);
        buf.put_u32(self.height);
    }

    /// Pixel dimensions (integer part of the fixed-point fields).
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width >> 16, self.height >> 16)
    }
}

/// One edit list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditEntry {
    /// Duration in movie timescale units.
    pub segment_duration: u64,
    /// Start in media timescale units, -1 for an empty edit.
    pub media_time: i64,
    /// 16.16 fixed-point playback rate.
    pub media_rate: u32,
}

/// Edit list (elst).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditList {
    pub version: u8,
    pub flags: u32,
    pub entries: Vec<EditEntry>,
}

impl EditList {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(AtomType::ELST, payload);
        let (version, flags) = r.version_and_flags()?;
        let count = r.entry_count(if version == 1 { 20 } else { 12 })?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let (segment_duration, media_time) = if version == 1 {
                (r.u64()?, r.u64()? as i64)
            } else {
                (r.u32()? as u64, r.u32()? as i32 as i64)
            };
            entries.push(EditEntry {
                segment_duration,
                media_time,
                media_rate: r.u32()?,
            });
        }
        Ok(Self {
            version,
            flags,
            entries,
        })
    }

    pub fn encode_payload(&self, buf: &mut BytesMut) {
        let wide = self.version == 1
            || self.entries.iter().any(|e| {
                e.segment_duration > u32::MAX as u64
                    || e.media_time > i32::MAX as i64
                    || e.media_time < i32::MIN as i64
            });
        put_version_and_flags(buf, if wide { 1 } else { 0 }, self.flags);
        buf.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            if wide {
                buf.put_u64(entry.segment_duration);
                buf.put_i64(entry.media_time);
            } else {
                buf.put_u32(entry.segment_duration as u32);
                buf.put_i32(entry.media_time as i32);
            }
            buf.put_u32(entry.media_rate);
        }
    }
}

/// Sample description table (stsd), one raw entry per description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleDescriptions {
    pub version: u8,
    pub flags: u32,
    /// Each entry including its own size/type header.
    pub entries: Vec<Bytes>,
}

impl SampleDescriptions {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(AtomType::STSD, payload);
        let (version, flags) = r.version_and_flags()?;
        // Every entry carries at least its own 8-byte header.
        let count = r.entry_count(8)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let size = r.u32()? as usize;
            if size < 8 {
                return Err(crate::Error::malformed(format!(
                    "stsd entry declares size {size}"
                )));
            }
            let body = r.bytes(size - 4)?;
            let mut entry = BytesMut::with_capacity(size);
            entry.put_u32(size as u32);
            entry.put_slice(body);
            entries.push(entry.freeze());
        }
        Ok(Self {
            version,
            flags,
            entries,
        })
    }

    pub fn encode_payload(&self, buf: &mut BytesMut) {
        put_version_and_flags(buf, self.version, self.flags);
        buf.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_slice(entry);
        }
    }

    /// Four-character format of the 1-based entry `index`, e.g. `avc1`.
    pub fn format(&self, index: u32) -> Option<AtomType> {
        let entry = self.entries.get(index.checked_sub(1)? as usize)?;
        let code: [u8; 4] = entry.get(4..8)?.try_into().ok()?;
        Some(AtomType::from_bytes(code))
    }
}
