//! In-place patch of an append-ready destination.
//!
//! The destination keeps its ftyp and its mdat start. New payload goes right
//! after the last kept chunk, the mdat size is updated in its existing header,
//! and the movie box is rewritten at its old offset with the free box resized
//! to fill the gap up to mdat. Payload is always written before the movie box
//! that references it.

use super::{copy_chunks, open_inputs, MovieEdit, WriteOptions, WriteReport};
use crate::mp4::atoms::{put_header_with_width, AtomType, HEADER_SIZE, LARGE_HEADER_SIZE};
use crate::plan::Strategy;
use crate::Result;
use bytes::{Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info};

/// A checked in-place update, ready to apply.
#[derive(Debug, Clone)]
pub struct InPlacePatch {
    /// Movie box for the kept chunks alone, committed before any trimmed
    /// bytes are overwritten.
    trimmed_movie: Option<Bytes>,
    movie: Bytes,
    media_header: Bytes,
    payload_start: u64,
    media_data_size: u64,
    file_size: u64,
}

impl InPlacePatch {
    /// Check every precondition of the in-place path.
    ///
    /// Returns `None` when the destination must be rewritten instead. Nothing
    /// is written here.
    pub fn prepare(edit: &MovieEdit) -> Result<Option<Self>> {
        let layout = &edit.target.layout;
        let free = match layout.free {
            Some(free) if layout.is_append_ready() => free,
            _ => return Ok(reject("layout is not ftyp, moov, free, mdat with mdat last")),
        };

        let media_data = layout.media_data;
        let data_start = media_data.data_offset();
        let existing = &edit.target.chunks;
        if !existing.is_packed_from(data_start, edit.kept) {
            return Ok(reject("destination chunks are not packed from the start of mdat"));
        }
        let payload_start = data_start
            + existing.chunks[..edit.kept]
                .iter()
                .map(|c| c.len())
                .sum::<u64>();

        if edit.is_trimmed()
            && edit.inputs[1..]
                .iter()
                .any(|p| same_file(p, edit.destination()))
        {
            return Ok(reject("a source is the destination and its chunks would be overwritten"));
        }

        let media_data_size = payload_start - data_start + edit.new_bytes();
        let mut media_header = BytesMut::new();
        if !put_header_with_width(
            &mut media_header,
            AtomType::MDAT,
            media_data_size + media_data.header_size as u64,
            media_data.header_size,
        ) {
            return Ok(reject("mdat size no longer fits its header"));
        }

        let region = layout.movie.size + free.size;
        let offsets = edit.packed_offsets(edit.chunks.len(), data_start);
        let movie = edit.encode_movie(edit.chunks.len(), &offsets)?;
        if remaining_gap(movie.len() as u64, region).is_none() {
            debug!(
                movie = movie.len(),
                region, "Movie box does not fit in moov and free"
            );
            return Ok(reject("updated movie box is larger than moov plus free"));
        }

        let trimmed_movie = if edit.is_trimmed() {
            let trimmed = edit.encode_movie(edit.kept, &offsets[..edit.kept])?;
            if remaining_gap(trimmed.len() as u64, region).is_none() {
                return Ok(reject("trimmed movie box does not fit in moov and free"));
            }
            Some(trimmed)
        } else {
            None
        };

        Ok(Some(Self {
            trimmed_movie,
            movie,
            media_header: media_header.freeze(),
            payload_start,
            media_data_size,
            file_size: media_data.data_offset() + media_data_size,
        }))
    }

    /// Write the patch into the destination.
    pub fn apply(self, edit: &MovieEdit, options: &WriteOptions) -> Result<WriteReport> {
        let layout = &edit.target.layout;
        let free_type = layout.free.map_or(AtomType::FREE, |f| f.atom_type);
        let region = layout.movie.size + layout.free.map_or(0, |f| f.size);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(edit.destination())?;

        if let Some(trimmed) = &self.trimmed_movie {
            write_movie_region(&mut file, layout.movie.offset, region, trimmed, free_type)?;
            if options.sync {
                file.sync_data()?;
            }
            debug!("Committed trimmed movie box before reusing dropped chunk space");
        }

        let mut sources = open_inputs(&edit.inputs)?;
        let mut buf = vec![0u8; options.copy_buffer_size];
        file.seek(SeekFrom::Start(self.payload_start))?;
        let mut out = BufWriter::with_capacity(options.copy_buffer_size, &mut file);
        let written = copy_chunks(&mut sources, &edit.chunks[edit.kept..], &mut out, &mut buf)?;
        out.flush()?;
        drop(out);
        debug!(written, at = self.payload_start, "Appended payload");

        file.set_len(self.file_size)?;
        file.seek(SeekFrom::Start(layout.media_data.offset))?;
        file.write_all(&self.media_header)?;
        if options.sync {
            file.sync_data()?;
        }

        let gap = write_movie_region(&mut file, layout.movie.offset, region, &self.movie, free_type)?;
        if options.sync {
            file.sync_all()?;
        }

        let free_space = if gap == 0 {
            0
        } else {
            gap - free_header_width(gap) as u64
        };
        info!(
            media_data = self.media_data_size,
            free_space,
            file_size = self.file_size,
            "Patched destination in place"
        );

        Ok(WriteReport {
            strategy: Strategy::InPlace,
            file_size: self.file_size,
            media_data_size: self.media_data_size,
            free_space,
        })
    }
}

fn reject(reason: &str) -> Option<InPlacePatch> {
    info!(reason, "In-place append not possible, rewriting instead");
    None
}

/// Bytes left after placing `len` bytes in `region`, if a free box can fill
/// them exactly.
fn remaining_gap(len: u64, region: u64) -> Option<u64> {
    let gap = region.checked_sub(len)?;
    (gap == 0 || gap >= HEADER_SIZE as u64).then_some(gap)
}

fn free_header_width(total: u64) -> u8 {
    if total > u32::MAX as u64 {
        LARGE_HEADER_SIZE
    } else {
        HEADER_SIZE
    }
}

/// Write `movie` at `offset` followed by a free box covering the rest of
/// `region`. Returns the free box size.
fn write_movie_region(
    file: &mut File,
    offset: u64,
    region: u64,
    movie: &[u8],
    free_type: AtomType,
) -> Result<u64> {
    let gap = region - movie.len() as u64;
    let mut buf = BytesMut::with_capacity(movie.len() + LARGE_HEADER_SIZE as usize);
    buf.extend_from_slice(movie);
    if gap > 0 {
        put_header_with_width(&mut buf, free_type, gap, free_header_width(gap));
    }
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&buf)?;
    Ok(gap)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
