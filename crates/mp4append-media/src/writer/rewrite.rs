//! Full rewrite into a temporary file that replaces the destination.
//!
//! Output layout is ftyp (copied), moov, free, mdat. The temporary file lives
//! in the destination's directory so the final rename stays on one
//! filesystem; until that rename the destination is untouched.

use super::{copy_chunks, open_inputs, MovieEdit, WriteOptions, WriteReport};
use crate::mp4::atoms::{header_size_for, put_header, AtomType};
use crate::plan::Strategy;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info};

/// Passes allowed for the movie box size to settle. Offsets move when the
/// movie box grows, which can in turn promote stco to co64 once.
const MAX_LAYOUT_PASSES: usize = 4;

/// Write the edited movie to a new file reserving `free_space` bytes of free
/// box payload, then atomically replace the destination with it.
pub fn full_rewrite(
    edit: &MovieEdit,
    free_space: u64,
    options: &WriteOptions,
) -> Result<WriteReport> {
    let destination = edit.destination();
    let layout = &edit.target.layout;
    let mut sources = open_inputs(&edit.inputs)?;

    let file_type = read_range(&mut sources[0], layout.file_type.offset, layout.file_type.size)?;
    let media_data_size: u64 = edit.chunks.iter().map(|c| c.chunk.len()).sum();
    let media_header_size = header_size_for(media_data_size) as u64;
    let free_size = header_size_for(free_space) as u64 + free_space;

    let (movie, data_start) = settle_movie(edit, |movie_len| {
        layout.file_type.size + movie_len + free_size + media_header_size
    })?;
    debug!(
        movie = movie.len(),
        data_start, free_space, media_data_size, "Laid out rewritten file"
    );

    let dir = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let temp = tempfile::Builder::new()
        .prefix(".mp4append-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    let mut header = BytesMut::new();
    {
        let mut out = BufWriter::with_capacity(options.copy_buffer_size, temp.as_file());
        out.write_all(&file_type)?;
        out.write_all(&movie)?;

        put_header(&mut header, AtomType::FREE, free_space);
        out.write_all(&header)?;
        // Free payload is left as a hole; it reads back as zeros.
        out.seek(SeekFrom::Current(free_space as i64))?;

        header.clear();
        put_header(&mut header, AtomType::MDAT, media_data_size);
        out.write_all(&header)?;

        let mut buf = vec![0u8; options.copy_buffer_size];
        let written = copy_chunks(&mut sources, &edit.chunks, &mut out, &mut buf)?;
        if written != media_data_size {
            return Err(Error::malformed(format!(
                "copied {written} payload bytes, expected {media_data_size}"
            )));
        }
        out.flush()?;
    }

    let file_size = data_start + media_data_size;
    let permissions = fs::metadata(destination)?.permissions();
    temp.as_file().set_permissions(permissions)?;
    if options.sync {
        temp.as_file().sync_all()?;
    }
    temp.persist(destination).map_err(|e| Error::Io(e.error))?;
    if options.sync {
        // Make the rename itself durable where directories can be synced.
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }

    info!(
        file_size,
        media_data = media_data_size,
        free_space,
        "Rewrote destination"
    );

    Ok(WriteReport {
        strategy: Strategy::FullRewrite,
        file_size,
        media_data_size,
        free_space,
    })
}

/// Encode the movie box until the chunk offsets it implies stop moving.
///
/// `data_start` maps a movie box length to the offset of the first chunk.
fn settle_movie(edit: &MovieEdit, data_start: impl Fn(u64) -> u64) -> Result<(Bytes, u64)> {
    let count = edit.chunks.len();
    let mut movie_len = 0u64;
    for pass in 0..MAX_LAYOUT_PASSES {
        let start = data_start(movie_len);
        let offsets = edit.packed_offsets(count, start);
        let movie = edit.encode_movie(count, &offsets)?;
        if movie.len() as u64 == movie_len {
            debug!(pass, "Movie box size settled");
            return Ok((movie, start));
        }
        movie_len = movie.len() as u64;
    }
    Err(Error::unsupported(format!(
        "movie box size did not settle after {MAX_LAYOUT_PASSES} passes"
    )))
}

fn read_range(file: &mut File, offset: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(Error::malformed(format!(
            "expected {len} bytes at offset {offset}, read {}",
            data.len()
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_range() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        assert_eq!(read_range(&mut file, 2, 3).unwrap(), b"234");
        assert!(matches!(
            read_range(&mut file, 8, 5),
            Err(Error::MalformedContainer(_))
        ));
    }
}
