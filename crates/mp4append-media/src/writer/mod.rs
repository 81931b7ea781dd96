//! Container writer: the only code that modifies files.
//!
//! A [`MovieEdit`] describes the destination after the append: which of its
//! chunks survive, which source chunks follow, and the merged sample
//! descriptions. It is either patched into the destination in place
//! ([`InPlacePatch`]) or written out as a new file that replaces the
//! destination ([`full_rewrite`]).

mod in_place;
mod rewrite;

pub use in_place::InPlacePatch;
pub use rewrite::full_rewrite;

use crate::mp4::{Chunk, ChunkTable, Mp4File, SampleDescriptions};
use crate::plan::Strategy;
use crate::select::{byte_spans, ByteSpan};
use crate::{Error, Result};
use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default block size for payload copies.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Knobs for the physical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Block size for payload copies.
    pub copy_buffer_size: usize,
    /// fsync before committing metadata or renaming.
    pub sync: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            sync: true,
        }
    }
}

/// A chunk in the edited movie and the input file holding its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedChunk {
    /// Index into [`MovieEdit::inputs`]; 0 is the destination.
    pub input: usize,
    /// The chunk, with its offset in that input.
    pub chunk: Chunk,
}

/// The destination as it should look after the append.
#[derive(Debug, Clone)]
pub struct MovieEdit {
    /// Parsed destination before the edit.
    pub target: Mp4File,
    /// Files chunk bytes are read from. `inputs[0]` is the destination.
    pub inputs: Vec<PathBuf>,
    /// How many leading destination chunks are kept.
    pub kept: usize,
    /// Final chunk order: the kept destination chunks, then source chunks.
    pub chunks: Vec<PlacedChunk>,
    pub descriptions: SampleDescriptions,
    pub has_sync_table: bool,
    pub has_composition_offsets: bool,
}

impl MovieEdit {
    pub fn destination(&self) -> &Path {
        &self.inputs[0]
    }

    /// Payload bytes that are not already in the destination.
    pub fn new_bytes(&self) -> u64 {
        self.chunks[self.kept..]
            .iter()
            .map(|c| c.chunk.len())
            .sum()
    }

    /// Whether destination chunks are dropped.
    pub fn is_trimmed(&self) -> bool {
        self.kept < self.target.chunks.len()
    }

    /// Chunk table of the first `count` chunks placed at `offsets`.
    fn table(&self, count: usize, offsets: &[u64]) -> ChunkTable {
        let chunks = self.chunks[..count]
            .iter()
            .zip(offsets)
            .enumerate()
            .map(|(index, (placed, &offset))| Chunk {
                index,
                offset,
                ..placed.chunk.clone()
            })
            .collect();
        ChunkTable {
            chunks,
            has_sync_table: self.has_sync_table,
            has_composition_offsets: self.has_composition_offsets,
        }
    }

    /// Encode the destination's movie box describing the first `count`
    /// chunks at `offsets`.
    fn encode_movie(&self, count: usize, offsets: &[u64]) -> Result<Bytes> {
        let table = self.table(count, offsets);
        let mut movie = self.target.movie.clone();
        movie.set_sample_tables(table.encode(), self.descriptions.clone())?;
        movie.set_media_duration(table.media_duration())?;
        Ok(movie.encode())
    }

    /// Offsets for the first `count` chunks packed back to back from `start`.
    fn packed_offsets(&self, count: usize, start: u64) -> Vec<u64> {
        let mut pos = start;
        self.chunks[..count]
            .iter()
            .map(|c| {
                let offset = pos;
                pos += c.chunk.len();
                offset
            })
            .collect()
    }
}

/// What the writer did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub strategy: Strategy,
    pub file_size: u64,
    /// mdat payload bytes.
    pub media_data_size: u64,
    /// Free box payload bytes left in the file.
    pub free_space: u64,
}

/// Copy `span` from `input` to `output` in blocks of `buf.len()` bytes.
fn copy_span<W: Write>(
    input: &mut File,
    span: ByteSpan,
    output: &mut W,
    buf: &mut [u8],
) -> Result<()> {
    if buf.is_empty() {
        return Err(Error::unsupported("copy buffer size must be greater than zero"));
    }
    input.seek(SeekFrom::Start(span.offset))?;
    let mut remaining = span.len;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        input.read_exact(&mut buf[..n])?;
        output.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Copy every placed chunk, in order, coalescing adjacent chunks of the same
/// input into one span. `inputs` is indexed like [`MovieEdit::inputs`].
fn copy_chunks<W: Write>(
    inputs: &mut [File],
    chunks: &[PlacedChunk],
    output: &mut W,
    buf: &mut [u8],
) -> Result<u64> {
    let mut written = 0;
    let mut start = 0;
    while start < chunks.len() {
        let input = chunks[start].input;
        let mut end = start + 1;
        while end < chunks.len() && chunks[end].input == input {
            end += 1;
        }

        let spans = byte_spans(chunks[start..end].iter().map(|c| &c.chunk));
        debug!(input, chunks = end - start, spans = spans.len(), "Copying payload");
        for span in spans {
            copy_span(&mut inputs[input], span, output, buf)?;
            written += span.len;
        }
        start = end;
    }
    Ok(written)
}

/// Open every input for reading.
fn open_inputs(paths: &[PathBuf]) -> Result<Vec<File>> {
    paths
        .iter()
        .map(|p| File::open(p).map_err(Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_copy_span_in_small_blocks() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&(0u8..200).collect::<Vec<_>>()).unwrap();

        let mut out = Cursor::new(Vec::new());
        let mut buf = [0u8; 7];
        copy_span(
            &mut file,
            ByteSpan {
                offset: 10,
                len: 50,
            },
            &mut out,
            &mut buf,
        )
        .unwrap();
        assert_eq!(out.into_inner(), (10u8..60).collect::<Vec<_>>());
    }

    #[test]
    fn test_copy_span_past_end_fails() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        let err = copy_span(
            &mut file,
            ByteSpan { offset: 1, len: 10 },
            &mut out,
            &mut buf,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
