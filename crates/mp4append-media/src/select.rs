//! Chunk selection with slice semantics.
//!
//! A selection names a file and an optional `[start:end]` window over its
//! chunk list. Bounds behave like slice bounds: omitted means open, negative
//! counts from the end, and anything out of range is clamped rather than
//! rejected.

use crate::mp4::Chunk;
use crate::{Error, Result};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// A file plus a half-open chunk window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSelection {
    pub path: PathBuf,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl ChunkSelection {
    pub fn new(path: impl Into<PathBuf>, start: Option<i64>, end: Option<i64>) -> Self {
        Self {
            path: path.into(),
            start,
            end,
        }
    }

    /// Every chunk of `path`.
    pub fn all(path: impl Into<PathBuf>) -> Self {
        Self::new(path, None, None)
    }

    /// Resolve the window against a table of `len` chunks.
    ///
    /// Always returns `start <= end <= len`; an inverted window is empty.
    pub fn resolve(&self, len: usize) -> Range<usize> {
        let start = self.start.map_or(0, |i| clamp_index(i, len));
        let end = self.end.map_or(len, |i| clamp_index(i, len));
        start..end.max(start)
    }

    /// The selected chunks of `chunks`.
    pub fn select<'a>(&self, chunks: &'a [Chunk]) -> &'a [Chunk] {
        &chunks[self.resolve(chunks.len())]
    }

    pub fn is_whole_file(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

impl fmt::Display for ChunkSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        if !self.is_whole_file() {
            let bound = |b: Option<i64>| b.map(|v| v.to_string()).unwrap_or_default();
            write!(f, "[{}:{}]", bound(self.start), bound(self.end))?;
        }
        Ok(())
    }
}

fn clamp_index(index: i64, len: usize) -> usize {
    let len = len as i64;
    let resolved = if index < 0 { index + len } else { index };
    resolved.clamp(0, len) as usize
}

/// Contiguous run of payload bytes in one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    pub offset: u64,
    pub len: u64,
}

impl ByteSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Merge chunks that sit back to back into single spans, preserving order.
pub fn byte_spans<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Vec<ByteSpan> {
    let mut spans: Vec<ByteSpan> = Vec::new();
    for chunk in chunks {
        match spans.last_mut() {
            Some(span) if span.end() == chunk.offset => span.len += chunk.len(),
            _ => spans.push(ByteSpan {
                offset: chunk.offset,
                len: chunk.len(),
            }),
        }
    }
    spans
}

/// Refuse to mix frame sizes. `inputs` pairs each file with its track
/// dimensions in pixels.
pub fn check_dimensions(inputs: &[(&Path, (u32, u32))]) -> Result<()> {
    let Some(&(first_path, expected)) = inputs.first() else {
        return Ok(());
    };
    for &(path, dims) in &inputs[1..] {
        if dims != expected {
            return Err(Error::size_mismatch(format!(
                "{} is {}x{} but {} is {}x{}",
                path.display(),
                dims.0,
                dims.1,
                first_path.display(),
                expected.0,
                expected.1
            )));
        }
    }
    Ok(())
}

/// The destination may only lose chunks from its end.
///
/// An empty window drops every chunk, which counts as trimming from the end.
pub fn check_destination_window(window: &Range<usize>, len: usize) -> Result<()> {
    if window.start != 0 && !window.is_empty() {
        return Err(Error::unsupported(format!(
            "destination selection keeps chunks {}..{} of {}; chunks can only be removed from the end",
            window.start, window.end, len
        )));
    }
    Ok(())
}
