//! Shared helpers for integration tests.
//!
//! Provides [`Workspace`], a scratch directory holding synthetic MP4 files
//! built with [`MovieFixture`], and helpers to read back what an append
//! produced.

#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use mp4append_media::fixture::MovieFixture;
use mp4append_media::Mp4File;
use tempfile::TempDir;

/// A temporary directory of fixture files.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write `fixture` as `name` and return its path.
    pub fn write(&self, name: &str, fixture: &MovieFixture) -> PathBuf {
        let path = self.path(name);
        fixture.write_to(&path).expect("failed to write fixture");
        path
    }
}

/// Read the sample payload of every chunk in file order.
pub fn chunk_payload(path: &Path) -> Vec<u8> {
    let mp4 = Mp4File::open(path).expect("failed to parse output");
    let mut file = File::open(path).unwrap();
    let mut data = Vec::new();
    for chunk in &mp4.chunks.chunks {
        let mut buf = vec![0u8; chunk.len() as usize];
        file.seek(SeekFrom::Start(chunk.offset)).unwrap();
        file.read_exact(&mut buf).unwrap();
        data.extend_from_slice(&buf);
    }
    data
}

/// Sizes of every chunk, in bytes.
pub fn chunk_sizes(mp4: &Mp4File) -> Vec<u64> {
    mp4.chunks.chunks.iter().map(|c| c.len()).collect()
}

/// Offsets of every chunk.
pub fn chunk_offsets(mp4: &Mp4File) -> Vec<u64> {
    mp4.chunks.chunks.iter().map(|c| c.offset).collect()
}

/// A 64x64 fixture with one single-sample chunk per entry of `sizes`.
pub fn movie(sizes: &[u32]) -> MovieFixture {
    sizes
        .iter()
        .fold(MovieFixture::new(64, 64), |fixture, &size| fixture.chunk(&[size]))
}

/// Read `len` bytes at `offset`.
pub fn read_range(path: &Path, offset: u64, len: u64) -> Vec<u8> {
    let mut file = File::open(path).unwrap();
    let mut buf = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut buf).unwrap();
    buf
}

/// Overwrite the big-endian u32 `offset` bytes past the first occurrence of
/// the box type `tag`.
pub fn overwrite_field(path: &Path, tag: &[u8; 4], offset: usize, value: u32) {
    let mut data = std::fs::read(path).unwrap();
    let pos = data
        .windows(4)
        .position(|w| w == tag)
        .expect("box type not found");
    data[pos + offset..pos + offset + 4].copy_from_slice(&value.to_be_bytes());
    std::fs::write(path, data).unwrap();
}
