//! MP4 file reader with atom parsing.

use super::atoms::{decode_header, Atom, LARGE_HEADER_SIZE};
use super::{ContainerLayout, MovieBox, Mp4File};
use crate::{Error, Result};
use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom};
use tracing::debug;

/// Maximum allowed atom data size (64 MB) to prevent OOM on malformed files.
///
/// Only the movie box is ever read into memory; media payload stays on disk.
const MAX_ATOM_DATA_SIZE: u64 = 64 * 1024 * 1024;

/// MP4 file reader.
pub struct Mp4Reader<R> {
    reader: R,
    file_size: u64,
}

impl<R: Read + Seek> Mp4Reader<R> {
    /// Create a new MP4 reader.
    pub fn new(mut reader: R) -> Result<Self> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self { reader, file_size })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Parse the top-level layout and the movie box.
    pub fn parse(&mut self) -> Result<Mp4File> {
        let atoms = self.read_atoms(0, self.file_size)?;
        let layout = ContainerLayout::from_atoms(&atoms, self.file_size)?;

        let payload = self.read_atom_data(&layout.movie)?;
        let movie = MovieBox::decode(payload, layout.movie.data_offset())?;
        movie.check_supported()?;

        let chunks = movie.chunk_table(layout.media_data_size())?;
        layout.check_chunks(&chunks)?;

        debug!(
            chunks = chunks.len(),
            samples = chunks.sample_count(),
            media_bytes = layout.media_data_size(),
            free = layout.free_space(),
            "Parsed movie"
        );

        Ok(Mp4File {
            layout,
            movie,
            chunks,
        })
    }

    /// Read the atoms packed between `start` and `end`.
    ///
    /// The atoms must tile the range exactly; a header that does not fit or a
    /// size running past `end` is a malformed container.
    pub fn read_atoms(&mut self, start: u64, end: u64) -> Result<Vec<Atom>> {
        let mut atoms = Vec::new();
        let mut pos = start;

        while pos < end {
            self.reader.seek(SeekFrom::Start(pos))?;

            let len = (end - pos).min(LARGE_HEADER_SIZE as u64) as usize;
            let mut header = [0u8; LARGE_HEADER_SIZE as usize];
            self.reader.read_exact(&mut header[..len])?;

            let atom = decode_header(&header[..len], pos, end)?;
            debug!(
                atom = %atom.atom_type,
                offset = atom.offset,
                size = atom.size,
                "Found atom"
            );
            pos = atom.end();
            atoms.push(atom);
        }

        Ok(atoms)
    }

    /// Read and validate atom data, rejecting oversized atoms.
    pub fn read_atom_data(&mut self, atom: &Atom) -> Result<Bytes> {
        let size = atom.data_size();
        if size > MAX_ATOM_DATA_SIZE {
            return Err(Error::malformed(format!(
                "Atom {} data size {} exceeds maximum {}",
                atom.atom_type, size, MAX_ATOM_DATA_SIZE
            )));
        }
        self.reader.seek(SeekFrom::Start(atom.data_offset()))?;
        let mut data = vec![0u8; size as usize];
        self.reader.read_exact(&mut data)?;
        Ok(Bytes::from(data))
    }
}
