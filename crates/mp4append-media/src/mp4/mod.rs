//! MP4 container parsing.
//!
//! A file is read as its four top-level sections (ftyp, moov, optional free,
//! mdat) plus a fully decoded movie box. Media payload is never loaded; chunks
//! refer to it by absolute file offset.

pub mod atoms;
pub mod boxes;
pub mod headers;
mod reader;
pub mod sample_table;

pub use atoms::{Atom, AtomType};
pub use boxes::{MoovBox, MovieBox};
pub use headers::SampleDescriptions;
pub use reader::Mp4Reader;
pub use sample_table::{Chunk, ChunkTable, EncodedTables};

use crate::{Error, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

/// Positions of the top-level boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerLayout {
    pub file_type: Atom,
    pub movie: Atom,
    /// `free` or `skip` box, if any.
    pub free: Option<Atom>,
    pub media_data: Atom,
    pub file_size: u64,
}

impl ContainerLayout {
    /// Assign roles to the top-level atoms.
    pub fn from_atoms(atoms: &[Atom], file_size: u64) -> Result<Self> {
        let mut file_type = None;
        let mut movie = None;
        let mut free = None;
        let mut media_data = None;

        for atom in atoms {
            let slot = match atom.atom_type {
                AtomType::FTYP => &mut file_type,
                AtomType::MOOV => &mut movie,
                AtomType::FREE | AtomType::SKIP => &mut free,
                AtomType::MDAT => &mut media_data,
                other if other.0 == *b"moof" || other.0 == *b"mfra" => {
                    return Err(Error::unsupported(
                        "fragmented files (moof) cannot be appended to",
                    ));
                }
                other => {
                    return Err(Error::unsupported(format!(
                        "unexpected top-level box {other} at offset {}",
                        atom.offset
                    )));
                }
            };
            if slot.is_some() {
                return Err(Error::unsupported(format!(
                    "more than one top-level {} box",
                    atom.atom_type
                )));
            }
            *slot = Some(*atom);
        }

        Ok(Self {
            file_type: file_type.ok_or_else(|| Error::malformed("file has no ftyp box"))?,
            movie: movie.ok_or_else(|| Error::malformed("file has no moov box"))?,
            free,
            media_data: media_data.ok_or_else(|| Error::malformed("file has no mdat box"))?,
            file_size,
        })
    }

    /// Payload bytes of the free box.
    pub fn free_space(&self) -> u64 {
        self.free.map(|f| f.data_size()).unwrap_or(0)
    }

    /// Free space usable by an in-place append: zero unless the layout is
    /// append-ready.
    pub fn available_free_space(&self) -> u64 {
        if self.is_append_ready() {
            self.free_space()
        } else {
            0
        }
    }

    pub fn media_data_size(&self) -> u64 {
        self.media_data.data_size()
    }

    /// moov, free and mdat are adjacent in that order and mdat ends the file.
    pub fn is_append_ready(&self) -> bool {
        match self.free {
            Some(free) => {
                self.movie.end() == free.offset
                    && free.end() == self.media_data.offset
                    && self.media_data.end() == self.file_size
            }
            None => false,
        }
    }

    /// Every chunk must lie inside the mdat payload.
    pub fn check_chunks(&self, chunks: &ChunkTable) -> Result<()> {
        let start = self.media_data.data_offset();
        let end = self.media_data.end();
        for chunk in &chunks.chunks {
            if chunk.offset < start || chunk.end() > end {
                return Err(Error::malformed(format!(
                    "chunk {} spans {}..{}, outside mdat payload {}..{}",
                    chunk.index,
                    chunk.offset,
                    chunk.end(),
                    start,
                    end
                )));
            }
        }
        Ok(())
    }
}

/// Parsed MP4 file: layout, movie box and the video track's chunks.
#[derive(Debug, Clone)]
pub struct Mp4File {
    pub layout: ContainerLayout,
    pub movie: MovieBox,
    pub chunks: ChunkTable,
}

impl Mp4File {
    /// Parse an MP4 file from the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::parse(&mut reader)
    }

    /// Parse an MP4 file from a reader.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let mut mp4_reader = Mp4Reader::new(reader)?;
        mp4_reader.parse()
    }

    /// Track width and height in pixels.
    pub fn dimensions(&self) -> Result<(u32, u32)> {
        Ok(self.movie.track_header()?.dimensions())
    }

    pub fn sample_descriptions(&self) -> Result<&SampleDescriptions> {
        self.movie.sample_descriptions()
    }
}
