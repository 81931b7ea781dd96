//! Synthetic single-track MP4 files for tests.
//!
//! Built through the crate's own box encoders, so a fixture decodes to
//! exactly the tables it was given. Sample payload is a deterministic byte
//! pattern per file so copied bytes can be traced back to their source.

use crate::mp4::atoms::{put_header, put_version_and_flags, AtomType};
use crate::mp4::boxes::{MoovBox, MovieBox};
use crate::mp4::headers::{EditEntry, EditList, SampleDescriptions, TimingHeader, TrackHeader};
use crate::mp4::sample_table::{Chunk, ChunkTable};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::path::Path;

const FILE_TYPE: &[u8] = b"isom\0\0\x02\0isomiso2avc1mp41";

/// Builder for a single-video-track MP4 file.
#[derive(Debug, Clone)]
pub struct MovieFixture {
    width: u32,
    height: u32,
    chunks: Vec<(Vec<u32>, u32)>,
    descriptions: Vec<Bytes>,
    keyframes: Option<Vec<u32>>,
    composition_offsets: Option<Vec<i32>>,
    sample_delta: u32,
    media_timescale: u32,
    free_space: Option<u64>,
    moov_after_mdat: bool,
    large_media_header: bool,
    chunk_offset_shift: u64,
    seed: u8,
}

impl MovieFixture {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            chunks: Vec::new(),
            descriptions: vec![Self::visual_entry(b"avc1", width, height, 0)],
            keyframes: None,
            composition_offsets: None,
            sample_delta: 512,
            media_timescale: 15360,
            free_space: None,
            moov_after_mdat: false,
            large_media_header: false,
            chunk_offset_shift: 0,
            seed: 0,
        }
    }

    /// A minimal visual sample entry. `variant` makes otherwise equal
    /// entries differ.
    pub fn visual_entry(format: &[u8; 4], width: u32, height: u32, variant: u8) -> Bytes {
        let mut entry = BytesMut::new();
        put_header(&mut entry, AtomType::from_bytes(*format), 12);
        entry.put_slice(&[0; 6]);
        entry.put_u16(1);
        entry.put_u16(width as u16);
        entry.put_u16(height as u16);
        // First reserved byte distinguishes variants.
        entry[8] = variant;
        entry.freeze()
    }

    /// Add a chunk using the first sample description.
    pub fn chunk(self, sample_sizes: &[u32]) -> Self {
        self.chunk_with_description(sample_sizes, 1)
    }

    pub fn chunk_with_description(mut self, sample_sizes: &[u32], description: u32) -> Self {
        self.chunks.push((sample_sizes.to_vec(), description));
        self
    }

    /// Replace the sample descriptions.
    pub fn descriptions(mut self, entries: Vec<Bytes>) -> Self {
        self.descriptions = entries;
        self
    }

    /// Write an stss with these 1-based sample numbers.
    pub fn keyframes(mut self, samples: &[u32]) -> Self {
        self.keyframes = Some(samples.to_vec());
        self
    }

    /// Write a ctts with one offset per sample.
    pub fn composition_offsets(mut self, offsets: &[i32]) -> Self {
        self.composition_offsets = Some(offsets.to_vec());
        self
    }

    pub fn sample_delta(mut self, delta: u32) -> Self {
        self.sample_delta = delta;
        self
    }

    pub fn media_timescale(mut self, timescale: u32) -> Self {
        self.media_timescale = timescale;
        self
    }

    /// Put a free box of `payload` bytes between moov and mdat.
    pub fn free_space(mut self, payload: u64) -> Self {
        self.free_space = Some(payload);
        self
    }

    /// Lay the file out as ftyp, free, mdat, moov.
    pub fn moov_after_mdat(mut self) -> Self {
        self.moov_after_mdat = true;
        self
    }

    /// Use a 16-byte mdat header.
    pub fn large_media_header(mut self) -> Self {
        self.large_media_header = true;
        self
    }

    /// Shift every chunk offset, producing a broken file.
    pub fn chunk_offset_shift(mut self, shift: u64) -> Self {
        self.chunk_offset_shift = shift;
        self
    }

    /// Byte pattern seed for sample payload.
    pub fn seed(mut self, seed: u8) -> Self {
        self.seed = seed;
        self
    }

    fn sample_count(&self) -> usize {
        self.chunks.iter().map(|(s, _)| s.len()).sum()
    }

    /// Sample payload in file order.
    pub fn payload(&self) -> Vec<u8> {
        let mut data = Vec::new();
        let mut sample = 0u32;
        for (sizes, _) in &self.chunks {
            for &size in sizes {
                let value = self.seed.wrapping_add((sample % 251) as u8);
                data.extend(std::iter::repeat(value).take(size as usize));
                sample += 1;
            }
        }
        data
    }

    fn chunk_table(&self, first_offset: u64) -> ChunkTable {
        let mut offset = first_offset + self.chunk_offset_shift;
        let mut sample = 0usize;
        let mut chunks = Vec::new();
        for (index, (sizes, description)) in self.chunks.iter().enumerate() {
            let range = sample..sample + sizes.len();
            let sync_samples = match &self.keyframes {
                Some(keys) => range
                    .clone()
                    .filter(|s| keys.contains(&(*s as u32 + 1)))
                    .map(|s| (s - sample) as u32)
                    .collect(),
                None => (0..sizes.len() as u32).collect(),
            };
            let composition_offsets = match &self.composition_offsets {
                Some(offsets) => offsets[range.clone()].to_vec(),
                None => vec![0; sizes.len()],
            };
            let chunk = Chunk {
                index,
                offset,
                sample_description_index: *description,
                sample_sizes: sizes.clone(),
                sample_deltas: vec![self.sample_delta; sizes.len()],
                composition_offsets,
                sync_samples,
            };
            offset = chunk.end();
            sample = range.end;
            chunks.push(chunk);
        }
        ChunkTable {
            chunks,
            has_sync_table: self.keyframes.is_some(),
            has_composition_offsets: self.composition_offsets.is_some(),
        }
    }

    /// The encoded moov box with chunks packed from `first_offset`.
    pub fn build_movie_box(&self, first_offset: u64) -> Bytes {
        let table = self.chunk_table(first_offset);
        let media_duration = self.sample_count() as u64 * self.sample_delta as u64;
        let movie_timescale = 1000;
        let movie_duration =
            crate::mp4::boxes::rescale(media_duration, self.media_timescale, movie_timescale);

        let mut mvhd_rest = BytesMut::new();
        mvhd_rest.put_u32(0x0001_0000); // rate
        mvhd_rest.put_u16(0x0100); // volume
        mvhd_rest.put_slice(&[0; 10]);
        mvhd_rest.put_slice(&identity_matrix());
        mvhd_rest.put_slice(&[0; 24]);
        mvhd_rest.put_u32(2); // next track id

        let mut tkhd_layout = BytesMut::new();
        tkhd_layout.put_slice(&[0; 16]);
        tkhd_layout.put_slice(&identity_matrix());

        let mut hdlr = BytesMut::new();
        put_version_and_flags(&mut hdlr, 0, 0);
        hdlr.put_u32(0);
        hdlr.put_slice(b"vide");
        hdlr.put_slice(&[0; 12]);
        hdlr.put_slice(b"VideoHandler\0");

        let mut vmhd = BytesMut::new();
        put_version_and_flags(&mut vmhd, 0, 1);
        vmhd.put_slice(&[0; 8]);

        let mut dinf = BytesMut::new();
        put_header(&mut dinf, AtomType::from_bytes(*b"dref"), 20);
        put_version_and_flags(&mut dinf, 0, 0);
        dinf.put_u32(1);
        put_header(&mut dinf, AtomType::from_bytes(*b"url "), 4);
        put_version_and_flags(&mut dinf, 0, 1);

        let mut stbl = vec![MoovBox::SampleDescriptions(SampleDescriptions {
            version: 0,
            flags: 0,
            entries: self.descriptions.clone(),
        })];
        let encoded = table.encode();
        stbl.push(MoovBox::TimeToSample(encoded.time_to_sample));
        if let Some(ctts) = encoded.composition_offsets {
            stbl.push(MoovBox::CompositionOffsets(ctts));
        }
        if let Some(stss) = encoded.sync_samples {
            stbl.push(MoovBox::SyncSamples(stss));
        }
        stbl.push(MoovBox::SampleToChunk(encoded.sample_to_chunk));
        stbl.push(MoovBox::SampleSizes(encoded.sample_sizes));
        stbl.push(MoovBox::ChunkOffsets(encoded.chunk_offsets));

        let container = |atom_type: AtomType, children: Vec<MoovBox>| MoovBox::Container {
            atom_type,
            children,
        };
        let opaque = |code: &[u8; 4], payload: BytesMut| MoovBox::Opaque {
            atom_type: AtomType::from_bytes(*code),
            payload: payload.freeze(),
        };

        let track = container(
            AtomType::TRAK,
            vec![
                MoovBox::TrackHeader(TrackHeader {
                    version: 0,
                    flags: 3,
                    creation_time: 0,
                    modification_time: 0,
                    track_id: 1,
                    reserved: 0,
                    duration: movie_duration,
                    layout: tkhd_layout.freeze(),
                    width: self.width << 16,
                    height: self.height << 16,
                }),
                container(
                    AtomType::EDTS,
                    vec![MoovBox::EditList(EditList {
                        version: 0,
                        flags: 0,
                        entries: vec![EditEntry {
                            segment_duration: movie_duration,
                            media_time: 0,
                            media_rate: 0x0001_0000,
                        }],
                    })],
                ),
                container(
                    AtomType::MDIA,
                    vec![
                        MoovBox::MediaHeader(TimingHeader {
                            version: 0,
                            flags: 0,
                            creation_time: 0,
                            modification_time: 0,
                            timescale: self.media_timescale,
                            duration: media_duration,
                            rest: Bytes::from_static(&[0x55, 0xC4, 0, 0]),
                        }),
                        opaque(b"hdlr", hdlr),
                        container(
                            AtomType::MINF,
                            vec![
                                opaque(b"vmhd", vmhd),
                                opaque(b"dinf", dinf),
                                container(AtomType::STBL, stbl),
                            ],
                        ),
                    ],
                ),
            ],
        );

        MovieBox::from_children(vec![
            MoovBox::MovieHeader(TimingHeader {
                version: 0,
                flags: 0,
                creation_time: 0,
                modification_time: 0,
                timescale: movie_timescale,
                duration: movie_duration,
                rest: mvhd_rest.freeze(),
            }),
            track,
        ])
        .encode()
    }

    /// The complete file.
    pub fn build(&self) -> Vec<u8> {
        let mut file_type = BytesMut::new();
        put_header(&mut file_type, AtomType::FTYP, FILE_TYPE.len() as u64);
        file_type.put_slice(FILE_TYPE);

        let mut free = BytesMut::new();
        if let Some(payload) = self.free_space {
            put_header(&mut free, AtomType::FREE, payload);
            free.put_bytes(0, payload as usize);
        }

        let payload = self.payload();
        let mut media = BytesMut::new();
        if self.large_media_header {
            put_header_large(&mut media, payload.len() as u64);
        } else {
            put_header(&mut media, AtomType::MDAT, payload.len() as u64);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&file_type);
        if self.moov_after_mdat {
            let first = (file_type.len() + free.len() + media.len()) as u64;
            out.extend_from_slice(&free);
            out.extend_from_slice(&media);
            out.extend_from_slice(&payload);
            out.extend_from_slice(&self.build_movie_box(first));
        } else {
            // The movie box size does not depend on offset values below 4 GiB.
            let movie_len = self.build_movie_box(0).len();
            let first = (file_type.len() + movie_len + free.len() + media.len()) as u64;
            out.extend_from_slice(&self.build_movie_box(first));
            out.extend_from_slice(&free);
            out.extend_from_slice(&media);
            out.extend_from_slice(&payload);
        }
        out
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        std::fs::write(path, self.build())
    }
}

fn put_header_large(buf: &mut BytesMut, payload_len: u64) {
    buf.put_u32(1);
    buf.put_slice(&AtomType::MDAT.0);
    buf.put_u64(payload_len + 16);
}

fn identity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}
