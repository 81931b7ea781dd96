//! Typed movie box tree.
//!
//! The movie box is small, so it is decoded completely into a closed set of
//! box variants selected by type code. Boxes this crate never edits are kept
//! as opaque payload and written back byte for byte.

use super::atoms::{decode_header, put_header, AtomType, LARGE_HEADER_SIZE};
use super::headers::{EditList, SampleDescriptions, TimingHeader, TrackHeader};
use super::sample_table::{
    decode_composition_offsets, decode_sample_to_chunk, decode_sync_samples,
    decode_time_to_sample, encode_composition_offsets, encode_sample_to_chunk,
    encode_sync_samples, encode_time_to_sample, ChunkOffsets, ChunkTable,
    CompositionOffsetEntry, EncodedTables, SampleSizes, SampleToChunkEntry, TimeToSampleEntry,
};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

const STBL_PATH: &[AtomType] = &[
    AtomType::TRAK,
    AtomType::MDIA,
    AtomType::MINF,
    AtomType::STBL,
];

/// Canonical order of the tables inside `stbl`, used when inserting one.
const STBL_ORDER: &[AtomType] = &[
    AtomType::STSD,
    AtomType::STTS,
    AtomType::CTTS,
    AtomType::STSS,
    AtomType::STSC,
    AtomType::STSZ,
    AtomType::STCO,
];

/// A box inside `moov`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoovBox {
    Container {
        atom_type: AtomType,
        children: Vec<MoovBox>,
    },
    MovieHeader(TimingHeader),
    TrackHeader(TrackHeader),
    MediaHeader(TimingHeader),
    EditList(EditList),
    SampleDescriptions(SampleDescriptions),
    TimeToSample(Vec<TimeToSampleEntry>),
    CompositionOffsets(Vec<CompositionOffsetEntry>),
    SyncSamples(Vec<u32>),
    SampleToChunk(Vec<SampleToChunkEntry>),
    SampleSizes(SampleSizes),
    ChunkOffsets(ChunkOffsets),
    Opaque { atom_type: AtomType, payload: Bytes },
}

impl MoovBox {
    /// Type code this box is written with.
    ///
    /// Chunk offsets report `co64` or `stco` depending on their values.
    pub fn atom_type(&self) -> AtomType {
        match self {
            Self::Container { atom_type, .. } | Self::Opaque { atom_type, .. } => *atom_type,
            Self::MovieHeader(_) => AtomType::MVHD,
            Self::TrackHeader(_) => AtomType::TKHD,
            Self::MediaHeader(_) => AtomType::MDHD,
            Self::EditList(_) => AtomType::ELST,
            Self::SampleDescriptions(_) => AtomType::STSD,
            Self::TimeToSample(_) => AtomType::STTS,
            Self::CompositionOffsets(_) => AtomType::CTTS,
            Self::SyncSamples(_) => AtomType::STSS,
            Self::SampleToChunk(_) => AtomType::STSC,
            Self::SampleSizes(_) => AtomType::STSZ,
            Self::ChunkOffsets(offsets) => offsets.atom_type(),
        }
    }

    fn children(&self) -> &[MoovBox] {
        match self {
            Self::Container { children, .. } => children,
            _ => &[],
        }
    }

    /// Decode one box from its type and payload.
    fn decode(atom_type: AtomType, payload: Bytes, offset: u64) -> Result<Self> {
        let parsed = match atom_type {
            t if t.is_container() => Self::Container {
                atom_type,
                children: decode_boxes(&payload, offset)?,
            },
            AtomType::MVHD => Self::MovieHeader(TimingHeader::decode(atom_type, &payload)?),
            AtomType::MDHD => Self::MediaHeader(TimingHeader::decode(atom_type, &payload)?),
            AtomType::TKHD => Self::TrackHeader(TrackHeader::decode(&payload)?),
            AtomType::ELST => Self::EditList(EditList::decode(&payload)?),
            AtomType::STSD => Self::SampleDescriptions(SampleDescriptions::decode(&payload)?),
            AtomType::STTS => Self::TimeToSample(decode_time_to_sample(&payload)?),
            AtomType::CTTS => Self::CompositionOffsets(decode_composition_offsets(&payload)?),
            AtomType::STSS => Self::SyncSamples(decode_sync_samples(&payload)?),
            AtomType::STSC => Self::SampleToChunk(decode_sample_to_chunk(&payload)?),
            AtomType::STSZ => Self::SampleSizes(SampleSizes::decode(&payload)?),
            AtomType::STCO | AtomType::CO64 => {
                Self::ChunkOffsets(ChunkOffsets::decode(atom_type, &payload)?)
            }
            _ => Self::Opaque { atom_type, payload },
        };
        Ok(parsed)
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::Container { children, .. } => {
                for child in children {
                    child.encode(buf);
                }
            }
            Self::MovieHeader(h) | Self::MediaHeader(h) => h.encode_payload(buf),
            Self::TrackHeader(h) => h.encode_payload(buf),
            Self::EditList(e) => e.encode_payload(buf),
            Self::SampleDescriptions(s) => s.encode_payload(buf),
            Self::TimeToSample(e) => encode_time_to_sample(e, buf),
            Self::CompositionOffsets(e) => encode_composition_offsets(e, buf),
            Self::SyncSamples(s) => encode_sync_samples(s, buf),
            Self::SampleToChunk(e) => encode_sample_to_chunk(e, buf),
            Self::SampleSizes(s) => s.encode_payload(buf),
            Self::ChunkOffsets(o) => o.encode_payload(buf),
            Self::Opaque { payload, .. } => buf.extend_from_slice(payload),
        }
    }

    /// Append this box, header included.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);
        put_header(buf, self.atom_type(), payload.len() as u64);
        buf.extend_from_slice(&payload);
    }
}

/// Decode the boxes packed in `data`, which starts at file offset `base`.
///
/// The children must exactly span `data`.
fn decode_boxes(data: &Bytes, base: u64) -> Result<Vec<MoovBox>> {
    let mut boxes = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let header_end = (pos + LARGE_HEADER_SIZE as usize).min(data.len());
        let atom = decode_header(
            &data[pos..header_end],
            base + pos as u64,
            base + data.len() as u64,
        )?;
        let start = pos + atom.header_size as usize;
        let end = pos + atom.size as usize;
        boxes.push(MoovBox::decode(
            atom.atom_type,
            data.slice(start..end),
            atom.data_offset(),
        )?);
        pos = end;
    }
    Ok(boxes)
}

fn find<'a>(boxes: &'a [MoovBox], path: &[AtomType]) -> Option<&'a MoovBox> {
    let (first, rest) = path.split_first()?;
    let found = boxes.iter().find(|b| b.atom_type() == *first)?;
    if rest.is_empty() {
        Some(found)
    } else {
        find(found.children(), rest)
    }
}

fn find_mut<'a>(boxes: &'a mut [MoovBox], path: &[AtomType]) -> Option<&'a mut MoovBox> {
    let (first, rest) = path.split_first()?;
    let found = boxes.iter_mut().find(|b| b.atom_type() == *first)?;
    if rest.is_empty() {
        return Some(found);
    }
    match found {
        MoovBox::Container { children, .. } => find_mut(children, rest),
        _ => None,
    }
}

/// `stco` and `co64` occupy the same slot.
fn table_slot(atom_type: AtomType) -> AtomType {
    if atom_type == AtomType::CO64 {
        AtomType::STCO
    } else {
        atom_type
    }
}

/// Replace, insert or remove the table occupying `slot`.
fn set_table(children: &mut Vec<MoovBox>, slot: AtomType, value: Option<MoovBox>) {
    let existing = children
        .iter()
        .position(|b| table_slot(b.atom_type()) == slot);
    match (existing, value) {
        (Some(i), Some(v)) => children[i] = v,
        (Some(i), None) => {
            debug!(atom = %slot, "Removing table");
            children.remove(i);
        }
        (None, Some(v)) => {
            let rank = STBL_ORDER.iter().position(|t| *t == slot);
            let at = children
                .iter()
                .position(|b| {
                    let other = STBL_ORDER
                        .iter()
                        .position(|t| *t == table_slot(b.atom_type()));
                    matches!((rank, other), (Some(r), Some(o)) if o > r)
                })
                .unwrap_or(children.len());
            debug!(atom = %slot, position = at, "Inserting table");
            children.insert(at, v);
        }
        (None, None) => {}
    }
}

/// Convert a duration between timescales, rounding to nearest.
pub fn rescale(duration: u64, from: u32, to: u32) -> u64 {
    if from == 0 {
        return 0;
    }
    let from = from as u128;
    ((duration as u128 * to as u128 + from / 2) / from) as u64
}

/// The decoded `moov` box of a single-video-track movie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieBox {
    children: Vec<MoovBox>,
}

impl MovieBox {
    /// Decode a movie box payload located at file offset `offset`.
    pub fn decode(payload: Bytes, offset: u64) -> Result<Self> {
        let children = decode_boxes(&payload, offset)?;
        Ok(Self { children })
    }

    pub fn from_children(children: Vec<MoovBox>) -> Self {
        Self { children }
    }

    /// Serialize the whole movie box, header included.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        for child in &self.children {
            child.encode(&mut payload);
        }
        let mut buf = BytesMut::with_capacity(payload.len() + 16);
        put_header(&mut buf, AtomType::MOOV, payload.len() as u64);
        buf.extend_from_slice(&payload);
        buf.freeze()
    }

    /// Number of `trak` boxes.
    pub fn track_count(&self) -> usize {
        self.children
            .iter()
            .filter(|b| b.atom_type() == AtomType::TRAK)
            .count()
    }

    /// Whether the movie declares movie fragments.
    pub fn is_fragmented(&self) -> bool {
        find(&self.children, &[AtomType::MVEX]).is_some()
    }

    /// Reject anything other than one video track in an unfragmented movie.
    pub fn check_supported(&self) -> Result<()> {
        if self.is_fragmented() {
            return Err(Error::unsupported("fragmented movies (mvex) cannot be appended to"));
        }
        match self.track_count() {
            1 => {}
            0 => return Err(Error::malformed("moov has no trak")),
            n => {
                return Err(Error::unsupported(format!(
                    "movie has {n} tracks, only a single video track is handled"
                )))
            }
        }
        match self.handler_type() {
            Some(handler) if &handler == b"vide" => Ok(()),
            Some(handler) => Err(Error::unsupported(format!(
                "track handler is {}, expected vide",
                AtomType::from_bytes(handler)
            ))),
            None => Err(Error::malformed("trak has no hdlr")),
        }
    }

    /// Handler type from `hdlr`, e.g. `vide`.
    pub fn handler_type(&self) -> Option<[u8; 4]> {
        match find(&self.children, &[AtomType::TRAK, AtomType::MDIA, AtomType::HDLR])? {
            // version/flags, pre_defined, then handler_type
            MoovBox::Opaque { payload, .. } => payload.get(8..12)?.try_into().ok(),
            _ => None,
        }
    }

    pub fn movie_header(&self) -> Result<&TimingHeader> {
        match find(&self.children, &[AtomType::MVHD]) {
            Some(MoovBox::MovieHeader(h)) => Ok(h),
            _ => Err(Error::malformed("moov has no mvhd")),
        }
    }

    pub fn track_header(&self) -> Result<&TrackHeader> {
        match find(&self.children, &[AtomType::TRAK, AtomType::TKHD]) {
            Some(MoovBox::TrackHeader(h)) => Ok(h),
            _ => Err(Error::malformed("trak has no tkhd")),
        }
    }

    pub fn media_header(&self) -> Result<&TimingHeader> {
        match find(&self.children, &[AtomType::TRAK, AtomType::MDIA, AtomType::MDHD]) {
            Some(MoovBox::MediaHeader(h)) => Ok(h),
            _ => Err(Error::malformed("mdia has no mdhd")),
        }
    }

    pub fn edit_list(&self) -> Option<&EditList> {
        match find(&self.children, &[AtomType::TRAK, AtomType::EDTS, AtomType::ELST])? {
            MoovBox::EditList(e) => Some(e),
            _ => None,
        }
    }

    fn sample_table_boxes(&self) -> Result<&[MoovBox]> {
        match find(&self.children, STBL_PATH) {
            Some(MoovBox::Container { children, .. }) => Ok(children),
            _ => Err(Error::malformed("trak has no stbl")),
        }
    }

    pub fn sample_descriptions(&self) -> Result<&SampleDescriptions> {
        self.sample_table_boxes()?
            .iter()
            .find_map(|b| match b {
                MoovBox::SampleDescriptions(s) => Some(s),
                _ => None,
            })
            .ok_or_else(|| Error::malformed("stbl has no stsd"))
    }

    /// Resolve the track's sample tables into a chunk table.
    pub fn chunk_table(&self, payload_limit: u64) -> Result<ChunkTable> {
        let mut builder = ChunkTable::builder();
        builder.set_payload_limit(payload_limit);
        let mut missing = vec![
            AtomType::STCO,
            AtomType::STSC,
            AtomType::STSZ,
            AtomType::STTS,
        ];

        for b in self.sample_table_boxes()? {
            match b {
                MoovBox::ChunkOffsets(o) => builder.set_chunk_offsets(o.0.clone()),
                MoovBox::SampleToChunk(e) => builder.set_stsc(e.clone()),
                MoovBox::SampleSizes(s) => builder.set_stsz(s.clone()),
                MoovBox::TimeToSample(e) => builder.set_stts(e.clone()),
                MoovBox::CompositionOffsets(e) => builder.set_ctts(e.clone()),
                MoovBox::SyncSamples(s) => builder.set_sync_samples(s.clone()),
                _ => continue,
            }
            missing.retain(|t| *t != table_slot(b.atom_type()));
        }

        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(AtomType::as_str).collect();
            return Err(Error::malformed(format!(
                "stbl is missing {}",
                names.join(", ")
            )));
        }

        let table = builder.build()?;
        if !table.has_sync_table {
            warn!("No stss box; treating every sample as a sync sample");
        }
        Ok(table)
    }

    /// Replace the sample tables and descriptions of the track.
    ///
    /// Auxiliary per-sample tables that no longer match are dropped.
    pub fn set_sample_tables(
        &mut self,
        tables: EncodedTables,
        descriptions: SampleDescriptions,
    ) -> Result<()> {
        let children = match find_mut(&mut self.children, STBL_PATH) {
            Some(MoovBox::Container { children, .. }) => children,
            _ => return Err(Error::malformed("trak has no stbl")),
        };

        children.retain(|b| {
            let stale = b.atom_type().is_stale_after_edit();
            if stale {
                debug!(atom = %b.atom_type(), "Dropping stale sample table");
            }
            !stale
        });

        set_table(
            children,
            AtomType::STSD,
            Some(MoovBox::SampleDescriptions(descriptions)),
        );
        set_table(
            children,
            AtomType::STTS,
            Some(MoovBox::TimeToSample(tables.time_to_sample)),
        );
        set_table(
            children,
            AtomType::CTTS,
            tables.composition_offsets.map(MoovBox::CompositionOffsets),
        );
        set_table(
            children,
            AtomType::STSS,
            tables.sync_samples.map(MoovBox::SyncSamples),
        );
        set_table(
            children,
            AtomType::STSC,
            Some(MoovBox::SampleToChunk(tables.sample_to_chunk)),
        );
        set_table(
            children,
            AtomType::STSZ,
            Some(MoovBox::SampleSizes(tables.sample_sizes)),
        );
        set_table(
            children,
            AtomType::STCO,
            Some(MoovBox::ChunkOffsets(tables.chunk_offsets)),
        );
        Ok(())
    }

    /// Set the track's media duration and rescale the movie-level durations.
    pub fn set_media_duration(&mut self, media_duration: u64) -> Result<()> {
        let media_timescale = self.media_header()?.timescale;
        let movie_timescale = self.movie_header()?.timescale;
        let movie_duration = rescale(media_duration, media_timescale, movie_timescale);
        debug!(
            media_duration,
            media_timescale, movie_duration, movie_timescale, "Updating durations"
        );

        if let Some(MoovBox::MediaHeader(h)) = find_mut(
            &mut self.children,
            &[AtomType::TRAK, AtomType::MDIA, AtomType::MDHD],
        ) {
            h.duration = media_duration;
        }
        if let Some(MoovBox::MovieHeader(h)) = find_mut(&mut self.children, &[AtomType::MVHD]) {
            h.duration = movie_duration;
        }
        if let Some(MoovBox::TrackHeader(h)) =
            find_mut(&mut self.children, &[AtomType::TRAK, AtomType::TKHD])
        {
            h.duration = movie_duration;
        }
        if let Some(MoovBox::EditList(list)) = find_mut(
            &mut self.children,
            &[AtomType::TRAK, AtomType::EDTS, AtomType::ELST],
        ) {
            match list.entries.as_mut_slice() {
                [entry] => entry.segment_duration = movie_duration,
                entries => warn!(
                    entries = entries.len(),
                    "Edit list has more than one entry; leaving it unchanged"
                ),
            }
        }
        Ok(())
    }
}
