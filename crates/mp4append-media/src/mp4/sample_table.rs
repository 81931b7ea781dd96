//! MP4 sample table decoding and re-encoding.
//!
//! Sample tables describe how samples (frames) are organized in the file:
//! - stco/co64: chunk offsets
//! - stsc: sample-to-chunk mapping (run-length encoded)
//! - stsz: sample sizes
//! - stss: sync sample table (keyframes)
//! - stts: sample durations (decoding time)
//! - ctts: composition time offsets (for B-frames)
//!
//! The tables are flattened into a [`ChunkTable`], which is the unit the
//! rest of the crate selects, concatenates and writes back.

use super::atoms::{put_version_and_flags, AtomType, FieldReader};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// One `stsc` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleToChunkEntry {
    /// 1-based index of the first chunk in this run.
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
    /// 1-based index into the `stsd` entries.
    pub sample_description_index: u32,
}

/// One `stts` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeToSampleEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

/// One `ctts` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositionOffsetEntry {
    pub sample_count: u32,
    pub sample_offset: i32,
}

/// Contents of an `stsz` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleSizes {
    /// Every sample has the same size.
    Uniform { size: u32, count: u32 },
    /// One size per sample.
    Explicit(Vec<u32>),
}

impl SampleSizes {
    /// Choose the most compact form for the given sizes.
    pub fn from_sizes(sizes: Vec<u32>) -> Self {
        match sizes.first() {
            Some(&first) if first != 0 && sizes.iter().all(|&s| s == first) => Self::Uniform {
                size: first,
                count: sizes.len() as u32,
            },
            _ => Self::Explicit(sizes),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = FieldReader::new(AtomType::STSZ, payload);
        r.version_and_flags()?;
        let uniform_size = r.u32()?;
        if uniform_size != 0 {
            let count = r.u32()?;
            return Ok(Self::Uniform {
                size: uniform_size,
                count,
            });
        }
        let count = r.entry_count(4)?;
        let mut sizes = Vec::with_capacity(count);
        for _ in 0..count {
            sizes.push(r.u32()?);
        }
        Ok(Self::Explicit(sizes))
    }

    pub fn encode_payload(&self, buf: &mut BytesMut) {
        put_version_and_flags(buf, 0, 0);
        match self {
            Self::Uniform { size, count } => {
                buf.put_u32(*size);
                buf.put_u32(*count);
            }
            Self::Explicit(sizes) => {
                buf.put_u32(0);
                buf.put_u32(sizes.len() as u32);
                for size in sizes {
                    buf.put_u32(*size);
                }
            }
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Self::Uniform { count, .. } => *count as usize,
            Self::Explicit(sizes) => sizes.len(),
        }
    }

    /// Per-sample sizes.
    pub fn expand(&self) -> Vec<u32> {
        match self {
            Self::Uniform { size, count } => vec![*size; *count as usize],
            Self::Explicit(sizes) => sizes.clone(),
        }
    }
}

/// Contents of an `stco` or `co64` box.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkOffsets(pub Vec<u64>);

impl ChunkOffsets {
    pub fn decode(atom_type: AtomType, payload: &[u8]) -> Result<Self> {
        let large = atom_type == AtomType::CO64;
        let mut r = FieldReader::new(atom_type, payload);
        r.version_and_flags()?;
        let count = r.entry_count(if large { 8 } else { 4 })?;
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(if large { r.u64()? } else { r.u32()? as u64 });
        }
        Ok(Self(offsets))
    }

    /// Whether any offset needs the 64-bit table.
    pub fn is_large(&self) -> bool {
        self.0.iter().any(|&o| o > u32::MAX as u64)
    }

    /// `co64` when any offset exceeds 32 bits, `stco` otherwise.
    pub fn atom_type(&self) -> AtomType {
        if self.is_large() {
            AtomType::CO64
        } else {
            AtomType::STCO
        }
    }

    pub fn encode_payload(&self, buf: &mut BytesMut) {
        let large = self.is_large();
        put_version_and_flags(buf, 0, 0);
        buf.put_u32(self.0.len() as u32);
        for &offset in &self.0 {
            if large {
                buf.put_u64(offset);
            } else {
                buf.put_u32(offset as u32);
            }
        }
    }
}

pub fn decode_sample_to_chunk(payload: &[u8]) -> Result<Vec<SampleToChunkEntry>> {
    let mut r = FieldReader::new(AtomType::STSC, payload);
    r.version_and_flags()?;
    let count = r.entry_count(12)?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(SampleToChunkEntry {
            first_chunk: r.u32()?,
            samples_per_chunk: r.u32()?,
            sample_description_index: r.u32()?,
        });
    }
    Ok(entries)
}

pub fn encode_sample_to_chunk(entries: &[SampleToChunkEntry], buf: &mut BytesMut) {
    put_version_and_flags(buf, 0, 0);
    buf.put_u32(entries.len() as u32);
    for entry in entries {
        buf.put_u32(entry.first_chunk);
        buf.put_u32(entry.samples_per_chunk);
        buf.put_u32(entry.sample_description_index);
    }
}

pub fn decode_time_to_sample(payload: &[u8]) -> Result<Vec<TimeToSampleEntry>> {
    let mut r = FieldReader::new(AtomType::STTS, payload);
    r.version_and_flags()?;
    let count = r.entry_count(8)?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(TimeToSampleEntry {
            sample_count: r.u32()?,
            sample_delta: r.u32()?,
        });
    }
    Ok(entries)
}

pub fn encode_time_to_sample(entries: &[TimeToSampleEntry], buf: &mut BytesMut) {
    put_version_and_flags(buf, 0, 0);
    buf.put_u32(entries.len() as u32);
    for entry in entries {
        buf.put_u32(entry.sample_count);
        buf.put_u32(entry.sample_delta);
    }
}

pub fn decode_composition_offsets(payload: &[u8]) -> Result<Vec<CompositionOffsetEntry>> {
    let mut r = FieldReader::new(AtomType::CTTS, payload);
    r.version_and_flags()?;
    let count = r.entry_count(8)?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let sample_count = r.u32()?;
        // Version 0 offsets are unsigned on paper, but muxers write negative
        // values there too; both versions read back as two's complement.
        let sample_offset = r.u32()? as i32;
        entries.push(CompositionOffsetEntry {
            sample_count,
            sample_offset,
        });
    }
    Ok(entries)
}

pub fn encode_composition_offsets(entries: &[CompositionOffsetEntry], buf: &mut BytesMut) {
    let version = if entries.iter().any(|e| e.sample_offset < 0) {
        1
    } else {
        0
    };
    put_version_and_flags(buf, version, 0);
    buf.put_u32(entries.len() as u32);
    for entry in entries {
        buf.put_u32(entry.sample_count);
        buf.put_i32(entry.sample_offset);
    }
}

pub fn decode_sync_samples(payload: &[u8]) -> Result<Vec<u32>> {
    let mut r = FieldReader::new(AtomType::STSS, payload);
    r.version_and_flags()?;
    let count = r.entry_count(4)?;
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        samples.push(r.u32()?);
    }
    Ok(samples)
}

pub fn encode_sync_samples(samples: &[u32], buf: &mut BytesMut) {
    put_version_and_flags(buf, 0, 0);
    buf.put_u32(samples.len() as u32);
    for sample in samples {
        buf.put_u32(*sample);
    }
}

/// A chunk with everything needed to copy it and describe it in a new table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the chunk in the table it was decoded from.
    pub index: usize,
    /// Absolute file offset of the first sample.
    pub offset: u64,
    /// 1-based `stsd` entry this chunk's samples use.
    pub sample_description_index: u32,
    pub sample_sizes: Vec<u32>,
    pub sample_deltas: Vec<u32>,
    pub composition_offsets: Vec<i32>,
    /// 0-based positions (within this chunk) of sync samples.
    pub sync_samples: Vec<u32>,
}

impl Chunk {
    pub fn sample_count(&self) -> usize {
        self.sample_sizes.len()
    }

    /// Total payload bytes in this chunk.
    pub fn len(&self) -> u64 {
        self.sample_sizes.iter().map(|&s| s as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// File offset one past the last payload byte.
    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }

    /// Whether the chunk starts on a sync sample.
    pub fn is_sync(&self) -> bool {
        self.sync_samples.first() == Some(&0)
    }

    pub fn duration(&self) -> u64 {
        self.sample_deltas.iter().map(|&d| d as u64).sum()
    }
}

/// Flat, per-chunk view of one track's sample tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkTable {
    pub chunks: Vec<Chunk>,
    /// The source carried an `stss` box.
    pub has_sync_table: bool,
    /// The source carried a `ctts` box.
    pub has_composition_offsets: bool,
}

impl ChunkTable {
    /// Create a new chunk table builder.
    pub fn builder() -> ChunkTableBuilder {
        ChunkTableBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn sample_count(&self) -> u64 {
        self.chunks.iter().map(|c| c.sample_count() as u64).sum()
    }

    /// Total payload bytes referenced by all chunks.
    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(Chunk::len).sum()
    }

    /// Sum of all sample durations, in media timescale units.
    pub fn media_duration(&self) -> u64 {
        self.chunks.iter().map(Chunk::duration).sum()
    }

    /// Mean sample size in bytes, or `None` when there are no samples.
    pub fn average_sample_size(&self) -> Option<f64> {
        let samples = self.sample_count();
        if samples == 0 {
            None
        } else {
            Some(self.total_bytes() as f64 / samples as f64)
        }
    }

    /// Whether the first `count` chunks sit back to back starting at `start`.
    pub fn is_packed_from(&self, start: u64, count: usize) -> bool {
        let mut pos = start;
        for chunk in self.chunks.iter().take(count) {
            if chunk.offset != pos {
                return false;
            }
            pos = chunk.end();
        }
        true
    }

    /// Serialize the table back into sample table boxes.
    ///
    /// Runs are re-derived from the flat chunk list, so the output never has
    /// two adjacent runs with identical values.
    pub fn encode(&self) -> EncodedTables {
        let chunk_offsets = ChunkOffsets(self.chunks.iter().map(|c| c.offset).collect());

        let mut sample_to_chunk: Vec<SampleToChunkEntry> = Vec::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            let samples_per_chunk = chunk.sample_count() as u32;
            let same_run = sample_to_chunk.last().is_some_and(|run| {
                run.samples_per_chunk == samples_per_chunk
                    && run.sample_description_index == chunk.sample_description_index
            });
            if !same_run {
                sample_to_chunk.push(SampleToChunkEntry {
                    first_chunk: i as u32 + 1,
                    samples_per_chunk,
                    sample_description_index: chunk.sample_description_index,
                });
            }
        }

        let sizes: Vec<u32> = self
            .chunks
            .iter()
            .flat_map(|c| c.sample_sizes.iter().copied())
            .collect();

        let mut time_to_sample: Vec<TimeToSampleEntry> = Vec::new();
        for delta in self.chunks.iter().flat_map(|c| c.sample_deltas.iter().copied()) {
            match time_to_sample.last_mut() {
                Some(run) if run.sample_delta == delta => run.sample_count += 1,
                _ => time_to_sample.push(TimeToSampleEntry {
                    sample_count: 1,
                    sample_delta: delta,
                }),
            }
        }

        let needs_ctts = self.has_composition_offsets
            || self
                .chunks
                .iter()
                .any(|c| c.composition_offsets.iter().any(|&o| o != 0));
        let composition_offsets = needs_ctts.then(|| {
            let mut runs: Vec<CompositionOffsetEntry> = Vec::new();
            for offset in self
                .chunks
                .iter()
                .flat_map(|c| c.composition_offsets.iter().copied())
            {
                match runs.last_mut() {
                    Some(run) if run.sample_offset == offset => run.sample_count += 1,
                    _ => runs.push(CompositionOffsetEntry {
                        sample_count: 1,
                        sample_offset: offset,
                    }),
                }
            }
            runs
        });

        let mut sync = Vec::new();
        let mut first_sample = 1u32;
        let mut all_sync = true;
        for chunk in &self.chunks {
            for &s in &chunk.sync_samples {
                sync.push(first_sample + s);
            }
            if chunk.sync_samples.len() != chunk.sample_count() {
                all_sync = false;
            }
            first_sample += chunk.sample_count() as u32;
        }
        let sync_samples = (self.has_sync_table || !all_sync).then_some(sync);

        EncodedTables {
            chunk_offsets,
            sample_to_chunk,
            sample_sizes: SampleSizes::from_sizes(sizes),
            time_to_sample,
            composition_offsets,
            sync_samples,
        }
    }
}

/// Sample table boxes produced by [`ChunkTable::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTables {
    pub chunk_offsets: ChunkOffsets,
    pub sample_to_chunk: Vec<SampleToChunkEntry>,
    pub sample_sizes: SampleSizes,
    pub time_to_sample: Vec<TimeToSampleEntry>,
    /// `None` means the `ctts` box is omitted.
    pub composition_offsets: Option<Vec<CompositionOffsetEntry>>,
    /// `None` means the `stss` box is omitted (every sample is sync).
    pub sync_samples: Option<Vec<u32>>,
}

/// Builder for constructing a chunk table from raw atom data.
#[derive(Debug, Default)]
pub struct ChunkTableBuilder {
    chunk_offsets: Vec<u64>,
    stsc_entries: Vec<SampleToChunkEntry>,
    sample_sizes: Option<SampleSizes>,
    stts_entries: Vec<TimeToSampleEntry>,
    ctts_entries: Option<Vec<CompositionOffsetEntry>>,
    sync_samples: Option<Vec<u32>>,
    payload_limit: Option<u64>,
}

impl ChunkTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set chunk offsets (from stco or co64).
    pub fn set_chunk_offsets(&mut self, offsets: Vec<u64>) {
        self.chunk_offsets = offsets;
    }

    pub fn set_stsc(&mut self, entries: Vec<SampleToChunkEntry>) {
        self.stsc_entries = entries;
    }

    pub fn set_stsz(&mut self, sizes: SampleSizes) {
        self.sample_sizes = Some(sizes);
    }

    pub fn set_stts(&mut self, entries: Vec<TimeToSampleEntry>) {
        self.stts_entries = entries;
    }

    pub fn set_ctts(&mut self, entries: Vec<CompositionOffsetEntry>) {
        self.ctts_entries = Some(entries);
    }

    /// Set stss entries (1-based sample numbers).
    pub fn set_sync_samples(&mut self, samples: Vec<u32>) {
        self.sync_samples = Some(samples);
    }

    /// Upper bound on the payload bytes the tables may describe, usually the
    /// mdat payload size.
    pub fn set_payload_limit(&mut self, limit: u64) {
        self.payload_limit = Some(limit);
    }

    /// Resolve the tables into per-chunk descriptors.
    ///
    /// Fails if chunk count, sample-to-chunk runs and sample counts disagree.
    pub fn build(self) -> Result<ChunkTable> {
        let num_chunks = self.chunk_offsets.len();
        let runs = expand_sample_to_chunk(&self.stsc_entries, num_chunks)?;
        let total_samples = runs
            .iter()
            .try_fold(0usize, |total, &(n, _)| total.checked_add(n as usize))
            .ok_or_else(|| Error::malformed("stsc sample count overflows"))?;

        // Counts are checked before anything is expanded.
        let listed = self.sample_sizes.as_ref().map_or(0, SampleSizes::count);
        if listed != total_samples {
            return Err(Error::malformed(format!(
                "stsz lists {} samples but stsc/stco imply {} across {} chunks",
                listed, total_samples, num_chunks
            )));
        }
        if let Some(SampleSizes::Uniform { size, count }) = &self.sample_sizes {
            let bytes = *size as u64 * *count as u64;
            let limit = self.payload_limit.unwrap_or(u64::MAX);
            if bytes > limit {
                return Err(Error::malformed(format!(
                    "stsz describes {count} samples of {size} bytes, more than the {limit} payload bytes"
                )));
            }
        }
        let sizes = self
            .sample_sizes
            .as_ref()
            .map(SampleSizes::expand)
            .unwrap_or_default();

        let deltas = expand_runs(
            AtomType::STTS,
            self.stts_entries
                .iter()
                .map(|e| (e.sample_count, e.sample_delta)),
            total_samples,
        )?;

        let composition = match &self.ctts_entries {
            Some(entries) => {
                expand_runs(
                    AtomType::CTTS,
                    entries.iter().map(|e| (e.sample_count, e.sample_offset)),
                    total_samples,
                )?
            }
            None => vec![0; total_samples],
        };

        let mut is_sync = vec![self.sync_samples.is_none(); total_samples];
        if let Some(sync) = &self.sync_samples {
            for &number in sync {
                if number == 0 || number as usize > total_samples {
                    return Err(Error::malformed(format!(
                        "stss references sample {} of {}",
                        number, total_samples
                    )));
                }
                is_sync[number as usize - 1] = true;
            }
        }

        let mut chunks = Vec::with_capacity(num_chunks);
        let mut sample = 0usize;
        for (index, (&offset, &(count, description))) in
            self.chunk_offsets.iter().zip(runs.iter()).enumerate()
        {
            let range = sample..sample + count as usize;
            let sync_samples = range
                .clone()
                .filter(|&s| is_sync[s])
                .map(|s| (s - sample) as u32)
                .collect();
            chunks.push(Chunk {
                index,
                offset,
                sample_description_index: description,
                sample_sizes: sizes[range.clone()].to_vec(),
                sample_deltas: deltas[range.clone()].to_vec(),
                composition_offsets: composition[range.clone()].to_vec(),
                sync_samples,
            });
            sample = range.end;
        }

        for pair in chunks.windows(2) {
            if pair[1].offset < pair[0].end() {
                return Err(Error::malformed(format!(
                    "chunk {} at {} overlaps or precedes chunk {} ending at {}",
                    pair[1].index,
                    pair[1].offset,
                    pair[0].index,
                    pair[0].end()
                )));
            }
        }

        Ok(ChunkTable {
            chunks,
            has_sync_table: self.sync_samples.is_some(),
            has_composition_offsets: self.ctts_entries.is_some(),
        })
    }
}

/// Expand `stsc` runs into `(samples_per_chunk, sample_description_index)`
/// per chunk. The last run extends to the final chunk.
fn expand_sample_to_chunk(
    entries: &[SampleToChunkEntry],
    num_chunks: usize,
) -> Result<Vec<(u32, u32)>> {
    if num_chunks == 0 {
        return Ok(Vec::new());
    }
    let first = entries
        .first()
        .ok_or_else(|| Error::malformed(format!("stsc is empty but stco lists {num_chunks} chunks")))?;
    if first.first_chunk != 1 {
        return Err(Error::malformed(format!(
            "stsc starts at chunk {}, expected 1",
            first.first_chunk
        )));
    }

    let mut per_chunk = Vec::with_capacity(num_chunks);
    for (i, entry) in entries.iter().enumerate() {
        let next_first = entries
            .get(i + 1)
            .map(|e| e.first_chunk as usize)
            .unwrap_or(num_chunks + 1);
        let first_chunk = entry.first_chunk as usize;
        if first_chunk > num_chunks || next_first <= first_chunk {
            return Err(Error::malformed(format!(
                "stsc run {} (first chunk {}) is inconsistent with {} chunks",
                i, first_chunk, num_chunks
            )));
        }
        for _ in first_chunk..next_first.min(num_chunks + 1) {
            per_chunk.push((entry.samples_per_chunk, entry.sample_description_index));
        }
    }

    Ok(per_chunk)
}

/// Expand `(count, value)` runs into one value per sample. The runs must
/// cover exactly `expected` samples; this is checked before allocating.
fn expand_runs<T: Copy>(
    atom_type: AtomType,
    runs: impl Iterator<Item = (u32, T)> + Clone,
    expected: usize,
) -> Result<Vec<T>> {
    let covered = runs
        .clone()
        .try_fold(0usize, |total, (count, _)| total.checked_add(count as usize));
    if covered != Some(expected) {
        return Err(Error::malformed(match covered {
            Some(covered) => format!("{atom_type} covers {covered} samples, expected {expected}"),
            None => format!("{atom_type} sample count overflows"),
        }));
    }
    let mut out = Vec::with_capacity(expected);
    for (count, value) in runs {
        out.extend(std::iter::repeat(value).take(count as usize));
    }
    Ok(out)
}
