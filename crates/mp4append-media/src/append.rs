//! Append orchestration: open, select, merge, plan, write.

use crate::mp4::{Chunk, Mp4File};
use crate::plan::{plan, plan_full_rewrite, AppendPlan, PlanRequest, Strategy};
use crate::select::{check_destination_window, check_dimensions, ChunkSelection};
use crate::writer::{full_rewrite, InPlacePatch, MovieEdit, PlacedChunk, WriteOptions, WriteReport};
use crate::{Error, Result};
use std::ops::Range;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Default number of future frames to reserve room for on a rewrite.
pub const DEFAULT_FUTURE_FRAMES: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOptions {
    pub future_frames: u64,
    pub write: WriteOptions,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            future_frames: DEFAULT_FUTURE_FRAMES,
            write: WriteOptions::default(),
        }
    }
}

/// Result of a completed append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The plan as finally executed; an in-place plan whose preconditions
    /// failed is replaced by a rewrite plan.
    pub plan: AppendPlan,
    pub report: WriteReport,
    pub chunk_count: usize,
    pub sample_count: u64,
}

/// A source file with its selected chunk window.
#[derive(Debug)]
pub struct SelectedSource {
    pub path: PathBuf,
    pub file: Mp4File,
    pub window: Range<usize>,
}

impl SelectedSource {
    pub fn open(selection: &ChunkSelection) -> Result<Self> {
        let file = Mp4File::open(&selection.path)?;
        let window = selection.resolve(file.chunks.len());
        debug!(
            source = %selection,
            start = window.start,
            end = window.end,
            of = file.chunks.len(),
            "Selected chunks"
        );
        Ok(Self {
            path: selection.path.clone(),
            file,
            window,
        })
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.file.chunks.chunks[self.window.clone()]
    }
}

/// Append the selected chunks of every source to the destination, the
/// first selection.
///
/// The destination selection may only trim chunks from its end. Nothing is
/// written unless every input parses and all frame sizes agree.
pub fn append(selections: &[ChunkSelection], options: &AppendOptions) -> Result<AppendOutcome> {
    let (destination, sources) = selections
        .split_first()
        .ok_or_else(|| Error::unsupported("no destination file given"))?;

    let target = SelectedSource::open(destination)?;
    check_destination_window(&target.window, target.file.chunks.len())?;
    let sources = sources
        .iter()
        .map(SelectedSource::open)
        .collect::<Result<Vec<_>>>()?;

    let mut dimensions = vec![(target.path.as_path(), target.file.dimensions()?)];
    for source in &sources {
        dimensions.push((source.path.as_path(), source.file.dimensions()?));
    }
    check_dimensions(&dimensions)?;

    let request = PlanRequest {
        media_data_size: target.file.layout.media_data_size(),
        free_space_available: target.file.layout.available_free_space(),
        total_new_bytes: sources
            .iter()
            .flat_map(|s| s.chunks())
            .map(Chunk::len)
            .sum(),
        future_frames: options.future_frames,
        average_sample_size: PlanRequest::average_sample_size(
            &target.file.chunks,
            sources.first().map(|s| &s.file.chunks),
        ),
    };

    let edit = build_edit(target, &sources)?;
    let mut plan = plan(&request)?;
    info!(
        strategy = %plan.strategy,
        new_bytes = plan.total_new_bytes,
        free_space = plan.free_space_available,
        "Planned append"
    );

    let report = match plan.strategy {
        Strategy::InPlace => match InPlacePatch::prepare(&edit)? {
            Some(patch) => patch.apply(&edit, &options.write)?,
            None => {
                plan = plan_full_rewrite(&request)?;
                rewrite(&edit, &plan, &options.write)?
            }
        },
        Strategy::FullRewrite => rewrite(&edit, &plan, &options.write)?,
    };

    Ok(AppendOutcome {
        plan,
        report,
        chunk_count: edit.chunks.len(),
        sample_count: edit
            .chunks
            .iter()
            .map(|c| c.chunk.sample_count() as u64)
            .sum(),
    })
}

fn rewrite(edit: &MovieEdit, plan: &AppendPlan, options: &WriteOptions) -> Result<WriteReport> {
    let reserved = plan.new_free_space_bytes.unwrap_or(plan.free_space_after);
    info!(free_space = reserved, "Rewriting destination");
    full_rewrite(edit, reserved, options)
}

/// Merge the kept destination chunks and the selected source chunks into
/// one edit of the destination.
///
/// Sample descriptions are merged by byte equality; source timing is
/// converted to the destination's media timescale.
pub fn build_edit(target: SelectedSource, sources: &[SelectedSource]) -> Result<MovieEdit> {
    let mut descriptions = target.file.sample_descriptions()?.clone();
    let timescale = target.file.movie.media_header()?.timescale;
    // An empty window keeps nothing, wherever it sits.
    let kept = if target.window.is_empty() {
        0
    } else {
        target.window.end
    };

    let mut chunks: Vec<PlacedChunk> = target.file.chunks.chunks[..kept]
        .iter()
        .map(|chunk| PlacedChunk {
            input: 0,
            chunk: chunk.clone(),
        })
        .collect();
    let mut has_sync_table = target.file.chunks.has_sync_table;
    let mut has_composition_offsets = target.file.chunks.has_composition_offsets;
    let mut inputs = vec![target.path.clone()];

    for (i, source) in sources.iter().enumerate() {
        let input = i + 1;
        inputs.push(source.path.clone());
        if source.chunks().is_empty() {
            continue;
        }

        let source_descriptions = source.file.sample_descriptions()?;
        let source_timescale = source.file.movie.media_header()?.timescale;
        if source_timescale != timescale {
            warn!(
                source = %source.path.display(),
                from = source_timescale,
                to = timescale,
                "Media timescales differ; rescaling sample durations"
            );
        }
        has_sync_table |= source.file.chunks.has_sync_table;
        has_composition_offsets |= source.file.chunks.has_composition_offsets;

        for chunk in source.chunks() {
            let entry = source_descriptions
                .entries
                .get((chunk.sample_description_index as usize).wrapping_sub(1))
                .ok_or_else(|| {
                    Error::malformed(format!(
                        "{}: chunk {} uses sample description {} of {}",
                        source.path.display(),
                        chunk.index,
                        chunk.sample_description_index,
                        source_descriptions.entries.len()
                    ))
                })?;
            let merged = match descriptions.entries.iter().position(|e| e == entry) {
                Some(index) => index,
                None => {
                    debug!(
                        source = %source.path.display(),
                        index = descriptions.entries.len() + 1,
                        "Adding sample description"
                    );
                    descriptions.entries.push(entry.clone());
                    descriptions.entries.len() - 1
                }
            };

            let mut chunk = chunk.clone();
            chunk.sample_description_index = merged as u32 + 1;
            if source_timescale != timescale {
                rescale_timing(&mut chunk, source_timescale, timescale);
            }
            chunks.push(PlacedChunk { input, chunk });
        }
    }

    debug!(
        kept,
        dropped = target.file.chunks.len() - kept,
        total = chunks.len(),
        descriptions = descriptions.entries.len(),
        "Built edit"
    );

    Ok(MovieEdit {
        target: target.file,
        inputs,
        kept,
        chunks,
        descriptions,
        has_sync_table,
        has_composition_offsets,
    })
}

fn rescale_timing(chunk: &mut Chunk, from: u32, to: u32) {
    let scale = |value: u64| crate::mp4::boxes::rescale(value, from, to);
    for delta in &mut chunk.sample_deltas {
        *delta = scale(*delta as u64) as u32;
    }
    for offset in &mut chunk.composition_offsets {
        let magnitude = scale(offset.unsigned_abs() as u64) as i32;
        *offset = if *offset < 0 { -magnitude } else { magnitude };
    }
}
