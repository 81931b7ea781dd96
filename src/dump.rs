//! Human-readable listing of the chunks and frames of one file.

use anyhow::{Context, Result};
use mp4append_media::{ChunkSelection, Mp4File};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Write every selected chunk of `selection`, then each of its frames as
/// number, size and hex bytes. Frame numbers are 1-based within the file.
pub fn dump_frames(selection: &ChunkSelection, out: &mut impl Write) -> Result<()> {
    let mp4 = Mp4File::open(&selection.path)
        .with_context(|| format!("Failed to parse {}", selection.path.display()))?;
    let descriptions = mp4.sample_descriptions()?;
    let mut file = File::open(&selection.path)?;

    let selected = selection.select(&mp4.chunks.chunks);
    let skipped = selected.first().map_or(0, |c| c.index);
    let mut frame: u64 = mp4.chunks.chunks[..skipped]
        .iter()
        .map(|c| c.sample_count() as u64)
        .sum();

    writeln!(
        out,
        "{}: {} of {} chunks",
        selection,
        selected.len(),
        mp4.chunks.len()
    )?;

    let mut sample = Vec::new();
    for chunk in selected {
        let index = chunk.sample_description_index;
        let format = descriptions
            .format(index)
            .map_or_else(|| "-".to_string(), |f| f.to_string());
        let digest = descriptions
            .entries
            .get((index as usize).wrapping_sub(1))
            .map(|entry| description_digest(entry))
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "chunk {} offset {} samples {} bytes {} stsd {} {} {}",
            chunk.index,
            chunk.offset,
            chunk.sample_count(),
            chunk.len(),
            index,
            format,
            digest
        )?;

        file.seek(SeekFrom::Start(chunk.offset))?;
        for (i, &size) in chunk.sample_sizes.iter().enumerate() {
            frame += 1;
            sample.resize(size as usize, 0);
            file.read_exact(&mut sample).with_context(|| {
                format!("Frame {} of chunk {} is truncated", frame, chunk.index)
            })?;
            let sync = if chunk.sync_samples.contains(&(i as u32)) {
                " sync"
            } else {
                ""
            };
            writeln!(
                out,
                "  frame {} size {}{} {}",
                frame,
                size,
                sync,
                hex::encode(&sample)
            )?;
        }
    }

    Ok(())
}

/// First 16 hex characters of the SHA-256 of a sample description entry.
fn description_digest(entry: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry);
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp4append_media::fixture::MovieFixture;
    use tempfile::tempdir;

    #[test]
    fn test_dump_selected_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        MovieFixture::new(32, 32)
            .chunk(&[2, 3])
            .chunk(&[1])
            .chunk(&[4])
            .keyframes(&[1, 3])
            .write_to(&path)
            .unwrap();

        let mut out = Vec::new();
        dump_frames(&ChunkSelection::new(&path, Some(1), Some(2)), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("1 of 3 chunks"));
        assert!(lines[1].starts_with("chunk 1 offset "));
        assert!(lines[1].contains("samples 1 bytes 1 stsd 1 avc1 "));
        // Third sample of the file; payload byte is seed + sample index.
        assert_eq!(lines[2], "  frame 3 size 1 sync 02");
    }

    #[test]
    fn test_description_digest() {
        let digest = description_digest(b"avc1");
        assert_eq!(digest.len(), 16);
        assert_ne!(digest, description_digest(b"hvc1"));
    }
}
