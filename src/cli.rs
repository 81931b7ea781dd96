use anyhow::{Context, Result};
use clap::Parser;
use mp4append_media::ChunkSelection;
use regex::Regex;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mp4append")]
#[command(
    author,
    version,
    about = "Append video chunks to an MP4 file, in place when free space allows"
)]
pub struct Cli {
    /// Destination file followed by the sources to append, each optionally
    /// sliced by chunk as `path[start:end]`
    #[arg(required = true, value_name = "FILE[SLICE]", value_parser = parse_selection)]
    pub inputs: Vec<ChunkSelection>,

    /// Frames to reserve room for when the destination must be rewritten
    #[arg(long, alias = "future_frames", value_name = "N")]
    pub future_frames: Option<u64>,

    /// Print the selected chunks and frames of a single file instead of appending
    #[arg(long, alias = "dump_frames")]
    pub dump_frames: bool,

    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Parse `path` or `path[start:end]`. Omitted bounds are open and negative
/// bounds count from the end.
pub fn parse_selection(arg: &str) -> Result<ChunkSelection> {
    let pattern =
        Regex::new(r"^(.*)\[(-?\d+)?:(-?\d+)?\]$").context("Failed to build slice pattern")?;
    let Some(caps) = pattern.captures(arg) else {
        return Ok(ChunkSelection::all(arg));
    };

    let path = &caps[1];
    if path.is_empty() {
        anyhow::bail!("Missing file name in selection: {}", arg);
    }
    let bound = |index: usize| -> Result<Option<i64>> {
        caps.get(index)
            .map(|m| {
                m.as_str()
                    .parse::<i64>()
                    .with_context(|| format!("Invalid slice bound in {}", arg))
            })
            .transpose()
    };

    Ok(ChunkSelection::new(path, bound(2)?, bound(3)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_path() {
        let selection = parse_selection("clips/a.mp4").unwrap();
        assert_eq!(selection, ChunkSelection::all("clips/a.mp4"));
    }

    #[test]
    fn test_slices() {
        assert_eq!(
            parse_selection("a.mp4[1:3]").unwrap(),
            ChunkSelection::new("a.mp4", Some(1), Some(3))
        );
        assert_eq!(
            parse_selection("a.mp4[:-1]").unwrap(),
            ChunkSelection::new("a.mp4", None, Some(-1))
        );
        assert_eq!(
            parse_selection("a.mp4[-2:]").unwrap(),
            ChunkSelection::new("a.mp4", Some(-2), None)
        );
        assert_eq!(
            parse_selection("a.mp4[:]").unwrap(),
            ChunkSelection::new("a.mp4", None, None)
        );
    }

    #[test]
    fn test_brackets_without_slice_are_part_of_the_path() {
        assert_eq!(
            parse_selection("take[2].mp4").unwrap(),
            ChunkSelection::all("take[2].mp4")
        );
    }

    #[test]
    fn test_invalid_slices() {
        assert!(parse_selection("[0:1]").is_err());
        assert!(parse_selection("a.mp4[0:99999999999999999999]").is_err());
    }

    #[test]
    fn test_cli_parses_aliases() {
        let cli = Cli::try_parse_from(["mp4append", "a.mp4", "b.mp4[0:2]", "--future_frames", "10"])
            .unwrap();
        assert_eq!(cli.future_frames, Some(10));
        assert_eq!(
            cli.inputs,
            vec![
                ChunkSelection::all("a.mp4"),
                ChunkSelection::new("b.mp4", Some(0), Some(2))
            ]
        );

        assert!(Cli::try_parse_from(["mp4append", "[0:1]"]).is_err());

        let cli = Cli::try_parse_from(["mp4append", "--dump-frames", "a.mp4"]).unwrap();
        assert!(cli.dump_frames);
    }
}
