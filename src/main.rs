use mp4append::{cli::Cli, config, dump};

use anyhow::{Context, Result};
use clap::Parser;
use mp4append_media::{append, AppendOutcome, ChunkSelection};
use std::path::Path;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "mp4append=trace,mp4append_media=trace".to_string()
        } else {
            "mp4append=info,mp4append_media=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let selections = cli.inputs;

    if cli.dump_frames {
        let [selection] = selections.as_slice() else {
            anyhow::bail!("--dump-frames takes exactly one file");
        };
        return dump_file(selection);
    }

    let config = config::load_config_or_default(cli.config.as_deref())?;
    run_append(&selections, &config, cli.future_frames)
}

fn run_append(
    selections: &[ChunkSelection],
    config: &config::Config,
    future_frames: Option<u64>,
) -> Result<()> {
    let options = config.append_options(future_frames);
    let destination = selections
        .first()
        .map(|s| s.path.as_path())
        .unwrap_or(Path::new(""));

    tracing::info!(
        "Appending {} source(s) to {}",
        selections.len().saturating_sub(1),
        destination.display()
    );

    let outcome = append(selections, &options)
        .with_context(|| format!("Failed to append to {}", destination.display()))?;
    print_outcome(destination, &outcome);

    Ok(())
}

fn print_outcome(destination: &Path, outcome: &AppendOutcome) {
    let plan = &outcome.plan;
    println!("File: {}", destination.display());
    println!("Strategy: {}", plan.strategy);
    println!("New bytes: {}", plan.total_new_bytes);
    println!(
        "Chunks: {} ({} samples)",
        outcome.chunk_count, outcome.sample_count
    );
    println!("Media data: {} bytes", outcome.report.media_data_size);
    println!("Free space: {} bytes", outcome.report.free_space);
    println!("Size: {} bytes", outcome.report.file_size);
}

fn dump_file(selection: &ChunkSelection) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    dump::dump_frames(selection, &mut out)?;
    std::io::Write::flush(&mut out)?;
    Ok(())
}
