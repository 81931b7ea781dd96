use mp4append_media::append::DEFAULT_FUTURE_FRAMES;
use mp4append_media::writer::DEFAULT_COPY_BUFFER_SIZE;
use mp4append_media::{AppendOptions, WriteOptions};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Frames to reserve room for on a rewrite when `--future-frames` is not given
    #[serde(default = "default_future_frames")]
    pub future_frames: u64,

    /// Block size for payload copies, in bytes
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,

    /// Flush the destination to disk before patching metadata or renaming
    #[serde(default = "default_sync")]
    pub sync: bool,
}

fn default_future_frames() -> u64 {
    DEFAULT_FUTURE_FRAMES
}

fn default_copy_buffer_size() -> usize {
    DEFAULT_COPY_BUFFER_SIZE
}

fn default_sync() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            future_frames: default_future_frames(),
            copy_buffer_size: default_copy_buffer_size(),
            sync: default_sync(),
        }
    }
}

impl Config {
    /// Append options for this config, with an optional future frames override.
    pub fn append_options(&self, future_frames: Option<u64>) -> AppendOptions {
        AppendOptions {
            future_frames: future_frames.unwrap_or(self.future_frames),
            write: WriteOptions {
                copy_buffer_size: self.copy_buffer_size,
                sync: self.sync,
            },
        }
    }
}
