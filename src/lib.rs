//! Mp4append - append video chunks to an MP4 file
//!
//! This library crate exposes the CLI glue for integration testing. The
//! container work lives in `mp4append_media`.

pub mod cli;
pub mod config;
pub mod dump;
