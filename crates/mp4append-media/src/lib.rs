//! Mp4append-Media: in-place chunk appends for single-track MP4 video files
//!
//! This crate parses the movie box of an MP4 file, splices chunk lists from
//! several files together, and writes the result back into the first file.
//!
//! # Modules
//!
//! - `mp4` - Box reader, box model and sample tables (stco/co64, stsc, stsz, stts, ctts, stss)
//! - `select` - Chunk windows with slice semantics, dimension checks
//! - `plan` - In-place vs full rewrite decision and free space sizing
//! - `writer` - In-place patch and temp-file rewrite
//! - `append` - Orchestration of the above
//!
//! # Architecture
//!
//! Files written by this crate keep the layout ftyp, moov, free, mdat with
//! mdat last. An append then:
//!
//! 1. Parses every input and resolves its chunk window
//! 2. Checks that all inputs share one frame size
//! 3. Merges sample descriptions and builds the new chunk list
//! 4. Writes the new payload at the end of mdat and rewrites moov in the
//!    moov+free region when free space allows
//! 5. Otherwise rewrites the whole file with a free box large enough that the
//!    next appends stay in place

pub mod append;
pub mod error;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixture;
pub mod mp4;
pub mod plan;
pub mod select;
pub mod writer;

pub use append::{append, AppendOptions, AppendOutcome};
pub use error::{Error, Result};
pub use mp4::Mp4File;
pub use plan::{AppendPlan, Strategy};
pub use select::ChunkSelection;
pub use writer::{WriteOptions, WriteReport};
