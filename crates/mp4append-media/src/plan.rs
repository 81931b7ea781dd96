//! Append planning: patch in place or rewrite with a doubled reservation.
//!
//! Planning is a pure function of the destination's sizes and the incoming
//! byte count. When a rewrite is forced, the new free box is at least as
//! large as the media data after the append, so a run of appends only
//! rewrites the file a logarithmic number of times.

use crate::mp4::ChunkTable;
use crate::{Error, Result};
use std::fmt;

/// How the destination gets updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Append payload to mdat and patch moov/free where they are.
    InPlace,
    /// Write a fresh file next to the destination and swap it in.
    FullRewrite,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InPlace => write!(f, "in-place"),
            Self::FullRewrite => write!(f, "full rewrite"),
        }
    }
}

/// Inputs to [`plan`].
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest {
    /// Current mdat payload size of the destination.
    pub media_data_size: u64,
    /// Free box payload usable for an in-place append.
    pub free_space_available: u64,
    /// Payload bytes of all incoming chunks.
    pub total_new_bytes: u64,
    /// Frames expected to be appended in the future.
    pub future_frames: u64,
    /// Average sample size used to turn `future_frames` into bytes.
    pub average_sample_size: Option<f64>,
}

impl PlanRequest {
    /// Average sample size of the destination, or of the first source when
    /// the destination has no samples.
    pub fn average_sample_size(
        destination: &ChunkTable,
        first_source: Option<&ChunkTable>,
    ) -> Option<f64> {
        destination
            .average_sample_size()
            .or_else(|| first_source.and_then(ChunkTable::average_sample_size))
    }
}

/// Decision reached by [`plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendPlan {
    pub total_new_bytes: u64,
    pub free_space_available: u64,
    pub strategy: Strategy,
    /// Free box payload to reserve when rewriting.
    pub new_free_space_bytes: Option<u64>,
    /// Reservation left once the append is done.
    pub free_space_after: u64,
}

/// Decide between an in-place append and a full rewrite.
pub fn plan(request: &PlanRequest) -> Result<AppendPlan> {
    if request.free_space_available >= request.total_new_bytes {
        return Ok(AppendPlan {
            total_new_bytes: request.total_new_bytes,
            free_space_available: request.free_space_available,
            strategy: Strategy::InPlace,
            new_free_space_bytes: None,
            free_space_after: request.free_space_available - request.total_new_bytes,
        });
    }
    plan_full_rewrite(request)
}

/// Plan a rewrite regardless of the free space on hand.
pub fn plan_full_rewrite(request: &PlanRequest) -> Result<AppendPlan> {
    let media_after = request.media_data_size + request.total_new_bytes;
    let reserved = media_after.max(future_bytes(request)?);
    Ok(AppendPlan {
        total_new_bytes: request.total_new_bytes,
        free_space_available: request.free_space_available,
        strategy: Strategy::FullRewrite,
        new_free_space_bytes: Some(reserved),
        free_space_after: reserved,
    })
}

/// Bytes needed for the future-frame hint.
fn future_bytes(request: &PlanRequest) -> Result<u64> {
    if request.future_frames == 0 {
        return Ok(0);
    }
    let average = request.average_sample_size.ok_or_else(|| {
        Error::size_mismatch(format!(
            "cannot size room for {} future frames: no samples to infer a frame size from",
            request.future_frames
        ))
    })?;
    Ok((request.future_frames as f64 * average).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(media: u64, free: u64, incoming: u64) -> PlanRequest {
        PlanRequest {
            media_data_size: media,
            free_space_available: free,
            total_new_bytes: incoming,
            future_frames: 0,
            average_sample_size: Some(50.0),
        }
    }

    #[test]
    fn test_rewrite_without_free_space() {
        let plan = plan(&request(100, 0, 50)).unwrap();
        assert_eq!(plan.strategy, Strategy::FullRewrite);
        assert!(plan.new_free_space_bytes.unwrap() >= 150);
        assert_eq!(plan.new_free_space_bytes, Some(150));
    }

    #[test]
    fn test_in_place_with_enough_free_space() {
        let plan = plan(&request(100, 200, 50)).unwrap();
        assert_eq!(plan.strategy, Strategy::InPlace);
        assert_eq!(plan.free_space_after, 150);
        assert_eq!(plan.new_free_space_bytes, None);
    }

    #[test]
    fn test_exact_fit_is_in_place() {
        let plan = plan(&request(100, 50, 50)).unwrap();
        assert_eq!(plan.strategy, Strategy::InPlace);
        assert_eq!(plan.free_space_after, 0);
    }

    #[test]
    fn test_future_frames_raise_reservation() {
        let mut req = request(100, 0, 50);
        req.future_frames = 1000;
        let plan = plan(&req).unwrap();
        assert_eq!(plan.new_free_space_bytes, Some(50_000));
    }

    #[test]
    fn test_future_frames_without_samples_is_size_mismatch() {
        let mut req = request(0, 0, 0);
        req.future_frames = 10;
        req.average_sample_size = None;
        // Zero bytes fit in zero free space: no rewrite, no inference needed.
        assert_eq!(plan(&req).unwrap().strategy, Strategy::InPlace);
        assert!(matches!(
            plan_full_rewrite(&req),
            Err(Error::SizeMismatch(_))
        ));
    }

    #[test]
    fn test_average_sample_size_fallback() {
        let empty = ChunkTable::default();
        assert_eq!(PlanRequest::average_sample_size(&empty, None), None);
    }

    #[test]
    fn test_doubling_bounds_rewrite_count() {
        let initial = 1_000u64;
        let step = 100u64;
        let mut media = initial;
        let mut free = 0u64;
        let mut rewrites = 0u32;

        while media < 1_000_000 {
            let plan = plan(&request(media, free, step)).unwrap();
            match plan.strategy {
                Strategy::InPlace => free = plan.free_space_after,
                Strategy::FullRewrite => {
                    let reserved = plan.new_free_space_bytes.unwrap();
                    assert!(reserved >= media);
                    assert!(reserved >= media + step);
                    free = reserved;
                    rewrites += 1;
                }
            }
            media += step;
        }

        let bound = ((media as f64) / (initial as f64)).log2().ceil() as u32 + 1;
        assert!(rewrites <= bound, "{rewrites} rewrites, bound {bound}");
    }
}
