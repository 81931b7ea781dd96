//! End-to-end append tests against synthetic MP4 files.

mod common;

use assert_matches::assert_matches;
use common::{
    chunk_offsets, chunk_payload, chunk_sizes, movie, overwrite_field, read_range, Workspace,
};
use mp4append_media::fixture::MovieFixture;
use mp4append_media::{
    append, AppendOptions, ChunkSelection, Error, Mp4File, Strategy, WriteOptions,
};
use std::fs;

fn options(future_frames: u64) -> AppendOptions {
    AppendOptions {
        future_frames,
        write: WriteOptions::default(),
    }
}

#[test]
fn test_rewrite_without_free_space() {
    let ws = Workspace::new();
    let dest_fixture = movie(&[50, 50]);
    let src_fixture = movie(&[50]).seed(100);
    let dest = ws.write("dest.mp4", &dest_fixture);
    let src = ws.write("src.mp4", &src_fixture);
    let ftyp_before = fs::read(&dest).unwrap();

    let outcome = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap();

    assert_eq!(outcome.plan.strategy, Strategy::FullRewrite);
    assert_eq!(outcome.plan.new_free_space_bytes, Some(150));
    assert_eq!(outcome.report.strategy, Strategy::FullRewrite);
    assert_eq!(outcome.report.media_data_size, 150);
    assert_eq!(outcome.chunk_count, 3);

    let mp4 = Mp4File::open(&dest).unwrap();
    assert!(mp4.layout.is_append_ready());
    assert_eq!(mp4.layout.media_data_size(), 150);
    assert!(mp4.layout.free_space() >= 150);
    assert_eq!(fs::metadata(&dest).unwrap().len(), outcome.report.file_size);

    // ftyp is carried over verbatim.
    let ftyp_len = mp4.layout.file_type.size as usize;
    assert_eq!(&fs::read(&dest).unwrap()[..ftyp_len], &ftyp_before[..ftyp_len]);

    let mut expected = dest_fixture.payload();
    expected.extend(src_fixture.payload());
    assert_eq!(chunk_payload(&dest), expected);
}

#[test]
fn test_rewrite_reserves_future_frames() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[50, 50]));
    let src = ws.write("src.mp4", &movie(&[50]));

    let outcome = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(1000),
    )
    .unwrap();

    // 1000 frames at the destination's 50 byte average.
    assert_eq!(outcome.plan.new_free_space_bytes, Some(50_000));
    assert_eq!(Mp4File::open(&dest).unwrap().layout.free_space(), 50_000);
}

#[test]
fn test_in_place_with_free_space() {
    let ws = Workspace::new();
    let dest_fixture = movie(&[50, 50]).free_space(200);
    let src_fixture = movie(&[50]).seed(100);
    let dest = ws.write("dest.mp4", &dest_fixture);
    let src = ws.write("src.mp4", &src_fixture);
    let before = Mp4File::open(&dest).unwrap();

    let outcome = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(1000),
    )
    .unwrap();

    assert_eq!(outcome.plan.strategy, Strategy::InPlace);
    assert_eq!(outcome.plan.free_space_after, 150);
    assert_eq!(outcome.report.strategy, Strategy::InPlace);
    assert_eq!(outcome.report.media_data_size, 150);

    let after = Mp4File::open(&dest).unwrap();
    assert!(after.layout.is_append_ready());
    assert_eq!(after.layout.media_data, {
        let mut media_data = before.layout.media_data;
        media_data.size += 50;
        media_data
    });
    assert_eq!(after.layout.free_space(), outcome.report.free_space);
    assert_eq!(&chunk_offsets(&after)[..2], &chunk_offsets(&before)[..]);
    assert_eq!(chunk_sizes(&after), vec![50, 50, 50]);

    let mut expected = dest_fixture.payload();
    expected.extend(src_fixture.payload());
    assert_eq!(chunk_payload(&dest), expected);

    // 3 samples of 512 ticks at 15360 Hz is 100 ms.
    assert_eq!(after.movie.media_header().unwrap().duration, 1536);
    assert_eq!(after.movie.movie_header().unwrap().duration, 100);
}

#[test]
fn test_size_mismatch_leaves_destination_untouched() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[50, 50]).free_space(200));
    let src = ws.write("src.mp4", &MovieFixture::new(64, 48).chunk(&[50]));
    let before = fs::read(&dest).unwrap();

    let err = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap_err();

    assert_matches!(err, Error::SizeMismatch(_));
    assert_eq!(fs::read(&dest).unwrap(), before);
}

#[test]
fn test_movie_box_overflow_falls_back_to_rewrite() {
    let ws = Workspace::new();
    let dest_fixture = movie(&[50, 50]).free_space(60);
    // Many small chunks: few payload bytes but a much larger chunk table.
    let sizes: Vec<u32> = (0..30).map(|i| 1 + i % 2).collect();
    let src_fixture = movie(&sizes).seed(7);
    let dest = ws.write("dest.mp4", &dest_fixture);
    let src = ws.write("src.mp4", &src_fixture);

    let outcome = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap();

    assert_eq!(outcome.plan.total_new_bytes, 45);
    assert_eq!(outcome.plan.strategy, Strategy::FullRewrite);
    assert_eq!(outcome.report.strategy, Strategy::FullRewrite);
    assert_eq!(outcome.plan.new_free_space_bytes, Some(145));

    let mp4 = Mp4File::open(&dest).unwrap();
    assert_eq!(mp4.chunks.len(), 32);
    assert_eq!(mp4.layout.free_space(), 145);

    let mut expected = dest_fixture.payload();
    expected.extend(src_fixture.payload());
    assert_eq!(chunk_payload(&dest), expected);
}

#[test]
fn test_trim_destination_end_and_append() {
    let ws = Workspace::new();
    let dest_fixture = movie(&[10, 20, 30]).free_space(200);
    let src_fixture = movie(&[40]).seed(100);
    let dest = ws.write("dest.mp4", &dest_fixture);
    let src = ws.write("src.mp4", &src_fixture);

    let outcome = append(
        &[
            ChunkSelection::new(&dest, None, Some(-1)),
            ChunkSelection::all(&src),
        ],
        &options(0),
    )
    .unwrap();

    assert_eq!(outcome.report.strategy, Strategy::InPlace);
    assert_eq!(outcome.report.media_data_size, 70);

    let mp4 = Mp4File::open(&dest).unwrap();
    assert!(mp4.layout.is_append_ready());
    assert_eq!(chunk_sizes(&mp4), vec![10, 20, 40]);
    assert_eq!(fs::metadata(&dest).unwrap().len(), mp4.layout.media_data.end());

    let mut expected = dest_fixture.payload()[..30].to_vec();
    expected.extend(src_fixture.payload());
    assert_eq!(chunk_payload(&dest), expected);
}

#[test]
fn test_trim_only() {
    let ws = Workspace::new();
    let dest_fixture = movie(&[10, 20, 30]).free_space(16);
    let dest = ws.write("dest.mp4", &dest_fixture);

    let outcome = append(&[ChunkSelection::new(&dest, Some(0), Some(1))], &options(0)).unwrap();

    assert_eq!(outcome.report.strategy, Strategy::InPlace);
    let mp4 = Mp4File::open(&dest).unwrap();
    assert_eq!(chunk_sizes(&mp4), vec![10]);
    assert_eq!(mp4.layout.media_data_size(), 10);
    assert_eq!(chunk_payload(&dest), dest_fixture.payload()[..10].to_vec());
}

#[test]
fn test_trim_from_start_is_unsupported() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[10, 20]).free_space(100));
    let src = ws.write("src.mp4", &movie(&[10]));
    let before = fs::read(&dest).unwrap();

    let err = append(
        &[ChunkSelection::new(&dest, Some(1), None), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap_err();

    assert_matches!(err, Error::Unsupported(_));
    assert_eq!(fs::read(&dest).unwrap(), before);
}

#[test]
fn test_source_slices() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[10]).free_space(100));
    let src = ws.write("src.mp4", &movie(&[1, 2, 3, 4, 5]));

    // [1:-1] selects the middle three chunks, [-1:] the last one and
    // [3:1] nothing.
    append(
        &[
            ChunkSelection::all(&dest),
            ChunkSelection::new(&src, Some(1), Some(-1)),
            ChunkSelection::new(&src, Some(-1), None),
            ChunkSelection::new(&src, Some(3), Some(1)),
        ],
        &options(0),
    )
    .unwrap();

    let mp4 = Mp4File::open(&dest).unwrap();
    assert_eq!(chunk_sizes(&mp4), vec![10, 2, 3, 4, 5]);
}

#[test]
fn test_append_destination_to_itself() {
    let ws = Workspace::new();
    let dest_fixture = movie(&[10, 20]).free_space(100);
    let dest = ws.write("dest.mp4", &dest_fixture);

    let outcome = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&dest)],
        &options(0),
    )
    .unwrap();

    assert_eq!(outcome.report.strategy, Strategy::InPlace);
    let payload = dest_fixture.payload();
    assert_eq!(chunk_payload(&dest), [payload.clone(), payload].concat());
}

#[test]
fn test_repeated_appends_rewrite_once() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[100]));
    let src = ws.write("src.mp4", &movie(&[100]).seed(9));

    let mut rewrites = 0;
    for _ in 0..8 {
        let outcome = append(
            &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
            &options(0),
        )
        .unwrap();
        if outcome.report.strategy == Strategy::FullRewrite {
            rewrites += 1;
            let reserved = outcome.plan.new_free_space_bytes.unwrap();
            assert!(reserved >= outcome.report.media_data_size);
        }
    }

    assert_eq!(rewrites, 1);
    let mp4 = Mp4File::open(&dest).unwrap();
    assert_eq!(mp4.layout.media_data_size(), 900);
    assert_eq!(mp4.chunks.len(), 9);
}

#[test]
fn test_moov_after_mdat_is_rewritten_append_ready() {
    let ws = Workspace::new();
    let dest_fixture = movie(&[50, 50]).moov_after_mdat().free_space(1000);
    let src_fixture = movie(&[50]).seed(3);
    let dest = ws.write("dest.mp4", &dest_fixture);
    let src = ws.write("src.mp4", &src_fixture);

    let outcome = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap();

    assert_eq!(outcome.plan.free_space_available, 0);
    assert_eq!(outcome.report.strategy, Strategy::FullRewrite);
    let mp4 = Mp4File::open(&dest).unwrap();
    assert!(mp4.layout.is_append_ready());

    let mut expected = dest_fixture.payload();
    expected.extend(src_fixture.payload());
    assert_eq!(chunk_payload(&dest), expected);
}

#[test]
fn test_large_media_header_is_kept() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[50, 50]).large_media_header().free_space(100));
    let src = ws.write("src.mp4", &movie(&[50]));

    let outcome = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap();

    assert_eq!(outcome.report.strategy, Strategy::InPlace);
    let mp4 = Mp4File::open(&dest).unwrap();
    assert_eq!(mp4.layout.media_data.header_size, 16);
    assert_eq!(mp4.layout.media_data_size(), 150);
}

#[test]
fn test_sync_table_inserted_for_non_sync_source() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[10, 20]).free_space(200));
    let src = ws.write(
        "src.mp4",
        &MovieFixture::new(64, 64).chunk(&[5, 5]).keyframes(&[1]),
    );
    assert!(!Mp4File::open(&dest).unwrap().chunks.has_sync_table);

    append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap();

    let mp4 = Mp4File::open(&dest).unwrap();
    assert!(mp4.chunks.has_sync_table);
    let sync: Vec<Vec<u32>> = mp4
        .chunks
        .chunks
        .iter()
        .map(|c| c.sync_samples.clone())
        .collect();
    assert_eq!(sync, vec![vec![0], vec![0], vec![0]]);
}

#[test]
fn test_new_sample_description_is_merged() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[10]).free_space(200));
    let variant = MovieFixture::visual_entry(b"avc1", 64, 64, 1);
    let src = ws.write(
        "src.mp4",
        &MovieFixture::new(64, 64)
            .descriptions(vec![variant.clone()])
            .chunk(&[10]),
    );

    append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap();

    let mp4 = Mp4File::open(&dest).unwrap();
    let descriptions = mp4.sample_descriptions().unwrap();
    assert_eq!(descriptions.entries.len(), 2);
    assert_eq!(descriptions.entries[1], variant);
    let indices: Vec<u32> = mp4
        .chunks
        .chunks
        .iter()
        .map(|c| c.sample_description_index)
        .collect();
    assert_eq!(indices, vec![1, 2]);
}

#[test]
fn test_future_frames_without_samples() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &MovieFixture::new(64, 64));
    let src = ws.write("src.mp4", &MovieFixture::new(64, 64));
    let before = fs::read(&dest).unwrap();

    let err = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(10),
    )
    .unwrap_err();

    assert_matches!(err, Error::SizeMismatch(_));
    assert_eq!(fs::read(&dest).unwrap(), before);
}

#[test]
fn test_malformed_source_is_rejected() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[10]).free_space(100));
    let src = ws.path("src.mp4");
    fs::write(&src, b"\0\0\0\x10ftypisom").unwrap();
    let before = fs::read(&dest).unwrap();

    let err = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap_err();

    assert_matches!(err, Error::MalformedContainer(_));
    assert_eq!(fs::read(&dest).unwrap(), before);
}

#[test]
fn test_empty_destination_window_replaces_every_chunk() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[10, 20, 30]).free_space(200));
    let src_fixture = movie(&[40]).seed(100);
    let src = ws.write("src.mp4", &src_fixture);

    let outcome = append(
        &[
            ChunkSelection::new(&dest, Some(2), Some(2)),
            ChunkSelection::all(&src),
        ],
        &options(0),
    )
    .unwrap();

    assert_eq!(outcome.chunk_count, 1);
    let mp4 = Mp4File::open(&dest).unwrap();
    assert_eq!(chunk_sizes(&mp4), vec![40]);
    assert_eq!(mp4.layout.media_data_size(), 40);
    assert_eq!(chunk_payload(&dest), src_fixture.payload());
}

#[test]
fn test_composition_offsets_rescaled_from_source() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[10]).free_space(200));
    let src = ws.write(
        "src.mp4",
        &MovieFixture::new(64, 64)
            .media_timescale(90000)
            .sample_delta(3000)
            .composition_offsets(&[-3000, 6000])
            .chunk(&[5, 5]),
    );
    assert!(!Mp4File::open(&dest).unwrap().chunks.has_composition_offsets);

    append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap();

    let mp4 = Mp4File::open(&dest).unwrap();
    assert!(mp4.chunks.has_composition_offsets);
    let chunks = &mp4.chunks.chunks;
    assert_eq!(chunks[0].composition_offsets, vec![0]);
    assert_eq!(chunks[1].sample_deltas, vec![512, 512]);
    assert_eq!(chunks[1].composition_offsets, vec![-512, 1024]);
    assert_eq!(mp4.movie.media_header().unwrap().duration, 1536);
}

#[test]
fn test_rewrite_promotes_chunk_offsets_to_64_bit() {
    let ws = Workspace::new();
    let dest_fixture = movie(&[1000]);
    let src_fixture = movie(&[1000]).seed(50);
    let dest = ws.write("dest.mp4", &dest_fixture);
    let src = ws.write("src.mp4", &src_fixture);

    // 5M frames of 1000 bytes pushes mdat past 4 GiB; the free box payload
    // is a hole, so little is actually written.
    let outcome = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(5_000_000),
    )
    .unwrap();
    assert_eq!(outcome.report.strategy, Strategy::FullRewrite);
    assert_eq!(outcome.report.free_space, 5_000_000_000);

    let mp4 = Mp4File::open(&dest).unwrap();
    assert!(chunk_offsets(&mp4).iter().all(|&o| o > u32::MAX as u64));
    let movie_box = read_range(&dest, mp4.layout.movie.offset, mp4.layout.movie.size);
    assert!(movie_box.windows(4).any(|w| w == b"co64"));
    assert!(!movie_box.windows(4).any(|w| w == b"stco"));

    let mut expected = dest_fixture.payload();
    expected.extend(src_fixture.payload());
    assert_eq!(chunk_payload(&dest), expected);

    // Later appends stay in place and keep 64-bit offsets.
    let outcome = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap();
    assert_eq!(outcome.report.strategy, Strategy::InPlace);
    let mp4 = Mp4File::open(&dest).unwrap();
    assert_eq!(chunk_sizes(&mp4), vec![1000, 1000, 1000]);
}

#[test]
fn test_oversized_stts_count_is_malformed() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[10]).free_space(100));
    let src = ws.write("src.mp4", &movie(&[10, 20]));
    // First stts entry's sample_count.
    overwrite_field(&src, b"stts", 12, u32::MAX);
    let before = fs::read(&dest).unwrap();

    let err = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap_err();

    assert_matches!(err, Error::MalformedContainer(_));
    assert_eq!(fs::read(&dest).unwrap(), before);
}

#[test]
fn test_oversized_stsd_count_is_malformed() {
    let ws = Workspace::new();
    let dest = ws.write("dest.mp4", &movie(&[10]).free_space(100));
    let src = ws.write("src.mp4", &movie(&[10]));
    // stsd entry_count.
    overwrite_field(&src, b"stsd", 8, u32::MAX);
    let before = fs::read(&dest).unwrap();

    let err = append(
        &[ChunkSelection::all(&dest), ChunkSelection::all(&src)],
        &options(0),
    )
    .unwrap_err();

    assert_matches!(err, Error::MalformedContainer(_));
    assert_eq!(fs::read(&dest).unwrap(), before);
}
