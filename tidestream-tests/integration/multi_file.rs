//! Streaming one file out of a multi-file torrent.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use tidestream_core::{PiecePriority, StreamError, TorrentStream};
use tidestream_sim::SimulatedTorrent;

use crate::swarm_fixture::{init_test_tracing, read_to_end, sample_content, stream_config};

const PIECE: u32 = 1024;

async fn create_torrent(dir: &TempDir) -> (Arc<SimulatedTorrent>, Vec<u8>) {
    init_test_tracing();
    let movie = sample_content(40_000);
    let torrent = SimulatedTorrent::from_files(
        vec![
            (PathBuf::from("Sample/readme.txt"), Bytes::from(vec![b'x'; 1500])),
            (PathBuf::from("movie.mkv"), Bytes::from(movie.clone())),
            (PathBuf::from("subs.srt"), Bytes::from(vec![b's'; 700])),
        ],
        PIECE,
        dir.path(),
    )
    .await
    .unwrap();
    (Arc::new(torrent), movie)
}

#[tokio::test]
async fn test_middle_file_streams_through_torrent_offsets() {
    let dir = TempDir::new().unwrap();
    let (torrent, movie) = create_torrent(&dir).await;
    torrent.complete_all().await.unwrap();

    let stream = TorrentStream::open(torrent.clone(), 1, stream_config())
        .await
        .unwrap();
    assert_eq!(stream.length().unwrap(), movie.len() as u64);
    assert_eq!(stream.path(), dir.path().join("movie.mkv"));

    let streamed = read_to_end(&stream, 3333).await;
    assert_eq!(streamed, movie);

    stream.seek(SeekFrom::Start(548)).await.unwrap();
    let mut chunk = vec![0u8; 10];
    stream.read(&mut chunk).await.unwrap();
    assert_eq!(&chunk[..], &movie[548..558]);
}

#[tokio::test]
async fn test_opening_burst_targets_the_files_own_pieces() {
    let dir = TempDir::new().unwrap();
    let (torrent, _) = create_torrent(&dir).await;

    let _stream = TorrentStream::open(torrent.clone(), 1, stream_config())
        .await
        .unwrap();

    // readme.txt covers pieces 0..=1; movie.mkv starts inside piece 1.
    assert_eq!(torrent.priority(0), PiecePriority::DEFAULT);
    assert_eq!(torrent.priority(1), PiecePriority::TOP);
    assert_eq!(torrent.priority(30), PiecePriority::TOP);
    assert_eq!(torrent.priority(31), PiecePriority::DEFAULT);
}

#[tokio::test]
async fn test_file_index_past_last_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (torrent, _) = create_torrent(&dir).await;

    let result = TorrentStream::open(torrent, 3, stream_config()).await;

    assert!(matches!(
        result,
        Err(StreamError::FileIndexOutOfRange {
            index: 3,
            file_count: 3
        })
    ));
}
