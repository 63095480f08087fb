//! Seeking into regions that are not downloaded yet.

use std::io::SeekFrom;
use std::time::Duration;

use tidestream_core::{PiecePriority, StreamError, StreamEvent, TorrentStream};
use tidestream_sim::SimulatedSwarm;

use crate::swarm_fixture::{
    create_single_file, drain_events, read_to_end, stream_config, swarm_config,
};

const PIECE: u32 = 8 * 1024;

#[tokio::test]
async fn test_seek_into_missing_region_waits_for_pieces() {
    let fixture = create_single_file(100 * PIECE as usize, PIECE).await;
    for piece in 0..10 {
        fixture.torrent.mark_piece_available(piece).await.unwrap();
    }
    let stream = TorrentStream::open(fixture.torrent.clone(), 0, stream_config())
        .await
        .unwrap();
    let mut events = stream.subscribe();

    let torrent = fixture.torrent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        for piece in 60..64 {
            torrent.mark_piece_available(piece).await.unwrap();
        }
    });

    let target = 60 * PIECE as u64 + 123;
    stream.seek(SeekFrom::Start(target)).await.unwrap();
    let mut chunk = vec![0u8; 2000];
    let read = stream.read(&mut chunk).await.unwrap();

    let start = target as usize;
    assert_eq!(read, 2000);
    assert_eq!(&chunk[..], &fixture.torrent.content()[start..start + 2000]);
    assert_eq!(
        drain_events(&mut events),
        vec![StreamEvent::BufferingStarted, StreamEvent::BufferingCompleted]
    );
}

#[tokio::test]
async fn test_seek_moves_prioritized_window() {
    let fixture = create_single_file(100 * PIECE as usize, PIECE).await;
    fixture.torrent.complete_all().await.unwrap();
    let stream = TorrentStream::open(fixture.torrent.clone(), 0, stream_config())
        .await
        .unwrap();
    assert_eq!(fixture.torrent.priority(5), PiecePriority::TOP);

    stream
        .seek(SeekFrom::Start(60 * PIECE as u64))
        .await
        .unwrap();
    let mut chunk = vec![0u8; 16];
    stream.read(&mut chunk).await.unwrap();

    assert_eq!(fixture.torrent.priority(5), PiecePriority::DEFAULT);
    assert!(!fixture.torrent.has_deadline(5));
    assert_eq!(fixture.torrent.priority(59), PiecePriority::TOP);
    assert_eq!(fixture.torrent.priority(60), PiecePriority::TOP);
    assert_eq!(fixture.torrent.priority(70), PiecePriority::new(5));
    assert_eq!(fixture.torrent.priority(71), PiecePriority::DEFAULT);
    assert!(fixture.torrent.has_deadline(70));
}

#[tokio::test]
async fn test_seek_past_end_keeps_position() {
    let fixture = create_single_file(10 * PIECE as usize, PIECE).await;
    let stream = TorrentStream::open(fixture.torrent.clone(), 0, stream_config())
        .await
        .unwrap();
    stream.seek(SeekFrom::Start(500)).await.unwrap();

    let result = stream.seek(SeekFrom::Current(10 * PIECE as i64)).await;

    assert!(matches!(result, Err(StreamError::SeekOutOfRange { .. })));
    assert_eq!(stream.position().await.unwrap(), 500);
}

#[tokio::test]
async fn test_seek_to_tail_then_stream_to_end() {
    let fixture = create_single_file(300 * PIECE as usize + 17, PIECE).await;
    let swarm = SimulatedSwarm::new(fixture.torrent.clone(), &swarm_config(2 * 1024 * 1024))
        .unwrap()
        .spawn();
    let stream = TorrentStream::open(fixture.torrent.clone(), 0, stream_config())
        .await
        .unwrap();

    let target = stream.seek(SeekFrom::End(-(20 * PIECE as i64))).await.unwrap();
    let streamed = read_to_end(&stream, 5000).await;

    assert_eq!(&streamed[..], &fixture.torrent.content()[target as usize..]);
    // The tail finished long before the swarm could have reached it in order.
    assert!(!fixture.torrent.is_complete());

    stream.close().await;
    swarm.stop().await.unwrap();
}
