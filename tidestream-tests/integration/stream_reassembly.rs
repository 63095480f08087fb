//! Whole-file reads while pieces are still arriving.

use std::time::Duration;

use tidestream_core::{PiecePriority, StreamPhase, TorrentStream};
use tidestream_sim::{EngineCommand, SimulatedSwarm};

use crate::swarm_fixture::{
    create_single_file, read_to_end, sha1_hex, stream_config, swarm_config,
};

#[tokio::test]
async fn test_stream_reassembles_file_during_download() {
    let fixture = create_single_file(1024 * 1024 + 333, 16 * 1024).await;
    let swarm = SimulatedSwarm::new(fixture.torrent.clone(), &swarm_config(8 * 1024 * 1024))
        .unwrap()
        .spawn();

    let stream = TorrentStream::open(fixture.torrent.clone(), 0, stream_config())
        .await
        .unwrap();
    let streamed = read_to_end(&stream, 10_000).await;

    assert_eq!(streamed.len(), fixture.torrent.content().len());
    assert_eq!(sha1_hex(&streamed), sha1_hex(fixture.torrent.content()));
    assert_eq!(stream.state(), StreamPhase::EndOfStream);
    assert!(fixture.torrent.is_sequential());
    assert_eq!(
        fixture.torrent.commands().first(),
        Some(&EngineCommand::Sequential(true))
    );

    stream.close().await;
    swarm.stop().await.unwrap();
}

#[tokio::test]
async fn test_pieces_arriving_in_reverse_are_reassembled() {
    let fixture = create_single_file(200 * 1024, 8 * 1024).await;
    let torrent = fixture.torrent.clone();
    let total = torrent.total_pieces();
    tokio::spawn(async move {
        for piece in (0..total).rev() {
            torrent.mark_piece_available(piece).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let stream = TorrentStream::open(fixture.torrent.clone(), 0, stream_config())
        .await
        .unwrap();
    let streamed = read_to_end(&stream, 4096).await;

    assert_eq!(&streamed[..], &fixture.torrent.content()[..]);
}

#[tokio::test]
async fn test_read_rate_drives_larger_read_ahead() {
    let fixture = create_single_file(4 * 1024 * 1024, 16 * 1024).await;
    fixture.torrent.complete_all().await.unwrap();

    let stream = TorrentStream::open(fixture.torrent.clone(), 0, stream_config())
        .await
        .unwrap();
    assert_eq!(stream.read_ahead_pieces().await.unwrap(), 10);

    let mut chunk = vec![0u8; 256 * 1024];
    for _ in 0..8 {
        stream.read(&mut chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(stream.average_read_rate().await.unwrap() > 0.0);
    assert_eq!(stream.read_ahead_pieces().await.unwrap(), 30);
}

#[tokio::test]
async fn test_close_returns_pieces_to_default_priority() {
    let fixture = create_single_file(512 * 1024, 8 * 1024).await;
    fixture.torrent.complete_all().await.unwrap();

    let stream = TorrentStream::open(fixture.torrent.clone(), 0, stream_config())
        .await
        .unwrap();
    let mut chunk = vec![0u8; 100_000];
    stream.read(&mut chunk).await.unwrap();
    assert!(
        (0..fixture.torrent.total_pieces())
            .any(|piece| fixture.torrent.priority(piece) == PiecePriority::TOP)
    );

    stream.close().await;

    for piece in 0..fixture.torrent.total_pieces() {
        assert_eq!(fixture.torrent.priority(piece), PiecePriority::DEFAULT);
        assert!(!fixture.torrent.has_deadline(piece));
    }
    assert_eq!(stream.state(), StreamPhase::Disposed);
}
