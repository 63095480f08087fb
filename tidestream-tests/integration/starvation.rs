//! Reads against a swarm that stalls or never delivers.

use std::time::{Duration, Instant};

use tidestream_core::{StreamError, StreamEvent, StreamPhase, TorrentStream};
use tidestream_sim::{SimulatedSwarm, SimulatedTorrent};

use crate::swarm_fixture::{
    create_single_file, drain_events, read_to_end, sha1_hex, stream_config, swarm_config,
};

#[tokio::test]
async fn test_read_times_out_once_without_data() {
    let fixture = create_single_file(64 * 1024, 4096).await;
    let config = stream_config().with_read_timeout(Duration::from_millis(150));
    let stream = TorrentStream::open(fixture.torrent.clone(), 0, config)
        .await
        .unwrap();
    let mut events = stream.subscribe();

    let started = Instant::now();
    let mut chunk = vec![0u8; 4096];
    let read = stream.read(&mut chunk).await.unwrap();

    assert_eq!(read, 0);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(
        drain_events(&mut events),
        vec![StreamEvent::BufferingStarted, StreamEvent::ReadTimeout]
    );
    assert_eq!(stream.position().await.unwrap(), 0);
    assert_eq!(stream.state(), StreamPhase::Ready);

    // The stream stays usable once data shows up.
    fixture.torrent.complete_all().await.unwrap();
    let read = stream.read(&mut chunk).await.unwrap();
    assert_eq!(read, 4096);
    assert_eq!(&chunk[..], &fixture.torrent.content()[..4096]);
}

#[tokio::test]
async fn test_slow_swarm_pairs_buffering_events() {
    let fixture = create_single_file(128 * 1024, 8 * 1024).await;
    let swarm = SimulatedSwarm::new(fixture.torrent.clone(), &swarm_config(256 * 1024))
        .unwrap()
        .spawn();
    let stream = TorrentStream::open(fixture.torrent.clone(), 0, stream_config())
        .await
        .unwrap();
    let mut events = stream.subscribe();

    let streamed = read_to_end(&stream, 16 * 1024).await;
    let events = drain_events(&mut events);

    assert_eq!(sha1_hex(&streamed), sha1_hex(fixture.torrent.content()));
    assert!(!events.contains(&StreamEvent::ReadTimeout));
    let started = events
        .iter()
        .filter(|event| **event == StreamEvent::BufferingStarted)
        .count();
    let completed = events
        .iter()
        .filter(|event| **event == StreamEvent::BufferingCompleted)
        .count();
    assert!(started >= 1);
    assert_eq!(started, completed);
    for pair in events.chunks(2) {
        assert_eq!(
            pair,
            [StreamEvent::BufferingStarted, StreamEvent::BufferingCompleted]
        );
    }

    stream.close().await;
    swarm.stop().await.unwrap();
}

#[tokio::test]
async fn test_engine_without_metadata_cannot_stream() {
    let dir = tempfile::TempDir::new().unwrap();
    let torrent = std::sync::Arc::new(SimulatedTorrent::without_metadata(dir.path()));

    let result = TorrentStream::open(torrent.clone(), 0, stream_config()).await;

    assert!(matches!(result, Err(StreamError::MetadataUnavailable)));
    assert!(torrent.commands().is_empty());
}
