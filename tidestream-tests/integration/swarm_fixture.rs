//! Shared setup for streams backed by a simulated torrent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tidestream_core::{SimulationConfig, StreamConfig, StreamEvent, TorrentStream};
use tidestream_sim::SimulatedTorrent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::EnvFilter;

/// Simulated torrent plus the directory holding its partial files.
pub struct SwarmFixture {
    pub dir: TempDir,
    pub torrent: Arc<SimulatedTorrent>,
}

/// Routes the stream's logs to the test harness output.
///
/// Set `RUST_LOG=tidestream_core=trace` to see gate polls and refills of a
/// failing test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Deterministic, non-repeating-looking content.
pub fn sample_content(length: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..length)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Creates a single-file torrent of `length` bytes with nothing downloaded.
pub async fn create_single_file(length: usize, piece_length: u32) -> SwarmFixture {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let torrent = SimulatedTorrent::single_file(
        "movie.mp4",
        Bytes::from(sample_content(length)),
        piece_length,
        dir.path(),
    )
    .await
    .unwrap();

    SwarmFixture {
        dir,
        torrent: Arc::new(torrent),
    }
}

/// Stream settings scaled down for tests.
pub fn stream_config() -> StreamConfig {
    StreamConfig {
        poll_interval: Duration::from_millis(10),
        ..StreamConfig::default()
    }
    .with_read_timeout(Duration::from_secs(5))
    .with_buffer_sizes(64 * 1024, 128 * 1024)
}

/// Seeded swarm at `bytes_per_second`.
pub fn swarm_config(bytes_per_second: u64) -> SimulationConfig {
    SimulationConfig {
        deterministic_seed: Some(7),
        simulated_download_speed: bytes_per_second,
        tick_interval: Duration::from_millis(2),
        ..SimulationConfig::deterministic_testing()
    }
}

/// Reads until the stream reports end of data.
pub async fn read_to_end(stream: &TorrentStream, chunk_size: usize) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut chunk = vec![0u8; chunk_size];
    loop {
        let read = stream.read(&mut chunk).await.unwrap();
        if read == 0 {
            return collected;
        }
        collected.extend_from_slice(&chunk[..read]);
    }
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Events published so far, without waiting.
pub fn drain_events(receiver: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return events,
        }
    }
}
