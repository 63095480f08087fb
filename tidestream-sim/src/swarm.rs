//! Bandwidth-limited download loop feeding a [`SimulatedTorrent`].

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tidestream_core::config::SimulationConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::{SimulatedTorrent, SimulationError};

/// Outcome of a swarm run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmReport {
    /// Pieces completed by the swarm, in completion order.
    pub completed: Vec<u32>,
    /// Wall time the swarm ran for.
    pub elapsed: Duration,
}

/// Downloads pieces of a simulated torrent at a fixed byte rate.
///
/// Each tick adds `speed * tick` bytes to a budget. While the budget covers a
/// full piece, the torrent's next wanted piece is written out and announced.
/// Piece choice follows the priorities and deadlines the stream has set, so
/// the swarm reacts to seeks the way a real engine would.
pub struct SimulatedSwarm {
    torrent: Arc<SimulatedTorrent>,
    bytes_per_second: u64,
    tick: Duration,
    rng: ChaCha8Rng,
}

/// Running swarm task.
pub struct SwarmHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<SwarmReport, SimulationError>>,
}

impl SwarmHandle {
    /// Stops the swarm and returns what it completed.
    ///
    /// # Errors
    ///
    /// - `SimulationError::Io` - A piece write failed before the stop
    /// - `SimulationError::TaskFailed` - The swarm task panicked or was cancelled
    pub async fn stop(self) -> Result<SwarmReport, SimulationError> {
        let _ = self.shutdown.send(true);
        self.join().await
    }

    /// Waits for the swarm to finish on its own, which happens once every
    /// piece is present.
    ///
    /// # Errors
    ///
    /// - `SimulationError::Io` - A piece write failed
    /// - `SimulationError::TaskFailed` - The swarm task panicked or was cancelled
    pub async fn join(self) -> Result<SwarmReport, SimulationError> {
        self.task
            .await
            .map_err(|error| SimulationError::TaskFailed {
                reason: error.to_string(),
            })?
    }

    /// Returns true once the swarm task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl SimulatedSwarm {
    /// Creates a swarm using the speed, tick and seed of `config`.
    ///
    /// Without a configured seed the piece order is seeded randomly.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidSetup` - Zero speed or zero tick interval
    pub fn new(
        torrent: Arc<SimulatedTorrent>,
        config: &SimulationConfig,
    ) -> Result<Self, SimulationError> {
        if config.simulated_download_speed == 0 || config.tick_interval.is_zero() {
            return Err(SimulationError::InvalidSetup {
                reason: format!(
                    "download speed {} B/s with tick {:?}",
                    config.simulated_download_speed, config.tick_interval
                ),
            });
        }

        let seed = config.deterministic_seed.unwrap_or_else(rand::random);
        debug!(
            seed,
            speed = config.simulated_download_speed,
            "Created simulated swarm"
        );

        Ok(Self {
            torrent,
            bytes_per_second: config.simulated_download_speed,
            tick: config.tick_interval,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Runs the swarm on a background task.
    pub fn spawn(self) -> SwarmHandle {
        let (shutdown, stop_signal) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_signal));
        SwarmHandle { shutdown, task }
    }

    /// Downloads until every piece is present or `shutdown` turns true.
    ///
    /// # Errors
    ///
    /// - `SimulationError::Io` - A piece write failed
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SwarmReport, SimulationError> {
        let started = Instant::now();
        let full_piece = self.torrent.piece_size(0) as f64;
        let per_tick = self.bytes_per_second as f64 * self.tick.as_secs_f64();
        let mut budget = 0.0f64;
        let mut completed = Vec::new();

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.torrent.is_complete() {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(completed = completed.len(), "Simulated swarm stopped");
                        break;
                    }
                    continue;
                }
            }

            budget = (budget + per_tick).min(full_piece + per_tick);
            while budget >= full_piece {
                let Some(piece) = self.torrent.next_wanted_piece(&mut self.rng) else {
                    break;
                };
                self.torrent.mark_piece_available(piece).await?;
                budget -= full_piece;
                completed.push(piece);
            }
        }

        let elapsed = started.elapsed();
        if self.torrent.is_complete() {
            info!(
                pieces = completed.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Simulated swarm finished download"
            );
        }
        Ok(SwarmReport { completed, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;
    use tidestream_core::torrent::{PieceIndex, PiecePriority, TorrentEngine};

    use super::*;

    fn fast_config(seed: u64) -> SimulationConfig {
        SimulationConfig {
            deterministic_seed: Some(seed),
            simulated_download_speed: 1024 * 1024,
            piece_size: 1024,
            tick_interval: Duration::from_millis(2),
        }
    }

    async fn create_torrent(dir: &TempDir, pieces: usize) -> Arc<SimulatedTorrent> {
        let content = Bytes::from((0..pieces * 1024).map(|i| (i % 199) as u8).collect::<Vec<_>>());
        Arc::new(
            SimulatedTorrent::single_file("movie.bin", content, 1024, dir.path())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_sequential_swarm_downloads_in_order() {
        let dir = TempDir::new().unwrap();
        let torrent = create_torrent(&dir, 16).await;
        torrent.set_sequential_download(true);

        let report = SimulatedSwarm::new(torrent.clone(), &fast_config(1))
            .unwrap()
            .spawn()
            .join()
            .await
            .unwrap();

        assert_eq!(report.completed, (0..16).collect::<Vec<_>>());
        assert!(torrent.is_complete());
        let on_disk = std::fs::read(dir.path().join("movie.bin")).unwrap();
        assert_eq!(&on_disk[..], &torrent.content()[..]);
    }

    #[tokio::test]
    async fn test_prioritized_pieces_come_first() {
        let dir = TempDir::new().unwrap();
        let torrent = create_torrent(&dir, 16).await;
        torrent.set_sequential_download(true);
        for piece in 10..13 {
            torrent.set_piece_priority(PieceIndex::new(piece), PiecePriority::TOP);
        }

        let report = SimulatedSwarm::new(torrent.clone(), &fast_config(1))
            .unwrap()
            .spawn()
            .join()
            .await
            .unwrap();

        assert_eq!(&report.completed[..3], &[10, 11, 12]);
        assert_eq!(report.completed[3], 0);
    }

    #[tokio::test]
    async fn test_seeded_random_order_is_reproducible() {
        let mut orders = Vec::new();
        for _ in 0..2 {
            let dir = TempDir::new().unwrap();
            let torrent = create_torrent(&dir, 24).await;
            let report = SimulatedSwarm::new(torrent, &fast_config(77))
                .unwrap()
                .spawn()
                .join()
                .await
                .unwrap();
            orders.push(report.completed);
        }

        assert_eq!(orders[0], orders[1]);
        assert_ne!(orders[0], (0..24).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stop_halts_download() {
        let dir = TempDir::new().unwrap();
        let torrent = create_torrent(&dir, 64).await;
        let config = SimulationConfig {
            simulated_download_speed: 10 * 1024,
            tick_interval: Duration::from_millis(10),
            ..fast_config(3)
        };
        let handle = SimulatedSwarm::new(torrent.clone(), &config)
            .unwrap()
            .spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = handle.stop().await.unwrap();

        assert!(!torrent.is_complete());
        assert_eq!(report.completed.len() as u32, torrent.present_count());
    }

    #[tokio::test]
    async fn test_zero_speed_is_rejected() {
        let dir = TempDir::new().unwrap();
        let torrent = create_torrent(&dir, 4).await;
        let config = SimulationConfig {
            simulated_download_speed: 0,
            ..fast_config(5)
        };

        assert!(matches!(
            SimulatedSwarm::new(torrent, &config),
            Err(SimulationError::InvalidSetup { .. })
        ));
    }
}
