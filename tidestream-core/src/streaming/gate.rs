//! Bounded wait for contiguous piece availability.
//!
//! This is the only place a stream suspends. Piece arrival is driven by an
//! external engine whose notification cadence is unknown, so the gate re-checks
//! availability on a fixed interval and, when the engine offers completion
//! notifications, also wakes early on each finished piece.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use crate::torrent::{PieceIndex, TorrentEngine};

/// Result of waiting on the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Enough pieces were present on the first check.
    Ready,
    /// Pieces arrived after at least one wait.
    Recovered,
    /// The deadline passed before enough pieces arrived.
    TimedOut,
}

/// Checks for and waits on runs of present pieces.
pub struct AvailabilityGate {
    engine: Arc<dyn TorrentEngine>,
    min_run: u32,
    poll_interval: Duration,
    last_piece: u32,
}

impl AvailabilityGate {
    /// Creates a gate that never looks past `last_piece`.
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        min_run: u32,
        poll_interval: Duration,
        last_piece: u32,
    ) -> Self {
        Self {
            engine,
            min_run,
            poll_interval,
            last_piece,
        }
    }

    /// Checks for a run of consecutive present pieces within `[start, start + count)`.
    ///
    /// The run must be `min_run` pieces long, or span the whole window when
    /// the window is cut shorter than that by the end of the file.
    pub fn has_contiguous_run(&self, start: u32, count: u32) -> bool {
        let end = (start as u64 + count as u64).min(self.last_piece as u64 + 1);
        if end <= start as u64 {
            return false;
        }

        let required = self.min_run.min((end - start as u64) as u32);
        let mut run = 0u32;
        for piece in start..end as u32 {
            if self.engine.has_piece(PieceIndex::new(piece)) {
                run += 1;
                if run >= required {
                    return true;
                }
            } else {
                run = 0;
            }
        }
        false
    }

    /// Waits until [`has_contiguous_run`](Self::has_contiguous_run) holds or `deadline` passes.
    ///
    /// `on_stall` runs once, before the first wait, if the first check fails.
    pub async fn wait_for_availability(
        &self,
        start: u32,
        count: u32,
        deadline: Instant,
        on_stall: impl FnOnce(),
    ) -> Availability {
        if self.has_contiguous_run(start, count) {
            return Availability::Ready;
        }
        on_stall();

        let mut finished = self.engine.subscribe_piece_finished();
        loop {
            let now = Instant::now();
            if now >= deadline {
                trace!(start, count, "Availability wait timed out");
                return Availability::TimedOut;
            }

            let nap = self.poll_interval.min(deadline - now);
            let closed = match finished.as_mut() {
                Some(receiver) => matches!(
                    tokio::time::timeout(nap, receiver.recv()).await,
                    Ok(Err(broadcast::error::RecvError::Closed))
                ),
                None => {
                    tokio::time::sleep(nap).await;
                    false
                }
            };
            if closed {
                finished = None;
            }

            if self.has_contiguous_run(start, count) {
                trace!(start, count, "Pieces became available");
                return Availability::Recovered;
            }
            trace!(start, count, "Still waiting for pieces");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::streaming::test_engine::RecordingEngine;
    use crate::torrent::TorrentLayout;

    fn create_gate(total_pieces: u32) -> (Arc<RecordingEngine>, AvailabilityGate) {
        let layout = TorrentLayout::single_file("movie.mp4", total_pieces as u64 * 1024, 1024);
        let engine = Arc::new(RecordingEngine::new(Some(layout), PathBuf::from("/tmp")));
        let gate = AvailabilityGate::new(
            engine.clone(),
            3,
            Duration::from_millis(10),
            total_pieces - 1,
        );
        (engine, gate)
    }

    #[test]
    fn test_run_of_three_anywhere_in_window() {
        let (engine, gate) = create_gate(50);
        engine.mark_present([12, 13, 14]);

        assert!(gate.has_contiguous_run(10, 10));
        assert!(!gate.has_contiguous_run(10, 4));
    }

    #[test]
    fn test_broken_runs_do_not_count() {
        let (engine, gate) = create_gate(50);
        engine.mark_present([10, 11, 13, 14, 16, 17]);

        assert!(!gate.has_contiguous_run(10, 10));
    }

    #[test]
    fn test_tail_window_needs_only_remaining_pieces() {
        let (engine, gate) = create_gate(20);
        engine.mark_present([18, 19]);

        assert!(gate.has_contiguous_run(18, 10));
        assert!(!gate.has_contiguous_run(17, 10));
    }

    #[test]
    fn test_empty_window_is_never_available() {
        let (engine, gate) = create_gate(20);
        engine.mark_present(0..20);

        assert!(!gate.has_contiguous_run(5, 0));
        assert!(!gate.has_contiguous_run(25, 10));
    }

    #[tokio::test]
    async fn test_ready_without_stall() {
        let (engine, gate) = create_gate(20);
        engine.mark_present(0..3);
        let mut stalls = 0;

        let outcome = gate
            .wait_for_availability(0, 10, Instant::now() + Duration::from_secs(1), || {
                stalls += 1
            })
            .await;

        assert_eq!(outcome, Availability::Ready);
        assert_eq!(stalls, 0);
    }

    #[tokio::test]
    async fn test_times_out_after_single_stall_signal() {
        let (_engine, gate) = create_gate(20);
        let mut stalls = 0;
        let started = Instant::now();

        let outcome = gate
            .wait_for_availability(0, 10, started + Duration::from_millis(60), || stalls += 1)
            .await;

        assert_eq!(outcome, Availability::TimedOut);
        assert_eq!(stalls, 1);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_recovers_when_pieces_arrive() {
        let (engine, gate) = create_gate(20);
        let arriving = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            arriving.mark_present(4..7);
        });

        let outcome = gate
            .wait_for_availability(4, 10, Instant::now() + Duration::from_secs(2), || {})
            .await;

        assert_eq!(outcome, Availability::Recovered);
    }
}
