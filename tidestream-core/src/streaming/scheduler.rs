//! Read-ahead window prioritization.
//!
//! The engine has no notion of "this byte is needed at this wall-clock time".
//! The scheduler approximates one by giving pieces near the reader the highest
//! priority and tight deadlines, relaxing both with distance.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace};

use super::PieceGeometry;
use crate::config::StreamConfig;
use crate::torrent::{PieceIndex, PiecePriority, TorrentEngine};

/// Base deadline growth per piece of distance, in milliseconds.
const DEADLINE_BASE_MS: i64 = 30;
/// Additional deadline growth per squared piece of distance, in milliseconds.
const DEADLINE_GROWTH_MS: i64 = 2;
/// Pieces of distance per one-level priority drop.
const PRIORITY_DECAY_DISTANCE: i64 = 5;

/// Number of pieces needed to cover the read-ahead horizon at the given rate.
///
/// Always within `[config.min_read_ahead, config.max_read_ahead]`; zero,
/// negative, NaN and infinite rates all clamp to a bound.
pub fn read_ahead_pieces(average_read_rate: f64, piece_length: u32, config: &StreamConfig) -> u32 {
    let target =
        average_read_rate * config.read_ahead_horizon.as_secs_f64() / piece_length.max(1) as f64;
    // Float to int casts saturate and map NaN to zero.
    (target as u32).clamp(config.min_read_ahead, config.max_read_ahead)
}

/// Piece the reader is expected to reach after the prediction horizon.
///
/// Projects `position` forward by the smoothed rate and clamps the result to
/// the last byte of the file.
pub fn predicted_piece(
    geometry: &PieceGeometry,
    position: u64,
    average_read_rate: f64,
    config: &StreamConfig,
) -> u32 {
    let ahead = (average_read_rate * config.prediction_horizon.as_secs_f64()) as u64;
    let last_byte = geometry.file_length().saturating_sub(1);
    geometry.piece_of(position.saturating_add(ahead).min(last_byte))
}

/// Priority and deadline hint for one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PieceAssignment {
    pub piece: u32,
    pub priority: PiecePriority,
    pub deadline_ms: u64,
}

/// Inclusive range of pieces prioritized around an anchor piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PieceWindow {
    /// Piece the priorities and deadlines are measured from
    pub anchor: u32,
    pub start_piece: u32,
    pub end_piece: u32,
}

impl PieceWindow {
    /// Window from one piece behind `anchor` to `read_ahead` pieces past it.
    pub fn compute(anchor: u32, read_ahead: u32, total_pieces: u32) -> Self {
        let last_piece = total_pieces.saturating_sub(1);
        let anchor = anchor.min(last_piece);
        let end_piece = (anchor as u64 + read_ahead as u64).min(last_piece as u64) as u32;

        Self {
            anchor,
            start_piece: anchor.saturating_sub(1),
            end_piece,
        }
    }

    pub fn pieces(&self) -> RangeInclusive<u32> {
        self.start_piece..=self.end_piece
    }

    pub fn contains(&self, piece: u32) -> bool {
        self.pieces().contains(&piece)
    }

    /// Checks whether two windows cover the same pieces.
    pub fn same_range(&self, other: &PieceWindow) -> bool {
        self.start_piece == other.start_piece && self.end_piece == other.end_piece
    }

    /// `max(NORMAL, TOP - distance / 5)`, with distance truncated toward zero.
    pub fn priority_for(&self, piece: u32) -> PiecePriority {
        let distance = piece as i64 - self.anchor as i64;
        let level = PiecePriority::TOP.level() as i64 - distance / PRIORITY_DECAY_DISTANCE;
        let level = level.clamp(
            PiecePriority::NORMAL.level() as i64,
            PiecePriority::TOP.level() as i64,
        );
        PiecePriority::new(level as u8)
    }

    /// `distance * (30 + 2 * distance)` milliseconds, floored at zero.
    pub fn deadline_for(&self, piece: u32) -> Duration {
        let distance = piece as i64 - self.anchor as i64;
        let millis = distance * (DEADLINE_BASE_MS + distance * DEADLINE_GROWTH_MS);
        Duration::from_millis(millis.max(0) as u64)
    }

    /// Priority and deadline of every piece in the window, nearest first.
    pub fn assignments(&self) -> impl Iterator<Item = PieceAssignment> + '_ {
        self.pieces().map(|piece| PieceAssignment {
            piece,
            priority: self.priority_for(piece),
            deadline_ms: self.deadline_for(piece).as_millis() as u64,
        })
    }
}

/// Applies read-ahead windows to the engine.
///
/// Remembers the last applied window so that an unchanged window costs no
/// engine calls and a moved window can release the pieces it left behind.
pub struct PriorityScheduler {
    engine: Arc<dyn TorrentEngine>,
    total_pieces: u32,
    last_window: Option<PieceWindow>,
}

impl PriorityScheduler {
    pub fn new(engine: Arc<dyn TorrentEngine>, total_pieces: u32) -> Self {
        Self {
            engine,
            total_pieces,
            last_window: None,
        }
    }

    /// Window most recently applied to the engine.
    pub fn last_window(&self) -> Option<PieceWindow> {
        self.last_window
    }

    /// Gives the opening pieces of a file top priority and staggered deadlines.
    ///
    /// An empty file has nothing to fetch and leaves the engine untouched.
    pub fn prioritize_initial(&mut self, geometry: &PieceGeometry, config: &StreamConfig) {
        let count = geometry
            .file_piece_count()
            .min(config.initial_prioritized_pieces);
        if count == 0 || geometry.file_length() == 0 {
            return;
        }

        let first = geometry.first_piece();
        for offset in 0..count {
            let index = PieceIndex::new(first + offset);
            self.engine.set_piece_priority(index, PiecePriority::TOP);
            self.engine
                .set_piece_deadline(index, config.initial_deadline_step * offset);
        }

        debug!(first, count, "Prioritized opening pieces");
        self.last_window = Some(PieceWindow {
            anchor: first,
            start_piece: first,
            end_piece: first + count - 1,
        });
    }

    /// Moves the prioritized window to `anchor` with `read_ahead` pieces ahead.
    ///
    /// Returns `false` without touching the engine if the window covers the
    /// same pieces as the previous call.
    pub fn update_priorities(&mut self, anchor: u32, read_ahead: u32) -> bool {
        let window = PieceWindow::compute(anchor, read_ahead, self.total_pieces);

        if self
            .last_window
            .is_some_and(|previous| previous.same_range(&window))
        {
            trace!(anchor, read_ahead, "Read-ahead window unchanged");
            return false;
        }

        if let Some(previous) = self.last_window.take() {
            // Pieces still inside the new window are overwritten below.
            for piece in previous.pieces().filter(|piece| !window.contains(*piece)) {
                self.release_piece(piece);
            }
        }

        for assignment in window.assignments() {
            let index = PieceIndex::new(assignment.piece);
            self.engine.set_piece_priority(index, assignment.priority);
            self.engine
                .set_piece_deadline(index, Duration::from_millis(assignment.deadline_ms));
        }

        debug!(
            anchor = window.anchor,
            start = window.start_piece,
            end = window.end_piece,
            read_ahead,
            "Updated piece priorities"
        );
        self.last_window = Some(window);
        true
    }

    /// Returns every piece of the last window to the engine's defaults.
    pub fn release(&mut self) {
        let Some(previous) = self.last_window.take() else {
            return;
        };

        for piece in previous.pieces() {
            self.release_piece(piece);
        }
        debug!(
            start = previous.start_piece,
            end = previous.end_piece,
            "Released piece priorities"
        );
    }

    fn release_piece(&self, piece: u32) {
        if piece >= self.total_pieces {
            return;
        }
        let index = PieceIndex::new(piece);
        self.engine.set_piece_priority(index, PiecePriority::DEFAULT);
        self.engine.reset_piece_deadline(index);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use proptest::prelude::*;

    use super::*;
    use crate::streaming::test_engine::{EngineCall, RecordingEngine};
    use crate::torrent::TorrentLayout;

    const MIB: u32 = 1024 * 1024;

    fn create_scheduler(total_pieces: u32) -> (Arc<RecordingEngine>, PriorityScheduler) {
        let layout =
            TorrentLayout::single_file("movie.mp4", total_pieces as u64 * MIB as u64, MIB);
        let engine = Arc::new(RecordingEngine::new(Some(layout), PathBuf::from("/tmp")));
        let scheduler = PriorityScheduler::new(engine.clone(), total_pieces);
        (engine, scheduler)
    }

    #[test]
    fn test_read_ahead_for_zero_rate_is_minimum() {
        let config = StreamConfig::default();
        assert_eq!(read_ahead_pieces(0.0, MIB, &config), 10);
    }

    #[test]
    fn test_prediction_projects_two_seconds_ahead() {
        let config = StreamConfig::default();
        let geometry = PieceGeometry::new(MIB, 100, 0, 100 * MIB as u64);

        assert_eq!(predicted_piece(&geometry, 0, 0.0, &config), 0);
        assert_eq!(predicted_piece(&geometry, 5 * MIB as u64, 3.0 * MIB as f64, &config), 11);
        assert_eq!(predicted_piece(&geometry, 98 * MIB as u64, 4.0 * MIB as f64, &config), 99);
    }

    #[test]
    fn test_read_ahead_covers_ten_seconds() {
        let config = StreamConfig::default();
        // 2 MiB/s for 10 s over 1 MiB pieces
        assert_eq!(read_ahead_pieces(2.0 * MIB as f64, MIB, &config), 20);
    }

    #[test]
    fn test_read_ahead_handles_non_finite_rates() {
        let config = StreamConfig::default();
        assert_eq!(read_ahead_pieces(f64::NAN, MIB, &config), 10);
        assert_eq!(read_ahead_pieces(f64::INFINITY, MIB, &config), 30);
        assert_eq!(read_ahead_pieces(-5.0, MIB, &config), 10);
    }

    #[test]
    fn test_window_for_ten_piece_file() {
        let window = PieceWindow::compute(0, 10, 10);
        assert_eq!((window.start_piece, window.end_piece), (0, 9));

        let window = PieceWindow::compute(4, 10, 10);
        assert_eq!((window.start_piece, window.end_piece), (3, 9));
    }

    #[test]
    fn test_priority_decays_and_floors_at_normal() {
        let window = PieceWindow::compute(10, 30, 100);

        assert_eq!(window.priority_for(9), PiecePriority::TOP);
        assert_eq!(window.priority_for(10), PiecePriority::TOP);
        assert_eq!(window.priority_for(14), PiecePriority::TOP);
        assert_eq!(window.priority_for(15), PiecePriority::new(6));
        assert_eq!(window.priority_for(25), PiecePriority::NORMAL);
        assert_eq!(window.priority_for(40), PiecePriority::NORMAL);
    }

    #[test]
    fn test_deadline_grows_super_linearly() {
        let window = PieceWindow::compute(10, 30, 100);

        assert_eq!(window.deadline_for(9), Duration::ZERO);
        assert_eq!(window.deadline_for(10), Duration::ZERO);
        assert_eq!(window.deadline_for(11), Duration::from_millis(32));
        assert_eq!(window.deadline_for(12), Duration::from_millis(68));
        assert_eq!(window.deadline_for(20), Duration::from_millis(500));
    }

    #[test]
    fn test_unchanged_window_makes_no_engine_calls() {
        let (engine, mut scheduler) = create_scheduler(100);

        assert!(scheduler.update_priorities(20, 10));
        engine.take_calls();

        assert!(!scheduler.update_priorities(20, 10));
        assert!(engine.take_calls().is_empty());
    }

    #[test]
    fn test_moved_window_releases_pieces_left_behind() {
        let (engine, mut scheduler) = create_scheduler(100);

        scheduler.update_priorities(20, 10);
        engine.take_calls();
        scheduler.update_priorities(25, 10);

        let calls = engine.take_calls();
        for piece in 19..24 {
            assert!(calls.contains(&EngineCall::ResetDeadline(piece)));
            assert_eq!(engine.priority_of(piece), PiecePriority::DEFAULT);
        }
        assert!(!calls.contains(&EngineCall::ResetDeadline(24)));
        assert_eq!(engine.priority_of(25), PiecePriority::TOP);
        assert_eq!(engine.priority_of(35), PiecePriority::new(5));
    }

    #[test]
    fn test_initial_prioritization_is_released_by_first_window() {
        let (engine, mut scheduler) = create_scheduler(100);
        let geometry = PieceGeometry::new(MIB, 100, 0, 100 * MIB as u64);
        let config = StreamConfig::default();

        scheduler.prioritize_initial(&geometry, &config);
        assert_eq!(engine.priority_of(29), PiecePriority::TOP);
        assert!(
            engine
                .take_calls()
                .contains(&EngineCall::Deadline(3, Duration::from_millis(150)))
        );

        scheduler.update_priorities(0, 10);
        assert_eq!(engine.priority_of(29), PiecePriority::DEFAULT);
        assert_eq!(engine.priority_of(10), PiecePriority::new(5));
    }

    #[test]
    fn test_empty_file_gets_no_opening_burst() {
        let (engine, mut scheduler) = create_scheduler(4);
        let geometry = PieceGeometry::new(MIB, 4, 2 * MIB as u64, 0);

        scheduler.prioritize_initial(&geometry, &StreamConfig::default());

        assert!(engine.take_calls().is_empty());
        assert_eq!(scheduler.last_window(), None);
    }

    #[test]
    fn test_release_resets_last_window() {
        let (engine, mut scheduler) = create_scheduler(100);

        scheduler.update_priorities(50, 10);
        scheduler.release();

        for piece in 49..=60 {
            assert_eq!(engine.priority_of(piece), PiecePriority::DEFAULT);
        }
        assert!(scheduler.last_window().is_none());

        engine.take_calls();
        scheduler.release();
        assert!(engine.take_calls().is_empty());
    }

    proptest! {
        #[test]
        fn read_ahead_stays_within_bounds(rate in proptest::num::f64::ANY, piece_length in 1u32..=u32::MAX) {
            let config = StreamConfig::default();
            let count = read_ahead_pieces(rate, piece_length, &config);
            prop_assert!((10..=30).contains(&count));
        }

        #[test]
        fn window_stays_inside_torrent(anchor in 0u32..10_000, read_ahead in 10u32..=30, total in 1u32..5_000) {
            let window = PieceWindow::compute(anchor, read_ahead, total);
            prop_assert!(window.start_piece <= window.end_piece);
            prop_assert!(window.end_piece < total);
        }
    }
}
