//! Boundary to the external torrent engine.
//!
//! The streaming reader never talks to peers or trackers itself. It queries
//! piece availability and sends priority hints through [`TorrentEngine`].

pub mod engine;

use std::fmt;

pub use engine::{FileEntry, TorrentEngine, TorrentLayout};

/// Zero-based index of a piece within a torrent.
///
/// Torrent content is divided into fixed-size pieces for transfer and
/// availability tracking. Indices are torrent-wide, not per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Download priority hint for a single piece.
///
/// Uses the engine's 0..=7 scale where 4 is the neutral default and 7 is the
/// most urgent level. Values above 7 are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct PiecePriority(u8);

impl PiecePriority {
    /// Piece is not downloaded at all.
    pub const DONT_DOWNLOAD: Self = Self(0);
    /// Background priority.
    pub const LOW: Self = Self(1);
    /// Neutral priority the engine assigns to every piece.
    pub const DEFAULT: Self = Self(4);
    /// Floor for pieces inside the read-ahead window.
    pub const NORMAL: Self = Self::DEFAULT;
    /// Most urgent priority.
    pub const TOP: Self = Self(7);

    /// Creates a priority, clamping to [`PiecePriority::TOP`].
    pub fn new(level: u8) -> Self {
        Self(level.min(Self::TOP.0))
    }

    /// Returns the raw engine level.
    pub fn level(self) -> u8 {
        self.0
    }
}

impl Default for PiecePriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for PiecePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.to_string(), "10");
    }

    #[test]
    fn test_priority_scale() {
        assert!(PiecePriority::TOP > PiecePriority::NORMAL);
        assert!(PiecePriority::NORMAL > PiecePriority::LOW);
        assert_eq!(PiecePriority::NORMAL, PiecePriority::DEFAULT);
        assert_eq!(PiecePriority::default().level(), 4);
    }

    #[test]
    fn test_priority_clamps_to_top() {
        assert_eq!(PiecePriority::new(200), PiecePriority::TOP);
        assert_eq!(PiecePriority::new(5).level(), 5);
    }
}
