//! Capability interface of the torrent engine consumed by streams.
//!
//! Piece priorities and deadlines are engine-global state that other consumers
//! of the same torrent may also touch. Streams only ever set them.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;

use super::{PieceIndex, PiecePriority};

/// One file inside a torrent, positioned in the torrent's byte space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the engine's save path
    pub path: PathBuf,
    /// Byte offset of the file's first byte within the whole torrent
    pub offset: u64,
    /// File size in bytes
    pub length: u64,
}

/// Piece and file layout of a torrent whose metadata is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentLayout {
    pub piece_length: u32,
    pub total_pieces: u32,
    pub files: Vec<FileEntry>,
}

impl TorrentLayout {
    /// Builds the layout of a torrent holding a single file.
    pub fn single_file(path: impl Into<PathBuf>, length: u64, piece_length: u32) -> Self {
        Self::from_files(vec![(path.into(), length)], piece_length)
    }

    /// Builds a layout by laying files out back to back.
    pub fn from_files(files: Vec<(PathBuf, u64)>, piece_length: u32) -> Self {
        let mut offset = 0u64;
        let files: Vec<FileEntry> = files
            .into_iter()
            .map(|(path, length)| {
                let entry = FileEntry {
                    path,
                    offset,
                    length,
                };
                offset += length;
                entry
            })
            .collect();

        let total_pieces = if piece_length == 0 {
            0
        } else {
            offset.div_ceil(piece_length as u64) as u32
        };

        Self {
            piece_length,
            total_pieces,
            files,
        }
    }

    /// Returns the size of all files combined.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }
}

/// Narrow view of a torrent engine handle.
///
/// Implementations wrap a real engine session or a simulation. All calls are
/// cheap, non-blocking queries or hints.
pub trait TorrentEngine: Send + Sync {
    /// Returns the torrent layout, or `None` while metadata is still missing.
    fn layout(&self) -> Option<TorrentLayout>;

    /// Directory the torrent's files are written into.
    fn save_path(&self) -> PathBuf;

    /// Checks whether a piece is downloaded and verified.
    fn has_piece(&self, index: PieceIndex) -> bool;

    /// Switches between in-order and rarest-first piece picking.
    fn set_sequential_download(&self, enabled: bool);

    /// Sets the download priority of one piece.
    fn set_piece_priority(&self, index: PieceIndex, priority: PiecePriority);

    /// Asks the engine to complete a piece within `deadline` from now.
    fn set_piece_deadline(&self, index: PieceIndex, deadline: Duration);

    /// Removes a previously set deadline.
    fn reset_piece_deadline(&self, index: PieceIndex);

    /// Subscribes to piece completion notifications, if the engine has them.
    ///
    /// Streams fall back to polling when this returns `None`.
    fn subscribe_piece_finished(&self) -> Option<broadcast::Receiver<PieceIndex>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_file_layout_rounds_piece_count_up() {
        let layout = TorrentLayout::single_file("movie.mkv", 10 * 1024 + 1, 1024);

        assert_eq!(layout.total_pieces, 11);
        assert_eq!(layout.files.len(), 1);
        assert_eq!(layout.files[0].offset, 0);
        assert_eq!(layout.total_size(), 10 * 1024 + 1);
    }

    #[test]
    fn test_multi_file_layout_offsets() {
        let layout = TorrentLayout::from_files(
            vec![
                (PathBuf::from("a.nfo"), 100),
                (PathBuf::from("b.mp4"), 5000),
            ],
            1024,
        );

        assert_eq!(layout.files[1].offset, 100);
        assert_eq!(layout.total_pieces, 5);
    }
}
