//! Mapping between file byte offsets and torrent pieces.

use super::StreamError;
use crate::torrent::TorrentLayout;

/// Piece geometry of one file inside a torrent.
///
/// Offsets passed in are relative to the start of the file; piece indices are
/// torrent-wide. For a single-file torrent the file starts at torrent offset 0
/// and `piece_of(offset)` is simply `offset / piece_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceGeometry {
    piece_length: u32,
    total_pieces: u32,
    file_offset: u64,
    file_length: u64,
}

impl PieceGeometry {
    /// Creates geometry from raw values.
    pub fn new(piece_length: u32, total_pieces: u32, file_offset: u64, file_length: u64) -> Self {
        Self {
            piece_length,
            total_pieces,
            file_offset,
            file_length,
        }
    }

    /// Resolves the geometry of `file_index` within `layout`.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidArgument` - Layout has a zero piece length or no pieces
    /// - `StreamError::FileIndexOutOfRange` - `file_index` is not in `[0, num_files)`
    pub fn for_file(layout: &TorrentLayout, file_index: usize) -> Result<Self, StreamError> {
        if layout.piece_length == 0 || layout.total_pieces == 0 {
            return Err(StreamError::InvalidArgument {
                reason: format!(
                    "torrent layout has piece length {} and {} pieces",
                    layout.piece_length, layout.total_pieces
                ),
            });
        }

        let file = layout
            .files
            .get(file_index)
            .ok_or(StreamError::FileIndexOutOfRange {
                index: file_index,
                file_count: layout.files.len(),
            })?;

        Ok(Self::new(
            layout.piece_length,
            layout.total_pieces,
            file.offset,
            file.length,
        ))
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_pieces(&self) -> u32 {
        self.total_pieces
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Returns the piece holding the byte at `offset` within the file.
    pub fn piece_of(&self, offset: u64) -> u32 {
        let absolute = self.file_offset.saturating_add(offset);
        (absolute / self.piece_length as u64).min(u32::MAX as u64) as u32
    }

    /// First piece overlapping the file.
    pub fn first_piece(&self) -> u32 {
        self.piece_of(0)
    }

    /// Last piece overlapping the file.
    pub fn last_piece(&self) -> u32 {
        self.piece_of(self.file_length.saturating_sub(1))
    }

    /// Number of pieces overlapping the file.
    pub fn file_piece_count(&self) -> u32 {
        self.last_piece() - self.first_piece() + 1
    }

    /// File-relative offset one past the last byte of `piece`, capped at the file length.
    pub fn piece_end(&self, piece: u32) -> u64 {
        let absolute_end = (piece as u64 + 1) * self.piece_length as u64;
        absolute_end
            .saturating_sub(self.file_offset)
            .min(self.file_length)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use proptest::prelude::*;

    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_single_file_mapping() {
        let layout = TorrentLayout::single_file("movie.mp4", 10 * MIB, MIB as u32);
        let geometry = PieceGeometry::for_file(&layout, 0).unwrap();

        assert_eq!(geometry.piece_of(0), 0);
        assert_eq!(geometry.piece_of(MIB - 1), 0);
        assert_eq!(geometry.piece_of(MIB), 1);
        assert_eq!(geometry.first_piece(), 0);
        assert_eq!(geometry.last_piece(), 9);
        assert_eq!(geometry.file_piece_count(), 10);
    }

    #[test]
    fn test_second_file_maps_through_torrent_offset() {
        let layout = TorrentLayout::from_files(
            vec![
                (PathBuf::from("sample.txt"), 1500),
                (PathBuf::from("movie.mp4"), 4000),
            ],
            1024,
        );
        let geometry = PieceGeometry::for_file(&layout, 1).unwrap();

        assert_eq!(geometry.first_piece(), 1);
        assert_eq!(geometry.piece_of(547), 1);
        assert_eq!(geometry.piece_of(548), 2);
        assert_eq!(geometry.last_piece(), 5);
        assert_eq!(geometry.piece_end(1), 548);
        assert_eq!(geometry.piece_end(5), 4000);
    }

    #[test]
    fn test_file_index_out_of_range() {
        let layout = TorrentLayout::single_file("movie.mp4", 100, 16);

        let result = PieceGeometry::for_file(&layout, 1);
        assert!(matches!(
            result,
            Err(StreamError::FileIndexOutOfRange {
                index: 1,
                file_count: 1
            })
        ));
    }

    #[test]
    fn test_degenerate_layout_is_rejected() {
        let layout = TorrentLayout::single_file("empty.bin", 100, 0);

        assert!(matches!(
            PieceGeometry::for_file(&layout, 0),
            Err(StreamError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_empty_file_has_single_piece_span() {
        let geometry = PieceGeometry::new(1024, 4, 2048, 0);

        assert_eq!(geometry.first_piece(), geometry.last_piece());
        assert_eq!(geometry.piece_end(2), 0);
    }

    proptest! {
        #[test]
        fn piece_bounds_contain_offset(
            piece_length in 1u32..=65_536,
            file_offset in 0u64..1_000_000,
            file_length in 1u64..10_000_000,
            fraction in 0.0f64..1.0,
        ) {
            let total = (file_offset + file_length).div_ceil(piece_length as u64) as u32;
            let geometry = PieceGeometry::new(piece_length, total, file_offset, file_length);
            let offset = ((file_length - 1) as f64 * fraction) as u64;
            let piece = geometry.piece_of(offset);

            prop_assert!(piece >= geometry.first_piece());
            prop_assert!(piece <= geometry.last_piece());
            prop_assert!(piece < total);
            prop_assert!(offset < geometry.piece_end(piece));
        }
    }
}
