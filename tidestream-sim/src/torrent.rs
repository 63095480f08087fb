//! In-process torrent engine backed by known content.
//!
//! Serves as the [`TorrentEngine`] a stream reads through. Pieces only become
//! present once their bytes have been written into the partial files, either
//! by hand via [`SimulatedTorrent::mark_piece_available`] or by a
//! [`SimulatedSwarm`](crate::SimulatedSwarm).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tidestream_core::torrent::{PieceIndex, PiecePriority, TorrentEngine, TorrentLayout};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::SimulationError;

const FINISHED_CHANNEL_CAPACITY: usize = 256;

/// Command received from a stream, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Sequential download was switched.
    Sequential(bool),
    /// Piece priority was set.
    Priority {
        /// Torrent-wide piece index.
        piece: u32,
        /// Priority level requested.
        priority: PiecePriority,
    },
    /// Piece deadline was set.
    Deadline {
        /// Torrent-wide piece index.
        piece: u32,
        /// Deadline relative to the call.
        deadline: Duration,
    },
    /// Piece deadline was cleared.
    ResetDeadline {
        /// Torrent-wide piece index.
        piece: u32,
    },
}

#[derive(Debug)]
struct EngineState {
    present: Vec<bool>,
    priorities: Vec<PiecePriority>,
    deadlines: Vec<Option<Instant>>,
    sequential: bool,
    commands: Vec<EngineCommand>,
}

/// Simulated torrent whose content is fully known up front.
pub struct SimulatedTorrent {
    layout: Option<TorrentLayout>,
    save_path: PathBuf,
    content: Bytes,
    state: Mutex<EngineState>,
    finished: broadcast::Sender<PieceIndex>,
}

impl SimulatedTorrent {
    /// Creates a single-file torrent and preallocates its partial file.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidSetup` - Zero piece length or empty content
    /// - `SimulationError::Io` - Partial file cannot be created
    pub async fn single_file(
        name: impl Into<PathBuf>,
        content: Bytes,
        piece_length: u32,
        save_path: &Path,
    ) -> Result<Self, SimulationError> {
        Self::from_files(vec![(name.into(), content)], piece_length, save_path).await
    }

    /// Creates a single-file torrent from the contents of `source`.
    ///
    /// # Errors
    ///
    /// - `SimulationError::Io` - Source cannot be read or partial file cannot be created
    /// - `SimulationError::InvalidSetup` - Zero piece length or empty source
    pub async fn from_source_file(
        source: &Path,
        piece_length: u32,
        save_path: &Path,
    ) -> Result<Self, SimulationError> {
        let content = tokio::fs::read(source)
            .await
            .map_err(|source_error| SimulationError::Io {
                path: source.to_path_buf(),
                source: source_error,
            })?;
        let name = source
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("content.bin"));

        Self::single_file(name, Bytes::from(content), piece_length, save_path).await
    }

    /// Creates a torrent whose files are laid out back to back in the given order.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidSetup` - Zero piece length or no content at all
    /// - `SimulationError::Io` - A partial file cannot be created
    pub async fn from_files(
        files: Vec<(PathBuf, Bytes)>,
        piece_length: u32,
        save_path: &Path,
    ) -> Result<Self, SimulationError> {
        let total: usize = files.iter().map(|(_, data)| data.len()).sum();
        if piece_length == 0 || total == 0 {
            return Err(SimulationError::InvalidSetup {
                reason: format!("piece length {piece_length} with {total} content bytes"),
            });
        }

        let layout = TorrentLayout::from_files(
            files
                .iter()
                .map(|(path, data)| (path.clone(), data.len() as u64))
                .collect(),
            piece_length,
        );

        for entry in &layout.files {
            preallocate(&save_path.join(&entry.path), entry.length).await?;
        }

        let mut content = Vec::with_capacity(total);
        for (_, data) in &files {
            content.extend_from_slice(data);
        }

        debug!(
            files = layout.files.len(),
            pieces = layout.total_pieces,
            piece_length,
            save_path = %save_path.display(),
            "Created simulated torrent"
        );

        Ok(Self::with_layout(
            Some(layout),
            save_path.to_path_buf(),
            Bytes::from(content),
        ))
    }

    /// Creates an engine that never resolves its metadata.
    pub fn without_metadata(save_path: &Path) -> Self {
        Self::with_layout(None, save_path.to_path_buf(), Bytes::new())
    }

    fn with_layout(layout: Option<TorrentLayout>, save_path: PathBuf, content: Bytes) -> Self {
        let pieces = layout
            .as_ref()
            .map(|layout| layout.total_pieces as usize)
            .unwrap_or(0);
        let (finished, _) = broadcast::channel(FINISHED_CHANNEL_CAPACITY);

        Self {
            layout,
            save_path,
            content,
            state: Mutex::new(EngineState {
                present: vec![false; pieces],
                priorities: vec![PiecePriority::DEFAULT; pieces],
                deadlines: vec![None; pieces],
                sequential: false,
                commands: Vec::new(),
            }),
            finished,
        }
    }

    /// Total number of pieces, zero without metadata.
    pub fn total_pieces(&self) -> u32 {
        self.layout
            .as_ref()
            .map(|layout| layout.total_pieces)
            .unwrap_or(0)
    }

    /// Complete content of the torrent, all files concatenated.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Bytes covered by `piece`; the last piece may be short.
    pub fn piece_size(&self, piece: u32) -> u64 {
        let Some(layout) = &self.layout else {
            return 0;
        };
        let start = piece as u64 * layout.piece_length as u64;
        let end = (start + layout.piece_length as u64).min(layout.total_size());
        end.saturating_sub(start)
    }

    /// Writes `piece` into the partial files, marks it present and announces it.
    ///
    /// Marking an already present piece does nothing.
    ///
    /// # Errors
    ///
    /// - `SimulationError::MetadataUnavailable` - Engine has no layout
    /// - `SimulationError::PieceOutOfRange` - `piece` is not a piece of the torrent
    /// - `SimulationError::Io` - Partial file write failed
    pub async fn mark_piece_available(&self, piece: u32) -> Result<(), SimulationError> {
        let layout = self
            .layout
            .as_ref()
            .ok_or(SimulationError::MetadataUnavailable)?;
        if piece >= layout.total_pieces {
            return Err(SimulationError::PieceOutOfRange {
                piece,
                total_pieces: layout.total_pieces,
            });
        }
        let already_present = self.state.lock().present[piece as usize];
        if already_present {
            return Ok(());
        }

        let piece_start = piece as u64 * layout.piece_length as u64;
        let piece_end = piece_start + self.piece_size(piece);
        for entry in &layout.files {
            let start = piece_start.max(entry.offset);
            let end = piece_end.min(entry.offset + entry.length);
            if start >= end {
                continue;
            }

            let path = self.save_path.join(&entry.path);
            let data = &self.content[start as usize..end as usize];
            write_at(&path, start - entry.offset, data).await?;
        }

        self.state.lock().present[piece as usize] = true;
        // Nobody listening is fine.
        let _ = self.finished.send(PieceIndex::new(piece));
        trace!(piece, "Simulated piece completed");
        Ok(())
    }

    /// Makes every missing piece available.
    ///
    /// # Errors
    ///
    /// - `SimulationError::MetadataUnavailable` - Engine has no layout
    /// - `SimulationError::Io` - Partial file write failed
    pub async fn complete_all(&self) -> Result<(), SimulationError> {
        if self.layout.is_none() {
            return Err(SimulationError::MetadataUnavailable);
        }
        for piece in 0..self.total_pieces() {
            self.mark_piece_available(piece).await?;
        }
        Ok(())
    }

    /// Number of pieces present on disk.
    pub fn present_count(&self) -> u32 {
        self.state.lock().present.iter().filter(|&&present| present).count() as u32
    }

    /// Returns true once every piece is present.
    pub fn is_complete(&self) -> bool {
        self.state.lock().present.iter().all(|&present| present)
    }

    /// Current priority of `piece`.
    pub fn priority(&self, piece: u32) -> PiecePriority {
        self.state
            .lock()
            .priorities
            .get(piece as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Returns true if `piece` has an active deadline.
    pub fn has_deadline(&self, piece: u32) -> bool {
        self.state
            .lock()
            .deadlines
            .get(piece as usize)
            .is_some_and(Option::is_some)
    }

    /// Returns true if sequential download is on.
    pub fn is_sequential(&self) -> bool {
        self.state.lock().sequential
    }

    /// Commands received so far, oldest first.
    pub fn commands(&self) -> Vec<EngineCommand> {
        self.state.lock().commands.clone()
    }

    /// Drains the recorded commands.
    pub fn take_commands(&self) -> Vec<EngineCommand> {
        std::mem::take(&mut self.state.lock().commands)
    }

    /// Picks the next missing piece to download, if any is wanted.
    ///
    /// Pieces at `DONT_DOWNLOAD` are skipped. In sequential mode the choice is
    /// the highest priority, then the earliest deadline, then the lowest
    /// index. Otherwise a random piece of the highest priority is chosen.
    pub fn next_wanted_piece(&self, rng: &mut ChaCha8Rng) -> Option<u32> {
        let state = self.state.lock();
        let wanted = |piece: &usize| {
            !state.present[*piece] && state.priorities[*piece] > PiecePriority::DONT_DOWNLOAD
        };

        if state.sequential {
            return (0..state.present.len())
                .filter(wanted)
                .min_by_key(|&piece| {
                    (
                        std::cmp::Reverse(state.priorities[piece]),
                        state.deadlines[piece].is_none(),
                        state.deadlines[piece],
                        piece,
                    )
                })
                .map(|piece| piece as u32);
        }

        let top = (0..state.present.len())
            .filter(wanted)
            .map(|piece| state.priorities[piece])
            .max()?;
        let candidates: Vec<usize> = (0..state.present.len())
            .filter(wanted)
            .filter(|&piece| state.priorities[piece] == top)
            .collect();
        let choice = candidates[rng.random_range(0..candidates.len())];
        Some(choice as u32)
    }

    fn record(&self, state: &mut EngineState, command: EngineCommand) {
        trace!(?command, "Engine command");
        state.commands.push(command);
    }
}

impl TorrentEngine for SimulatedTorrent {
    fn layout(&self) -> Option<TorrentLayout> {
        self.layout.clone()
    }

    fn save_path(&self) -> PathBuf {
        self.save_path.clone()
    }

    fn has_piece(&self, index: PieceIndex) -> bool {
        self.state
            .lock()
            .present
            .get(index.as_u32() as usize)
            .copied()
            .unwrap_or(false)
    }

    fn set_sequential_download(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.sequential = enabled;
        self.record(&mut state, EngineCommand::Sequential(enabled));
    }

    fn set_piece_priority(&self, index: PieceIndex, priority: PiecePriority) {
        let mut state = self.state.lock();
        let piece = index.as_u32();
        if let Some(slot) = state.priorities.get_mut(piece as usize) {
            *slot = priority;
        }
        self.record(&mut state, EngineCommand::Priority { piece, priority });
    }

    fn set_piece_deadline(&self, index: PieceIndex, deadline: Duration) {
        let mut state = self.state.lock();
        let piece = index.as_u32();
        if let Some(slot) = state.deadlines.get_mut(piece as usize) {
            *slot = Some(Instant::now() + deadline);
        }
        self.record(&mut state, EngineCommand::Deadline { piece, deadline });
    }

    fn reset_piece_deadline(&self, index: PieceIndex) {
        let mut state = self.state.lock();
        let piece = index.as_u32();
        if let Some(slot) = state.deadlines.get_mut(piece as usize) {
            *slot = None;
        }
        self.record(&mut state, EngineCommand::ResetDeadline { piece });
    }

    fn subscribe_piece_finished(&self) -> Option<broadcast::Receiver<PieceIndex>> {
        Some(self.finished.subscribe())
    }
}

async fn preallocate(path: &Path, length: u64) -> Result<(), SimulationError> {
    let io_error = |source| SimulationError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    let file = tokio::fs::File::create(path).await.map_err(io_error)?;
    file.set_len(length).await.map_err(io_error)
}

async fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<(), SimulationError> {
    let io_error = |source| SimulationError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(io_error)?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(io_error)?;
    file.write_all(data).await.map_err(io_error)?;
    file.flush().await.map_err(io_error)
}
