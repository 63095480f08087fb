//! Sequential streaming over pieces that are still arriving.
//!
//! [`TorrentStream`] is the public reader. It maps its position to pieces with
//! [`PieceGeometry`], keeps a window of pieces ahead of the reader prioritized
//! through [`PriorityScheduler`], waits on [`AvailabilityGate`] before refilling
//! its buffer from the partial file, and feeds throughput back into
//! [`RateEstimator`] to size the next window and refill.

pub mod gate;
pub mod geometry;
pub mod rate;
pub mod reader;
pub mod scheduler;

use std::path::PathBuf;

use thiserror::Error;

pub use gate::{Availability, AvailabilityGate};
pub use geometry::PieceGeometry;
pub use rate::RateEstimator;
pub use reader::TorrentStream;
pub use scheduler::{
    PieceAssignment, PieceWindow, PriorityScheduler, predicted_piece, read_ahead_pieces,
};

/// Notifications a stream publishes to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// A read had to wait for pieces; sent once per stall.
    BufferingStarted,
    /// The stall ended with data available.
    BufferingCompleted,
    /// A read produced no bytes before its timeout.
    ReadTimeout,
}

/// Observable lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Open and able to serve reads.
    Ready,
    /// A read is waiting for pieces to arrive.
    Buffering,
    /// The position has reached the end of the file.
    EndOfStream,
    /// Closed; every further call fails.
    Disposed,
}

/// Errors returned by stream construction and stream operations.
///
/// Read timeouts are not errors: a read that times out returns zero bytes and
/// publishes [`StreamEvent::ReadTimeout`]. Transient disk read failures are
/// retried internally and never surface here.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A caller-supplied argument or the torrent metadata is unusable.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The requested file does not exist in the torrent.
    #[error("File index {index} out of range: torrent has {file_count} files")]
    FileIndexOutOfRange {
        /// Requested file index.
        index: usize,
        /// Number of files in the torrent.
        file_count: usize,
    },

    /// A seek resolved to a position outside the file.
    #[error("Seek target {target} outside stream of length {length}")]
    SeekOutOfRange {
        /// Resolved absolute target position.
        target: i128,
        /// Stream length in bytes.
        length: u64,
    },

    /// The engine has not received the torrent's metadata yet.
    #[error("Torrent metadata is not available yet")]
    MetadataUnavailable,

    /// The stream is a read-only view of in-flight download data.
    #[error("Operation not supported: {operation}")]
    Unsupported { operation: &'static str },

    /// The stream has been closed.
    #[error("Stream has been closed")]
    ObjectDisposed,

    /// The partial file could not be opened when the stream was created.
    #[error("Failed to open partial file {}", path.display())]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
pub(crate) mod test_engine {
    //! Recording in-memory engine shared by the streaming unit tests.

    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::torrent::{PieceIndex, PiecePriority, TorrentEngine, TorrentLayout};

    /// Engine command observed by [`RecordingEngine`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EngineCall {
        Sequential(bool),
        Priority(u32, PiecePriority),
        Deadline(u32, Duration),
        ResetDeadline(u32),
    }

    pub struct RecordingEngine {
        pub layout: Option<TorrentLayout>,
        pub save_path: PathBuf,
        pub present: Mutex<HashSet<u32>>,
        pub calls: Mutex<Vec<EngineCall>>,
        pub priorities: Mutex<HashMap<u32, PiecePriority>>,
    }

    impl RecordingEngine {
        pub fn new(layout: Option<TorrentLayout>, save_path: PathBuf) -> Self {
            Self {
                layout,
                save_path,
                present: Mutex::new(HashSet::new()),
                calls: Mutex::new(Vec::new()),
                priorities: Mutex::new(HashMap::new()),
            }
        }

        pub fn mark_present(&self, pieces: impl IntoIterator<Item = u32>) {
            self.present.lock().extend(pieces);
        }

        pub fn take_calls(&self) -> Vec<EngineCall> {
            std::mem::take(&mut *self.calls.lock())
        }

        pub fn priority_of(&self, piece: u32) -> PiecePriority {
            self.priorities
                .lock()
                .get(&piece)
                .copied()
                .unwrap_or_default()
        }
    }

    impl TorrentEngine for RecordingEngine {
        fn layout(&self) -> Option<TorrentLayout> {
            self.layout.clone()
        }

        fn save_path(&self) -> PathBuf {
            self.save_path.clone()
        }

        fn has_piece(&self, index: PieceIndex) -> bool {
            self.present.lock().contains(&index.as_u32())
        }

        fn set_sequential_download(&self, enabled: bool) {
            self.calls.lock().push(EngineCall::Sequential(enabled));
        }

        fn set_piece_priority(&self, index: PieceIndex, priority: PiecePriority) {
            self.priorities.lock().insert(index.as_u32(), priority);
            self.calls
                .lock()
                .push(EngineCall::Priority(index.as_u32(), priority));
        }

        fn set_piece_deadline(&self, index: PieceIndex, deadline: Duration) {
            self.calls
                .lock()
                .push(EngineCall::Deadline(index.as_u32(), deadline));
        }

        fn reset_piece_deadline(&self, index: PieceIndex) {
            self.calls
                .lock()
                .push(EngineCall::ResetDeadline(index.as_u32()));
        }
    }
}
