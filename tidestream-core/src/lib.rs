//! Tidestream Core - Streaming reads over partially downloaded torrent files
//!
//! This crate turns a file that a BitTorrent engine is still downloading into a
//! seekable byte stream. Pieces arrive out of order; the reader prioritizes a
//! sliding window ahead of the read position, waits for contiguous data with a
//! bounded timeout, and serves bytes from a refillable buffer.

pub mod config;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{SimulationConfig, StreamConfig, TidestreamConfig};
pub use streaming::{StreamError, StreamEvent, StreamPhase, TorrentStream};
pub use torrent::{PieceIndex, PiecePriority, TorrentEngine, TorrentLayout};

/// Top-level errors surfaced by Tidestream subsystems.
#[derive(Debug, thiserror::Error)]
pub enum TidestreamError {
    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidestreamError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TidestreamError::Streaming(e) => match e {
                StreamError::MetadataUnavailable => {
                    "Torrent metadata has not been received yet".to_string()
                }
                StreamError::FileIndexOutOfRange { index, file_count } => {
                    format!("File {index} does not exist (torrent has {file_count} files)")
                }
                StreamError::FileOpen { path, .. } => {
                    format!("Could not open partial file {}", path.display())
                }
                StreamError::InvalidArgument { reason } => format!("Invalid argument: {reason}"),
                StreamError::SeekOutOfRange { target, length } => {
                    format!("Cannot seek to byte {target} of a {length} byte stream")
                }
                StreamError::ObjectDisposed => "Stream has already been closed".to_string(),
                _ => "Streaming error occurred".to_string(),
            },
            TidestreamError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            TidestreamError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TidestreamError::Configuration { .. }
                | TidestreamError::Streaming(StreamError::InvalidArgument { .. })
                | TidestreamError::Streaming(StreamError::FileIndexOutOfRange { .. })
                | TidestreamError::Streaming(StreamError::SeekOutOfRange { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, TidestreamError>;
