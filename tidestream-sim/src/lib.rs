//! Tidestream simulation - an in-process torrent engine for exercising streams.

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]
//!
//! [`SimulatedTorrent`] implements the engine interface a
//! [`TorrentStream`](tidestream_core::TorrentStream) consumes, over content
//! that is known up front. Pieces become readable only once written into the
//! partial file, so a stream sees the same partially downloaded file it would
//! see behind a real client.
//!
//! [`SimulatedSwarm`] fills the partial file at a fixed byte rate, choosing
//! pieces by the priorities and deadlines the stream sets.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use tidestream_core::{SimulationConfig, StreamConfig, TorrentStream};
//! use tidestream_sim::{SimulatedSwarm, SimulatedTorrent};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let content = Bytes::from(vec![0u8; 4 * 1024 * 1024]);
//! let torrent = Arc::new(
//!     SimulatedTorrent::single_file("movie.mp4", content, 262_144, Path::new("/tmp/demo")).await?,
//! );
//! let swarm = SimulatedSwarm::new(torrent.clone(), &SimulationConfig::default())?.spawn();
//!
//! let stream = TorrentStream::open(torrent, 0, StreamConfig::default()).await?;
//! let mut buf = vec![0u8; 65_536];
//! while stream.read(&mut buf).await? > 0 {}
//! stream.close().await;
//! swarm.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod swarm;
pub mod torrent;

use std::path::PathBuf;

pub use swarm::{SimulatedSwarm, SwarmHandle, SwarmReport};
pub use torrent::{EngineCommand, SimulatedTorrent};

/// Errors raised while setting up or driving a simulated torrent.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// Simulation parameters cannot describe a torrent or swarm
    #[error("Invalid simulation setup: {reason}")]
    InvalidSetup {
        /// What was wrong with the setup
        reason: String,
    },

    /// Engine was created without metadata
    #[error("Torrent metadata is not available")]
    MetadataUnavailable,

    /// Piece index is past the end of the torrent
    #[error("Piece {piece} out of range for torrent with {total_pieces} pieces")]
    PieceOutOfRange {
        /// Requested piece
        piece: u32,
        /// Number of pieces in the torrent
        total_pieces: u32,
    },

    /// Source or partial file I/O failed
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Background swarm task did not complete
    #[error("Swarm task failed: {reason}")]
    TaskFailed {
        /// Join error description
        reason: String,
    },
}
