//! Seekable read-only stream over a torrent file that is still downloading.
//!
//! A read that misses the buffer moves the prioritized window, waits on the
//! availability gate, and refills from the partial file on disk. Only bytes of
//! pieces the engine reports as present are ever copied out.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{
    Availability, AvailabilityGate, PieceGeometry, PriorityScheduler, RateEstimator, StreamError,
    StreamEvent, StreamPhase, predicted_piece, read_ahead_pieces,
};
use crate::config::StreamConfig;
use crate::torrent::{PieceIndex, TorrentEngine};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Read-only, seekable view of one file of a torrent being downloaded.
///
/// All operations are serialized behind one lock; a stream is meant for a
/// single consumer. Reads block up to the configured read timeout and return
/// zero bytes (plus a [`StreamEvent::ReadTimeout`]) when nothing arrived.
///
/// Call [`close`](Self::close) when done. Dropping an open stream releases
/// the same resources.
pub struct TorrentStream {
    inner: Mutex<StreamInner>,
    signals: StreamSignals,
    length: u64,
    path: PathBuf,
}

struct StreamSignals {
    events: broadcast::Sender<StreamEvent>,
    phase: watch::Sender<StreamPhase>,
}

impl StreamSignals {
    fn publish(&self, event: StreamEvent) {
        // Having no subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn set_phase(&self, phase: StreamPhase) {
        self.phase.send_replace(phase);
    }

    fn buffering_started(&self) {
        debug!("Buffering started");
        self.set_phase(StreamPhase::Buffering);
        self.publish(StreamEvent::BufferingStarted);
    }

    fn buffering_completed(&self) {
        debug!("Buffering completed");
        self.set_phase(StreamPhase::Ready);
        self.publish(StreamEvent::BufferingCompleted);
    }
}

/// Closes a stall episode left open by a read future dropped mid-wait.
struct StallEpisodeGuard<'a> {
    signals: &'a StreamSignals,
}

impl Drop for StallEpisodeGuard<'_> {
    fn drop(&mut self) {
        if *self.signals.phase.borrow() == StreamPhase::Buffering {
            debug!("Read cancelled while buffering");
            self.signals.buffering_completed();
        }
    }
}

struct StreamInner {
    engine: Arc<dyn TorrentEngine>,
    config: StreamConfig,
    geometry: PieceGeometry,
    file: Option<File>,
    buffer: Vec<u8>,
    buffer_start: u64,
    buffer_length: usize,
    position: u64,
    rate: RateEstimator,
    scheduler: PriorityScheduler,
    gate: AvailabilityGate,
    disposed: bool,
}

impl TorrentStream {
    /// Opens file `file_index` of the torrent behind `engine` for streaming.
    ///
    /// Switches the torrent to sequential download and prioritizes the
    /// opening pieces of the file.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidArgument` - Config fails validation or layout is degenerate
    /// - `StreamError::MetadataUnavailable` - Engine has no metadata for the torrent yet
    /// - `StreamError::FileIndexOutOfRange` - No file with that index
    /// - `StreamError::FileOpen` - Partial file cannot be opened
    pub async fn open(
        engine: Arc<dyn TorrentEngine>,
        file_index: usize,
        config: StreamConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;

        let layout = engine.layout().ok_or(StreamError::MetadataUnavailable)?;
        let geometry = PieceGeometry::for_file(&layout, file_index)?;
        let path = engine.save_path().join(&layout.files[file_index].path);
        let file = File::open(&path)
            .await
            .map_err(|source| StreamError::FileOpen {
                path: path.clone(),
                source,
            })?;

        engine.set_sequential_download(true);
        let mut scheduler = PriorityScheduler::new(engine.clone(), geometry.total_pieces());
        scheduler.prioritize_initial(&geometry, &config);
        let gate = AvailabilityGate::new(
            engine.clone(),
            config.min_contiguous_pieces,
            config.poll_interval,
            geometry.last_piece(),
        );

        info!(
            path = %path.display(),
            length = geometry.file_length(),
            piece_length = geometry.piece_length(),
            first_piece = geometry.first_piece(),
            last_piece = geometry.last_piece(),
            "Opened torrent stream"
        );

        let length = geometry.file_length();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (phase, _) = watch::channel(if length == 0 {
            StreamPhase::EndOfStream
        } else {
            StreamPhase::Ready
        });

        let inner = StreamInner {
            engine,
            rate: RateEstimator::new(config.rate_smoothing, Instant::now()),
            config,
            geometry,
            file: Some(file),
            buffer: Vec::new(),
            buffer_start: 0,
            buffer_length: 0,
            position: 0,
            scheduler,
            gate,
            disposed: false,
        };

        Ok(Self {
            inner: Mutex::new(inner),
            signals: StreamSignals { events, phase },
            length,
            path,
        })
    }

    /// Subscribes to buffering and timeout notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.signals.events.subscribe()
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> StreamPhase {
        *self.signals.phase.borrow()
    }

    /// Watches lifecycle phase changes.
    pub fn watch_state(&self) -> watch::Receiver<StreamPhase> {
        self.signals.phase.subscribe()
    }

    /// Location of the partial file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File length in bytes.
    ///
    /// # Errors
    ///
    /// - `StreamError::ObjectDisposed` - Stream has been closed
    pub fn length(&self) -> Result<u64, StreamError> {
        if self.state() == StreamPhase::Disposed {
            return Err(StreamError::ObjectDisposed);
        }
        Ok(self.length)
    }

    /// Current read position.
    ///
    /// # Errors
    ///
    /// - `StreamError::ObjectDisposed` - Stream has been closed
    pub async fn position(&self) -> Result<u64, StreamError> {
        let inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(inner.position)
    }

    /// Moves the read position to an absolute offset.
    ///
    /// # Errors
    ///
    /// - `StreamError::SeekOutOfRange` - `position` is past the end of the file
    /// - `StreamError::ObjectDisposed` - Stream has been closed
    pub async fn set_position(&self, position: u64) -> Result<u64, StreamError> {
        self.seek(SeekFrom::Start(position)).await
    }

    /// Moves the read position and returns the new absolute position.
    ///
    /// Does not touch the buffer or the engine; the next read refills if the
    /// new position falls outside the cached region.
    ///
    /// # Errors
    ///
    /// - `StreamError::SeekOutOfRange` - Target is negative or past the end of the file
    /// - `StreamError::ObjectDisposed` - Stream has been closed
    pub async fn seek(&self, target: SeekFrom) -> Result<u64, StreamError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        let position = inner.seek(target)?;
        self.signals.set_phase(if position >= self.length {
            StreamPhase::EndOfStream
        } else {
            StreamPhase::Ready
        });
        Ok(position)
    }

    /// Reads up to `buf.len()` bytes at the current position.
    ///
    /// Returns 0 at end of file, or when no data arrived within the read
    /// timeout; the latter also publishes [`StreamEvent::ReadTimeout`].
    ///
    /// Cancel safe: dropping the future mid-wait ends the stall episode with
    /// [`StreamEvent::BufferingCompleted`] and keeps the position consistent
    /// with the bytes already copied into `buf`.
    ///
    /// # Errors
    ///
    /// - `StreamError::ObjectDisposed` - Stream has been closed
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        let _episode = StallEpisodeGuard {
            signals: &self.signals,
        };
        Ok(inner.read(buf, &self.signals).await)
    }

    /// Smoothed read throughput in bytes per second.
    ///
    /// # Errors
    ///
    /// - `StreamError::ObjectDisposed` - Stream has been closed
    pub async fn average_read_rate(&self) -> Result<f64, StreamError> {
        let inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(inner.rate.average())
    }

    /// Size of the read-ahead window the next refill would use, in pieces.
    ///
    /// # Errors
    ///
    /// - `StreamError::ObjectDisposed` - Stream has been closed
    pub async fn read_ahead_pieces(&self) -> Result<u32, StreamError> {
        let inner = self.inner.lock().await;
        inner.ensure_open()?;
        Ok(inner.read_ahead())
    }

    /// Always fails; the stream is read-only.
    ///
    /// # Errors
    ///
    /// - `StreamError::Unsupported` - Always
    pub fn write(&self, _buf: &[u8]) -> Result<usize, StreamError> {
        Err(StreamError::Unsupported { operation: "write" })
    }

    /// Always fails; the length is fixed by the torrent.
    ///
    /// # Errors
    ///
    /// - `StreamError::Unsupported` - Always
    pub fn set_len(&self, _length: u64) -> Result<(), StreamError> {
        Err(StreamError::Unsupported {
            operation: "set_len",
        })
    }

    /// Releases the file handle, the buffer and the engine priority hints.
    ///
    /// Safe to call any number of times; only the first call has an effect.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.release() {
            self.signals.set_phase(StreamPhase::Disposed);
            info!(path = %self.path.display(), "Closed torrent stream");
        }
    }
}

impl Drop for TorrentStream {
    fn drop(&mut self) {
        if self.inner.get_mut().release() {
            debug!(path = %self.path.display(), "Torrent stream dropped without close");
            self.signals.set_phase(StreamPhase::Disposed);
        }
    }
}

impl StreamInner {
    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.disposed {
            Err(StreamError::ObjectDisposed)
        } else {
            Ok(())
        }
    }

    fn seek(&mut self, target: SeekFrom) -> Result<u64, StreamError> {
        let length = self.geometry.file_length();
        let resolved = match target {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => length as i128 + delta as i128,
        };

        if resolved < 0 || resolved > length as i128 {
            return Err(StreamError::SeekOutOfRange {
                target: resolved,
                length,
            });
        }

        self.position = resolved as u64;
        trace!(position = self.position, "Seeked");
        Ok(self.position)
    }

    async fn read(&mut self, out: &mut [u8], signals: &StreamSignals) -> usize {
        let length = self.geometry.file_length();
        if out.is_empty() || self.position >= length {
            return 0;
        }

        let deadline = Instant::now() + self.config.read_timeout;
        let mut produced = 0usize;

        while produced < out.len() && self.position < length {
            if !self.buffer_holds(self.position) && !self.refill(deadline, signals).await {
                break;
            }

            let offset = (self.position - self.buffer_start) as usize;
            let count = (out.len() - produced).min(self.buffer_length - offset);
            out[produced..produced + count].copy_from_slice(&self.buffer[offset..offset + count]);
            produced += count;
            self.position += count as u64;
        }

        if produced > 0 {
            self.rate.record(produced, Instant::now());
        } else {
            warn!(
                position = self.position,
                timeout_ms = self.config.read_timeout.as_millis() as u64,
                "Read timed out waiting for pieces"
            );
            signals.publish(StreamEvent::ReadTimeout);
        }

        signals.set_phase(if self.position >= length {
            StreamPhase::EndOfStream
        } else {
            StreamPhase::Ready
        });
        produced
    }

    /// Makes the buffer cover the current position, waiting until `deadline`.
    ///
    /// Moves the window before waiting on the gate, so the pieces under a
    /// seek target are already requested while the gate polls.
    ///
    /// Returns `false` if the deadline passed first.
    async fn refill(&mut self, deadline: Instant, signals: &StreamSignals) -> bool {
        let current_piece = self.geometry.piece_of(self.position);
        let read_ahead = self.read_ahead();
        let anchor = predicted_piece(
            &self.geometry,
            self.position,
            self.rate.average(),
            &self.config,
        );
        self.scheduler.update_priorities(anchor, read_ahead);

        let outcome = self
            .gate
            .wait_for_availability(current_piece, read_ahead, deadline, || {
                signals.buffering_started()
            })
            .await;
        if outcome == Availability::TimedOut {
            return false;
        }
        let mut stalled = outcome == Availability::Recovered;

        loop {
            match self.fill_buffer().await {
                Ok(true) => {
                    if stalled {
                        signals.buffering_completed();
                    }
                    return true;
                }
                Ok(false) => trace!(piece = current_piece, "Current piece not present yet"),
                Err(error) => debug!(
                    %error,
                    position = self.position,
                    "Partial file read failed, retrying"
                ),
            }

            if !stalled {
                stalled = true;
                signals.buffering_started();
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Reads the present run of pieces at the position into the buffer.
    ///
    /// Returns `Ok(false)` when the piece under the position is not present.
    async fn fill_buffer(&mut self) -> std::io::Result<bool> {
        let target = self.config.refill_size(self.rate.average());
        let available_end = self.available_end(target);
        if available_end <= self.position {
            return Ok(false);
        }

        let wanted = ((available_end - self.position) as usize).min(target);
        if self.buffer.len() < wanted {
            self.buffer.resize(wanted, 0);
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("partial file handle released"))?;
        file.seek(SeekFrom::Start(self.position)).await?;

        // Stale until the new region is recorded below.
        self.buffer_length = 0;
        let mut filled = 0;
        while filled < wanted {
            let read = file.read(&mut self.buffer[filled..wanted]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        if filled == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "partial file ends before its present pieces",
            ));
        }

        self.buffer_start = self.position;
        self.buffer_length = filled;
        debug!(
            start = self.buffer_start,
            length = filled,
            target,
            "Refilled stream buffer"
        );
        Ok(true)
    }

    /// End of the run of present pieces starting at the position, capped at
    /// `limit` bytes past it.
    fn available_end(&self, limit: usize) -> u64 {
        let limit = self
            .position
            .saturating_add(limit as u64)
            .min(self.geometry.file_length());
        let mut piece = self.geometry.piece_of(self.position);
        let mut end = self.position;

        while end < limit
            && piece <= self.geometry.last_piece()
            && self.engine.has_piece(PieceIndex::new(piece))
        {
            end = self.geometry.piece_end(piece);
            piece += 1;
        }
        end.min(limit)
    }

    fn buffer_holds(&self, position: u64) -> bool {
        position >= self.buffer_start && position < self.buffer_start + self.buffer_length as u64
    }

    fn read_ahead(&self) -> u32 {
        read_ahead_pieces(
            self.rate.average(),
            self.geometry.piece_length(),
            &self.config,
        )
    }

    /// Returns `true` if this call closed the stream.
    fn release(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        self.scheduler.release();
        self.file = None;
        self.buffer = Vec::new();
        self.buffer_start = 0;
        self.buffer_length = 0;
        true
    }
}
