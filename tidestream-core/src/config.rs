//! Centralized configuration for Tidestream.
//!
//! All tunable parameters of the streaming reader and the simulated engine are
//! defined here to avoid hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::streaming::StreamError;

const MIB: usize = 1024 * 1024;

/// Central configuration for all Tidestream components.
#[derive(Debug, Clone, Default)]
pub struct TidestreamConfig {
    pub stream: StreamConfig,
    pub simulation: SimulationConfig,
}

/// Tuning for a single [`TorrentStream`](crate::streaming::TorrentStream).
///
/// Controls how long reads may block, how large refills are, and how far
/// ahead of the read position pieces are prioritized.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Upper bound on how long one read call waits for data
    pub read_timeout: Duration,
    /// Interval between piece availability checks while buffering
    pub poll_interval: Duration,
    /// Refill size while the read rate is at or below the growth threshold
    pub min_buffer_size: usize,
    /// Refill size once the read rate exceeds the growth threshold
    pub dynamic_buffer_size: usize,
    /// Read rate (bytes/sec) above which refills use the dynamic size
    pub dynamic_buffer_threshold: f64,
    /// Lower bound on the read-ahead window, in pieces
    pub min_read_ahead: u32,
    /// Upper bound on the read-ahead window, in pieces
    pub max_read_ahead: u32,
    /// Playback time the read-ahead window should cover
    pub read_ahead_horizon: Duration,
    /// How far ahead of the read position the scheduler anchors its window
    pub prediction_horizon: Duration,
    /// Exponential smoothing factor for the read rate estimate
    pub rate_smoothing: f64,
    /// Consecutive present pieces required before a refill is trusted
    pub min_contiguous_pieces: u32,
    /// Pieces at the start of the file prioritized when the stream opens
    pub initial_prioritized_pieces: u32,
    /// Deadline increment between consecutive initially prioritized pieces
    pub initial_deadline_step: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            min_buffer_size: 4 * MIB,
            dynamic_buffer_size: 8 * MIB,
            dynamic_buffer_threshold: MIB as f64, // 1 MiB/s
            min_read_ahead: 10,
            max_read_ahead: 30,
            read_ahead_horizon: Duration::from_secs(10),
            prediction_horizon: Duration::from_secs(2),
            rate_smoothing: 0.3,
            min_contiguous_pieces: 3,
            initial_prioritized_pieces: 30,
            initial_deadline_step: Duration::from_millis(50),
        }
    }
}

impl StreamConfig {
    /// Returns a copy with a different read timeout.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Returns a copy with different refill sizes.
    pub fn with_buffer_sizes(mut self, min_buffer_size: usize, dynamic_buffer_size: usize) -> Self {
        self.min_buffer_size = min_buffer_size;
        self.dynamic_buffer_size = dynamic_buffer_size;
        self
    }

    /// Selects the refill size for the given smoothed read rate.
    pub fn refill_size(&self, average_read_rate: f64) -> usize {
        if average_read_rate > self.dynamic_buffer_threshold {
            self.dynamic_buffer_size
        } else {
            self.min_buffer_size
        }
    }

    /// Checks that the configuration can drive a stream.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidArgument` - Zero timeout, interval or buffer size,
    ///   inverted read-ahead bounds, or a smoothing factor outside `(0, 1]`
    pub fn validate(&self) -> Result<(), StreamError> {
        let reason = if self.read_timeout.is_zero() {
            "read timeout must be greater than zero"
        } else if self.poll_interval.is_zero() {
            "poll interval must be greater than zero"
        } else if self.min_buffer_size == 0 || self.dynamic_buffer_size == 0 {
            "buffer sizes must be greater than zero"
        } else if self.min_read_ahead == 0 || self.min_read_ahead > self.max_read_ahead {
            "read-ahead bounds must satisfy 0 < min <= max"
        } else if !(self.rate_smoothing > 0.0 && self.rate_smoothing <= 1.0) {
            "rate smoothing must be within (0, 1]"
        } else if self.min_contiguous_pieces == 0 {
            "minimum contiguous pieces must be greater than zero"
        } else {
            return Ok(());
        };

        Err(StreamError::InvalidArgument {
            reason: reason.to_string(),
        })
    }
}

/// Simulated engine configuration for testing and development.
///
/// Controls how fast and in which order the simulated swarm delivers pieces.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Deterministic seed for reproducible piece arrival order
    pub deterministic_seed: Option<u64>,
    /// Simulated download speed in bytes per second
    pub simulated_download_speed: u64,
    /// Piece size used when building a simulated torrent
    pub piece_size: u32,
    /// Time between two swarm delivery rounds
    pub tick_interval: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            simulated_download_speed: 2_097_152, // 2 MiB/s
            piece_size: 262_144,                 // 256 KiB
            tick_interval: Duration::from_millis(20),
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration for deterministic testing.
    pub fn deterministic_testing() -> Self {
        Self {
            deterministic_seed: Some(42),
            simulated_download_speed: 10_485_760, // 10 MiB/s for fast tests
            piece_size: 16_384,
            tick_interval: Duration::from_millis(5),
        }
    }
}

impl TidestreamConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(millis) = env_u64("TIDESTREAM_READ_TIMEOUT_MS") {
            config.stream.read_timeout = Duration::from_millis(millis);
        }

        if let Some(millis) = env_u64("TIDESTREAM_POLL_INTERVAL_MS") {
            config.stream.poll_interval = Duration::from_millis(millis);
        }

        if let Some(seed) = env_u64("TIDESTREAM_SIMULATION_SEED") {
            config.simulation.deterministic_seed = Some(seed);
        }

        if let Some(speed) = env_u64("TIDESTREAM_SIMULATED_DOWNLOAD_SPEED") {
            config.simulation.simulated_download_speed = speed;
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            stream: StreamConfig::default().with_read_timeout(Duration::from_secs(5)),
            simulation: SimulationConfig::deterministic_testing(),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stream_values() {
        let config = StreamConfig::default();

        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.min_buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.dynamic_buffer_size, 8 * 1024 * 1024);
        assert_eq!((config.min_read_ahead, config.max_read_ahead), (10, 30));
        assert_eq!(config.rate_smoothing, 0.3);
        assert_eq!(config.min_contiguous_pieces, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_refill_size_switches_above_one_mib_per_second() {
        let config = StreamConfig::default();

        assert_eq!(config.refill_size(0.0), config.min_buffer_size);
        assert_eq!(config.refill_size(1_048_576.0), config.min_buffer_size);
        assert_eq!(config.refill_size(1_048_577.0), config.dynamic_buffer_size);
    }

    #[test]
    fn test_zero_read_timeout_is_rejected() {
        let config = StreamConfig::default().with_read_timeout(Duration::ZERO);

        assert!(matches!(
            config.validate(),
            Err(StreamError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_inverted_read_ahead_bounds_are_rejected() {
        let config = StreamConfig {
            min_read_ahead: 40,
            ..StreamConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("TIDESTREAM_READ_TIMEOUT_MS", "1500");
            std::env::set_var("TIDESTREAM_SIMULATION_SEED", "12345");
        }

        let config = TidestreamConfig::from_env();

        assert_eq!(config.stream.read_timeout, Duration::from_millis(1500));
        assert_eq!(config.simulation.deterministic_seed, Some(12345));

        unsafe {
            std::env::remove_var("TIDESTREAM_READ_TIMEOUT_MS");
            std::env::remove_var("TIDESTREAM_SIMULATION_SEED");
        }
    }

    #[test]
    fn test_testing_preset() {
        let config = TidestreamConfig::for_testing();

        assert_eq!(config.simulation.deterministic_seed, Some(42));
        assert_eq!(config.stream.read_timeout, Duration::from_secs(5));
    }
}
