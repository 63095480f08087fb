//! CLI command implementations

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::Subcommand;
use sha1::{Digest, Sha1};
use tidestream_core::streaming::{PieceGeometry, PieceWindow, predicted_piece, read_ahead_pieces};
use tidestream_core::{
    StreamConfig, StreamEvent, TidestreamConfig, TidestreamError, TorrentStream,
};
use tidestream_sim::{SimulatedSwarm, SimulatedTorrent};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Exit code for failures caused by bad arguments.
const EXIT_USER_ERROR: u8 = 2;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a local file through a simulated swarm into an output file
    Stream {
        /// File to serve as torrent content
        source: PathBuf,
        /// Where the streamed bytes are written
        #[arg(short, long)]
        output: PathBuf,
        /// Torrent piece length in bytes (simulation default if omitted)
        #[arg(long)]
        piece_size: Option<u32>,
        /// Simulated download speed in bytes per second
        #[arg(long)]
        speed: Option<u64>,
        /// Seed for the swarm's piece order
        #[arg(long)]
        seed: Option<u64>,
        /// Read timeout in milliseconds
        #[arg(long)]
        read_timeout_ms: Option<u64>,
        /// Byte offset to start streaming from
        #[arg(long, default_value_t = 0)]
        seek: u64,
        /// Bytes requested per read call
        #[arg(long, default_value_t = 65_536)]
        chunk_size: usize,
        /// Directory for the partial file (a temporary directory if omitted)
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },
    /// Show the piece window a stream would prioritize
    Plan {
        /// Torrent piece length in bytes
        #[arg(long)]
        piece_size: u32,
        /// File length in bytes
        #[arg(long)]
        file_size: u64,
        /// Current read position in bytes
        #[arg(long, default_value_t = 0)]
        position: u64,
        /// Smoothed read rate in bytes per second
        #[arg(long, default_value_t = 0.0)]
        rate: f64,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Stream {
            source,
            output,
            piece_size,
            speed,
            seed,
            read_timeout_ms,
            seek,
            chunk_size,
            save_dir,
        } => {
            let mut config = TidestreamConfig::from_env();
            if let Some(speed) = speed {
                config.simulation.simulated_download_speed = speed;
            }
            if seed.is_some() {
                config.simulation.deterministic_seed = seed;
            }
            if let Some(millis) = read_timeout_ms {
                config.stream.read_timeout = Duration::from_millis(millis);
            }

            let options = StreamOptions {
                piece_size: piece_size.unwrap_or(config.simulation.piece_size),
                seek,
                chunk_size,
            };
            stream_file(&source, &output, save_dir.as_deref(), options, config).await
        }
        Commands::Plan {
            piece_size,
            file_size,
            position,
            rate,
            json,
        } => show_plan(piece_size, file_size, position, rate, json),
    }
}

/// Stream parameters that do not belong to the shared configuration.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub piece_size: u32,
    pub seek: u64,
    pub chunk_size: usize,
}

impl StreamOptions {
    fn validate(&self) -> tidestream_core::Result<()> {
        if self.piece_size == 0 {
            return Err(TidestreamError::Configuration {
                reason: "piece size must be greater than zero".to_string(),
            });
        }
        if self.chunk_size == 0 {
            return Err(TidestreamError::Configuration {
                reason: "chunk size must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Stream `source` through a simulated swarm and write it to `output`
///
/// # Errors
/// - Source cannot be read or output cannot be written
/// - Configuration is invalid
/// - Stream stalled before reaching the end of the file
pub async fn stream_file(
    source: &Path,
    output: &Path,
    save_dir: Option<&Path>,
    options: StreamOptions,
    config: TidestreamConfig,
) -> anyhow::Result<()> {
    options.validate()?;
    config
        .stream
        .validate()
        .map_err(TidestreamError::from)?;

    let scratch = tempfile::TempDir::new().context("Failed to create scratch directory")?;
    let save_dir = save_dir.unwrap_or(scratch.path());

    let torrent = Arc::new(
        SimulatedTorrent::from_source_file(source, options.piece_size, save_dir)
            .await
            .with_context(|| format!("Failed to load {}", source.display()))?,
    );
    let swarm = SimulatedSwarm::new(torrent.clone(), &config.simulation)?.spawn();

    let stream = TorrentStream::open(torrent.clone(), 0, config.stream.clone())
        .await
        .map_err(TidestreamError::from)?;
    let length = stream.length().map_err(TidestreamError::from)?;
    info!(
        source = %source.display(),
        partial = %stream.path().display(),
        length,
        "Streaming through simulated swarm"
    );
    println!(
        "Streaming {} ({length} bytes, {} pieces of {} bytes)",
        source.display(),
        torrent.total_pieces(),
        options.piece_size
    );

    let mut events = stream.subscribe();
    let started = Instant::now();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!(
                    "  [{:>8.3}s] {}",
                    started.elapsed().as_secs_f64(),
                    describe(event)
                ),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Stream events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let copied = copy_stream(&stream, output, options).await;
    let (total, actual) = match copied {
        Ok(copied) => copied,
        Err(error) => {
            stream.close().await;
            swarm.stop().await?;
            return Err(error)
                .with_context(|| format!("Failed to stream into {}", output.display()));
        }
    };

    let position = stream.position().await.map_err(TidestreamError::from)?;
    let average_rate = stream
        .average_read_rate()
        .await
        .map_err(TidestreamError::from)?;
    stream.close().await;
    drop(stream);
    reporter.await?;
    let report = swarm.stop().await?;

    let elapsed = started.elapsed();
    let expected = Sha1::digest(&torrent.content()[options.seek as usize..]).to_vec();
    info!(total, elapsed_ms = elapsed.as_millis() as u64, "Stream finished");

    println!();
    println!("Stream Summary");
    println!("{:-<60}", "");
    println!("Bytes streamed:     {total}");
    println!("Elapsed:            {:.3}s", elapsed.as_secs_f64());
    println!(
        "Throughput:         {:.2} MiB/s",
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1_048_576.0
    );
    println!("Smoothed read rate: {:.2} MiB/s", average_rate / 1_048_576.0);
    println!(
        "Pieces downloaded:  {} of {}",
        report.completed.len(),
        torrent.total_pieces()
    );
    println!("Output SHA-1:       {}", hex::encode(&actual));

    if position < length {
        bail!("Stream stalled at byte {position} of {length}");
    }
    if actual != expected {
        bail!(
            "Output digest {} does not match source digest {}",
            hex::encode(&actual),
            hex::encode(&expected)
        );
    }
    println!("Output matches source");
    Ok(())
}

/// Copies the stream from `options.seek` to its end into `output`.
///
/// Returns the number of bytes copied and their SHA-1 digest.
async fn copy_stream(
    stream: &TorrentStream,
    output: &Path,
    options: StreamOptions,
) -> tidestream_core::Result<(u64, Vec<u8>)> {
    if options.seek > 0 {
        stream.seek(SeekFrom::Start(options.seek)).await?;
    }

    let mut output_file = tokio::fs::File::create(output).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; options.chunk_size];
    let mut total = 0u64;

    loop {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        output_file.write_all(&buf[..read]).await?;
        hasher.update(&buf[..read]);
        total += read as u64;
    }
    output_file.flush().await?;

    Ok((total, hasher.finalize().to_vec()))
}

/// Message and process exit code for a failed command
///
/// Tidestream errors are shown through their user-facing message; anything
/// else is shown with its full context chain.
pub fn failure_report(error: &anyhow::Error) -> (String, u8) {
    match error.downcast_ref::<TidestreamError>() {
        Some(failure) if failure.is_user_error() => (failure.user_message(), EXIT_USER_ERROR),
        Some(failure) => (failure.user_message(), 1),
        None => (format!("{error:#}"), 1),
    }
}

/// Print the read-ahead window for a reader at `position`
///
/// # Errors
/// - Piece size or file size is zero
/// - Position is past the end of the file
pub fn show_plan(
    piece_size: u32,
    file_size: u64,
    position: u64,
    rate: f64,
    json: bool,
) -> anyhow::Result<()> {
    if piece_size == 0 || file_size == 0 {
        return Err(TidestreamError::Configuration {
            reason: "piece size and file size must be greater than zero".to_string(),
        }
        .into());
    }
    if position >= file_size {
        return Err(TidestreamError::Configuration {
            reason: format!("position {position} is past the end of a {file_size} byte file"),
        }
        .into());
    }

    let config = StreamConfig::default();
    let total_pieces = u32::try_from(file_size.div_ceil(piece_size as u64))
        .context("File has more pieces than a torrent can index")?;
    let geometry = PieceGeometry::new(piece_size, total_pieces, 0, file_size);
    let read_ahead = read_ahead_pieces(rate, piece_size, &config);
    let anchor = predicted_piece(&geometry, position, rate, &config);
    let window = PieceWindow::compute(anchor, read_ahead, total_pieces);
    let refill_bytes = config.refill_size(rate);

    if json {
        let plan = serde_json::json!({
            "current_piece": geometry.piece_of(position),
            "read_ahead": read_ahead,
            "refill_bytes": refill_bytes,
            "window": window,
            "assignments": window.assignments().collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Read-Ahead Plan");
    println!("{:-<60}", "");
    println!("Current piece: {}", geometry.piece_of(position));
    println!("Anchor piece:  {}", window.anchor);
    println!("Read-ahead:    {read_ahead} pieces");
    println!("Refill size:   {refill_bytes} bytes");
    println!("Window:        {}..={}", window.start_piece, window.end_piece);
    println!();
    println!("{:>8}  {:>8}  {:>10}", "piece", "priority", "deadline");
    for assignment in window.assignments() {
        println!(
            "{:>8}  {:>8}  {:>8}ms",
            assignment.piece, assignment.priority, assignment.deadline_ms
        );
    }
    Ok(())
}

fn describe(event: StreamEvent) -> &'static str {
    match event {
        StreamEvent::BufferingStarted => "buffering started",
        StreamEvent::BufferingCompleted => "buffering completed",
        StreamEvent::ReadTimeout => "read timed out",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_rejects_degenerate_input() {
        assert!(show_plan(0, 1024, 0, 0.0, false).is_err());
        assert!(show_plan(1024, 0, 0, 0.0, false).is_err());
        assert!(show_plan(1024, 4096, 4096, 0.0, false).is_err());
    }

    #[test]
    fn test_plan_input_errors_are_user_errors() {
        let error = show_plan(1024, 4096, 5000, 0.0, false).unwrap_err();

        let (message, code) = failure_report(&error);
        assert_eq!(code, EXIT_USER_ERROR);
        assert!(message.starts_with("Invalid configuration: position 5000"));
    }

    #[test]
    fn test_plan_accepts_last_byte() {
        assert!(show_plan(1024, 4096, 4095, 5_000_000.0, true).is_ok());
    }

    #[tokio::test]
    async fn test_stream_copies_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("clip.bin");
        let output = dir.path().join("copy.bin");
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
        std::fs::write(&source, &content).unwrap();

        let mut config = TidestreamConfig::for_testing();
        config.simulation.simulated_download_speed = 4 * 1024 * 1024;
        config.simulation.tick_interval = Duration::from_millis(2);
        let options = StreamOptions {
            piece_size: 4096,
            seek: 1000,
            chunk_size: 3000,
        };

        stream_file(&source, &output, None, options, config)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), &content[1000..]);
    }

    #[tokio::test]
    async fn test_seek_past_end_reports_user_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("clip.bin");
        std::fs::write(&source, vec![7u8; 10_000]).unwrap();
        let options = StreamOptions {
            piece_size: 4096,
            seek: 20_000,
            chunk_size: 1024,
        };

        let error = stream_file(
            &source,
            &dir.path().join("copy.bin"),
            None,
            options,
            TidestreamConfig::for_testing(),
        )
        .await
        .unwrap_err();

        let (message, code) = failure_report(&error);
        assert_eq!(code, EXIT_USER_ERROR);
        assert!(message.contains("20000"), "{message}");
    }

    #[tokio::test]
    async fn test_zero_chunk_size_is_rejected_before_streaming() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = StreamOptions {
            piece_size: 4096,
            seek: 0,
            chunk_size: 0,
        };

        let error = stream_file(
            &dir.path().join("missing.bin"),
            &dir.path().join("copy.bin"),
            None,
            options,
            TidestreamConfig::for_testing(),
        )
        .await
        .unwrap_err();

        assert_eq!(failure_report(&error).1, EXIT_USER_ERROR);
        assert!(!dir.path().join("copy.bin").exists());
    }

    #[test]
    fn test_piece_size_defaults_to_simulation_config() {
        use clap::Parser;

        #[derive(Parser)]
        struct Harness {
            #[command(subcommand)]
            command: Commands,
        }

        let harness = Harness::parse_from(["tidestream", "stream", "clip.bin", "-o", "out.bin"]);
        let Commands::Stream { piece_size, .. } = harness.command else {
            panic!("expected stream command");
        };
        let config = TidestreamConfig::for_testing();
        assert_eq!(piece_size, None);
        assert_eq!(
            piece_size.unwrap_or(config.simulation.piece_size),
            16_384
        );
    }
}
