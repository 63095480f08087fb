//! Integration tests for Tidestream
//!
//! These tests drive a real `TorrentStream` against the simulated engine and
//! swarm, covering reassembly, seeking, starvation and multi-file torrents.
//! Unit tests for individual components live next to the code they test.

#[path = "style.rs"]
mod style;

#[path = "integration/swarm_fixture.rs"]
mod swarm_fixture;

#[path = "integration/multi_file.rs"]
mod multi_file;
#[path = "integration/seek_streaming.rs"]
mod seek_streaming;
#[path = "integration/starvation.rs"]
mod starvation;
#[path = "integration/stream_reassembly.rs"]
mod stream_reassembly;
