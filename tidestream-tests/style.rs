//! Style Enforcement Tests
//!
//! Scans the production sources of every workspace crate for patterns that
//! clippy does not reject on its own.
//!
//! - `production_code` - No `#[allow(dead_code)]`, no panicking unwraps, no catch-all module names

#[path = "style/production_code.rs"]
mod production_code;
