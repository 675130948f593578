//! Utility module
//!
//! This module provides logging helpers used throughout the library.

use std::fmt::Write;

use tracing::Level;

/// Formats bytes as lowercase hex for frame logging
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Installs a fmt subscriber at `level`; a subscriber already installed is kept
pub fn init_tracing(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}
