//! Small shared helpers for digests, sizes, and byte handling.

use std::fmt::Write as _;

// =============================================================================
// Hex Formatting
// =============================================================================

/// Formats a byte slice as lowercase hex.
///
/// Used for rendering digests in error messages and metadata records.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // write! to a String cannot fail
        let _ = write!(out, "{b:02x}");
    }
    out
}

// =============================================================================
// Size Formatting
// =============================================================================

/// Formats a byte count for human consumption.
pub fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{size}B")
    }
}

// =============================================================================
// Null-Terminated Names
// =============================================================================

/// Returns the portion of `data` before the first null byte.
///
/// Archive name fields are null-padded to their declared size; everything
/// after the terminator is padding.
#[inline]
pub fn trim_null(data: &[u8]) -> &[u8] {
    let end = memchr::memchr(0, data).unwrap_or(data.len());
    &data[..end]
}
