//! Object key normalization.
//!
//! Keys are `/`-separated and relative to a backend root or bucket. Both the
//! local and the S3 backend map a locator through [`normalize_key`] before
//! touching anything, so the same key names the same object on either.

use crate::StorageError;

/// Returns the canonical form of `locator` as an object key.
///
/// A leading `/`, empty segments and `.` segments are dropped. `..`
/// segments, backslashes, control characters and a leading drive prefix
/// (`C:`) are rejected, as is a key that normalizes to nothing.
pub fn normalize_key(locator: &str) -> Result<String, StorageError> {
    let invalid = |why: &str| StorageError::InvalidLocator(format!("{why}: {locator:?}"));

    let mut segments = Vec::new();
    for segment in locator.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(invalid("parent segment in key")),
            s if s.contains('\\') => return Err(invalid("backslash in key")),
            s if s.chars().any(char::is_control) => return Err(invalid("control character in key")),
            s => segments.push(s),
        }
    }

    match segments.first() {
        None => Err(invalid("empty key")),
        Some(first) if is_drive(first) => Err(invalid("drive prefix in key")),
        Some(_) => Ok(segments.join("/")),
    }
}

fn is_drive(segment: &str) -> bool {
    let b = segment.as_bytes();
    b.len() == 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}
