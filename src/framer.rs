//! Marker search over accumulated response bytes.
//!
//! The programmer has no length prefixes or checksums, responses are
//! delimited purely by fixed ASCII tokens. Nothing in here knows about the
//! transport or about which exchange is running.

/// Offset of the first occurrence of `marker` in `buffer`
pub fn find_marker(buffer: &[u8], marker: &[u8]) -> Option<usize> {
    if marker.is_empty() || marker.len() > buffer.len() {
        return None;
    }

    buffer.windows(marker.len()).position(|w| w == marker)
}

/// Offset just past the first occurrence of `marker`
pub fn find_after_marker(buffer: &[u8], marker: &[u8]) -> Option<usize> {
    find_marker(buffer, marker).map(|i| i + marker.len())
}

/// Drop everything up to and including the first `marker`.
///
/// Returns false and leaves the buffer untouched when the marker is absent.
pub fn strip_to_marker(buffer: &mut Vec<u8>, marker: &[u8]) -> bool {
    match find_after_marker(buffer, marker) {
        Some(end) => {
            buffer.drain(..end);
            true
        }
        None => false,
    }
}

/// Whitespace-trimmed text following `marker`, decoded lossily
pub fn text_after_marker(buffer: &[u8], marker: &[u8]) -> Option<String> {
    find_after_marker(buffer, marker).map(|end| trimmed_text(&buffer[end..]))
}

/// Lossy, whitespace-trimmed rendering of device supplied bytes
pub fn trimmed_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim().to_string()
}

/// First whitespace delimited token in `data`, if it is terminated.
///
/// A token running to the end of the buffer may still be arriving and is
/// reported as `None` unless `complete` is set.
pub fn leading_token(data: &[u8], complete: bool) -> Option<&[u8]> {
    let start = data.iter().position(|b| !b.is_ascii_whitespace())?;
    let rest = &data[start..];

    match rest.iter().position(|b| b.is_ascii_whitespace()) {
        Some(end) => Some(&rest[..end]),
        None if complete => Some(rest),
        None => None,
    }
}
