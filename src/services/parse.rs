//! Field extraction for AT response and URC lines.
//!
//! Responses in this command set are flat comma-separated fields after a
//! `+CMD: ` prefix, with strings double-quoted. Nothing here allocates;
//! every helper returns a subslice of its input.

/// Strips `prefix` and returns the remainder.
pub(crate) fn after_prefix<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)
}

/// Everything before the first `,`, or the whole input.
pub(crate) fn first_field(s: &str) -> &str {
    match s.split_once(',') {
        Some((field, _)) => field,
        None => s,
    }
}

/// Everything after the last `,`, or the whole input.
pub(crate) fn last_field(s: &str) -> &str {
    match s.rsplit_once(',') {
        Some((_, field)) => field,
        None => s,
    }
}

/// Content of the first `"…"` pair.
pub(crate) fn quoted(s: &str) -> Option<&str> {
    let (_, rest) = s.split_once('"')?;
    let (content, _) = rest.split_once('"')?;
    Some(content)
}

/// Content of the last `"…"` pair.
pub(crate) fn last_quoted(s: &str) -> Option<&str> {
    let (rest, _) = s.rsplit_once('"')?;
    let (_, content) = rest.rsplit_once('"')?;
    Some(content)
}

/// The response's final character as a decimal digit. Socket and profile
/// ids in this command set are single digits, reported last on the line.
pub(crate) fn last_digit(s: &str) -> Option<u8> {
    s.trim_end()
        .bytes()
        .last()
        .filter(u8::is_ascii_digit)
        .map(|b| b - b'0')
}
