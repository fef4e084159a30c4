//! Shared utility functions for the Shipwright crate.

/// Lowercase `text`, collapse every run of non-alphanumeric characters into
/// a single `-`, and cap the result at `max_len` bytes.
///
/// Only ASCII letters and digits survive, so the result is always a valid
/// repository or project name fragment.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Truncate to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
