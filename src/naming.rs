//! Pure helpers for turning feed metadata into on-disc file names

use chrono::{DateTime, Utc};

/// Media extensions recognised at the end of a source URL
pub const KNOWN_EXTENSIONS: &[&str] = &[".ogg", ".mp3", ".mp4", ".m4a", ".wma", ".flc", ".flac"];

/// Content types mapped onto the same extension allowlist
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("audio/ogg", ".ogg"),
    ("application/ogg", ".ogg"),
    ("audio/vorbis", ".ogg"),
    ("audio/mpeg", ".mp3"),
    ("audio/mp3", ".mp3"),
    ("video/mp4", ".mp4"),
    ("audio/mp4", ".m4a"),
    ("audio/x-m4a", ".m4a"),
    ("audio/x-ms-wma", ".wma"),
    ("audio/flac", ".flac"),
    ("audio/x-flac", ".flac"),
];

const FALLBACK_NAME: &str = "untitled";

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '#' | '(' | ')' | '.' | '_' | '-')
}

/// Drop every character outside `[A-Za-z0-9 #()._-]`, then truncate
pub fn clean(s: &str, max_len: usize) -> String {
    s.chars().filter(|c| is_allowed(*c)).take(max_len).collect()
}

/// `"2024-03-01-0930 Feed title - Entry title"`
pub fn display_title(
    published: DateTime<Utc>,
    feed_title: &str,
    entry_title: &str,
    feed_len: usize,
    entry_len: usize,
) -> String {
    format!(
        "{} {} - {}",
        published.format("%Y-%m-%d-%H%M"),
        clean(feed_title, feed_len),
        clean(entry_title, entry_len),
    )
}

/// Known extension at the end of the URL path, lowercased
pub fn extension_from_url(url: &str) -> Option<&'static str> {
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| url.to_ascii_lowercase());

    KNOWN_EXTENSIONS
        .iter()
        .copied()
        .find(|ext| path.ends_with(ext))
}

/// Extension for a `Content-Type` header value, if it is a known media type
pub fn extension_from_mime(content_type: &str) -> Option<&'static str> {
    let mime: mime::Mime = content_type.parse().ok()?;
    let essence = mime.essence_str();

    MIME_EXTENSIONS
        .iter()
        .find(|(ty, _)| *ty == essence)
        .map(|(_, ext)| *ext)
}

/// Build-item label from a title and an optional extension
pub fn item_label(title: &str, extension: Option<&str>) -> String {
    let mut base = clean(title, usize::MAX).trim().to_string();
    if base.is_empty() || base.chars().all(|c| c == '.') {
        base = FALLBACK_NAME.to_string();
    }
    match extension {
        Some(ext) => format!("{}{}", base, ext),
        None => base,
    }
}

/// `n`th alternative for a taken label; the counter goes before a known extension
pub fn collision_candidate(label: &str, n: u32) -> String {
    let lower = label.to_ascii_lowercase();
    match KNOWN_EXTENSIONS.iter().find(|ext| lower.ends_with(*ext)) {
        Some(ext) => {
            let (stem, suffix) = label.split_at(label.len() - ext.len());
            format!("{} {:03}{}", stem, n, suffix)
        }
        None => format!("{} {:03}", label, n),
    }
}
