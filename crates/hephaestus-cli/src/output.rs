//! Small formatting helpers for table output.

/// Truncate a string to max display characters with ellipsis.
pub fn truncate(s: &str, max: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max || max == 0 {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max - 1).collect::<String>())
    }
}

/// Compact age of a millisecond timestamp relative to `now_ms`: `42s`,
/// `7m`, `3h`, `2d`. Future timestamps read as `0s`.
pub fn age(now_ms: i64, then_ms: i64) -> String {
    let secs = (now_ms - then_ms).max(0) / 1000;
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

/// First line of `text`, truncated.
pub fn preview(text: &str, max: usize) -> String {
    truncate(text.lines().next().unwrap_or_default(), max)
}
