//! Classification of explicit error signals reported by agents.

use std::sync::LazyLock;

use regex::Regex;

use super::record::ErrorKind;

static RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate[\s_-]?limit|\b429\b|too many requests|quota exceeded|usage limit)")
        .expect("static regex is valid")
});

static TIMED_OUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timed?\s*out|timeout|deadline exceeded)").expect("static regex is valid")
});

/// Map an error-signal body to an [`ErrorKind`]. Rate limiting wins over
/// timeouts when both appear. Unrecognised text yields `None`.
pub fn classify_signal(text: &str) -> Option<ErrorKind> {
    if RATE_LIMIT.is_match(text) {
        Some(ErrorKind::RateLimited)
    } else if TIMED_OUT.is_match(text) {
        Some(ErrorKind::TimedOut)
    } else {
        None
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_variants() {
        for text in [
            "Rate limit reached, retry later",
            "HTTP 429 from upstream",
            "error: rate_limit_exceeded",
            "Too Many Requests",
            "Claude usage limit reached",
        ] {
            assert_eq!(classify_signal(text), Some(ErrorKind::RateLimited), "{text}");
        }
    }

    #[test]
    fn timeout_variants() {
        for text in ["request timed out", "Timeout after 30s", "deadline exceeded"] {
            assert_eq!(classify_signal(text), Some(ErrorKind::TimedOut), "{text}");
        }
    }

    #[test]
    fn rate_limit_takes_precedence() {
        assert_eq!(
            classify_signal("timeout while waiting: 429"),
            Some(ErrorKind::RateLimited)
        );
    }

    #[test]
    fn unrelated_text_is_unclassified() {
        assert_eq!(classify_signal("compile error in main.rs"), None);
        assert_eq!(classify_signal("port 4290 in use"), None);
    }
}
