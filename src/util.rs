//! Text helpers shared by the engine and the CLI.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Cuts on character boundaries, so multi-byte UTF-8 input never panics.
///
/// # Examples
/// ```
/// use agentlane::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("", 10), "");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            // Trim trailing whitespace for cleaner output
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Collapse every run of whitespace (including newlines) into a single space.
///
/// Process errors often embed multi-line stderr; this keeps user-facing
/// detail snippets on one line.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Single-line, length-bounded rendering of an arbitrary error message.
pub fn clip_detail(s: &str, max_chars: usize) -> String {
    truncate_with_ellipsis(&collapse_whitespace(s), max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii_no_truncation() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello world", 50), "hello world");
    }

    #[test]
    fn test_truncate_ascii_with_truncation() {
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        assert_eq!(
            truncate_with_ellipsis("This is a long message", 10),
            "This is a..."
        );
    }

    #[test]
    fn test_truncate_at_exact_boundary() {
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate_with_ellipsis("café résumé", 4), "café...");
        assert_eq!(truncate_with_ellipsis("日本語テキスト", 3), "日本語...");
    }

    #[test]
    fn test_truncate_zero_max_chars() {
        assert_eq!(truncate_with_ellipsis("hello", 0), "...");
    }

    #[test]
    fn collapse_whitespace_joins_lines() {
        assert_eq!(
            collapse_whitespace("  error:\n\tspawn   failed \n"),
            "error: spawn failed"
        );
    }

    #[test]
    fn clip_detail_is_single_line_and_bounded() {
        let raw = format!("first line\nsecond {}", "x".repeat(500));
        let clipped = clip_detail(&raw, 40);
        assert!(!clipped.contains('\n'));
        assert!(clipped.ends_with("..."));
        assert!(clipped.chars().count() <= 43);
    }
}
