//! Small shared helpers: pending-time parsing and history excerpts.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse a pending-until timestamp. Accepts RFC 3339 and
/// `YYYY-MM-DD HH:MM:SS` (interpreted as UTC); everything else is rejected.
pub fn parse_pending_until(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

/// Truncate a body to at most `max` characters for history messages,
/// collapsing newlines. Appends an ellipsis when truncated.
pub fn excerpt(body: &str, max: usize) -> String {
    let flat: String = body
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_pending_until("2026-08-01T12:30:00Z").unwrap();
        assert_eq!(dt.hour(), 12);
        assert_eq!(dt.minute(), 30);

        // Offset forms normalize to UTC
        let dt = parse_pending_until("2026-08-01T14:30:00+02:00").unwrap();
        assert_eq!(dt.hour(), 12);
    }

    #[test]
    fn test_parse_space_separated() {
        let dt = parse_pending_until("2026-08-01 12:30:00").unwrap();
        assert_eq!(dt.hour(), 12);
        assert_eq!(dt.minute(), 30);
    }

    #[test]
    fn test_rejects_other_formats() {
        assert!(parse_pending_until("tomorrow").is_none());
        assert!(parse_pending_until("01/08/2026").is_none());
        assert!(parse_pending_until("2026-08-01").is_none());
        assert!(parse_pending_until("2026-08-01 12:30").is_none());
        assert!(parse_pending_until("").is_none());
    }

    #[test]
    fn test_excerpt_short_body_unchanged() {
        assert_eq!(excerpt("Please reset password", 140), "Please reset password");
    }

    #[test]
    fn test_excerpt_collapses_whitespace() {
        assert_eq!(excerpt("line one\nline two\n\n  indented", 140), "line one line two indented");
    }

    #[test]
    fn test_excerpt_truncates() {
        let body = "x".repeat(300);
        let out = excerpt(&body, 140);
        assert_eq!(out.chars().count(), 140);
        assert!(out.ends_with("..."));
    }
}
