//! Timestamp normalization, kept private to the call service (spec.md §9).
//!
//! Event timestamps are RFC 3339 except that some arrive with a numeric
//! offset missing its colon (`+0000` rather than `+00:00`); this inserts it
//! before handing off to `chrono`.

use chrono::{DateTime, Utc};

pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    let fixed = insert_offset_colon(raw)?;
    DateTime::parse_from_rfc3339(&fixed)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn insert_offset_colon(raw: &str) -> Option<String> {
    if raw.len() < 5 {
        return None;
    }
    let sign_pos = raw.len() - 5;
    let sign = raw.as_bytes()[sign_pos];
    if sign != b'+' && sign != b'-' {
        return None;
    }
    let digits = &raw[sign_pos + 1..];
    if digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_digit()) {
        let mut fixed = String::with_capacity(raw.len() + 1);
        fixed.push_str(&raw[..=sign_pos]);
        fixed.push_str(&digits[..2]);
        fixed.push(':');
        fixed.push_str(&digits[2..]);
        Some(fixed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_rfc3339() {
        let ts = parse_timestamp(Some("2024-01-01T00:00:00.000+00:00"));
        assert!(ts.is_some());
    }

    #[test]
    fn parses_offset_without_colon() {
        let ts = parse_timestamp(Some("2024-01-01T00:00:00.000+0000"));
        assert!(ts.is_some());
    }

    #[test]
    fn parses_negative_offset_without_colon() {
        let ts = parse_timestamp(Some("2024-06-15T12:30:00.500-0500"));
        assert!(ts.is_some());
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(parse_timestamp(Some("not a timestamp")), None);
    }

    #[test]
    fn absent_yields_none() {
        assert_eq!(parse_timestamp(None), None);
    }
}
