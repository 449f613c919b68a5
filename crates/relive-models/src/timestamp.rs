//! `HH:MM:SS` timecode parsing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimecodeError {
    #[error("invalid timecode format: {0}")]
    InvalidFormat(String),
}

/// Parse a trim timecode into seconds.
///
/// Accepts `HH:MM:SS`, `MM:SS` and bare seconds. An empty string or
/// `00:00:00` means "unset" and parses to `None`, matching how trim
/// boundaries are stored.
pub fn parse_timecode(value: &str) -> Result<Option<f64>, TimecodeError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() > 3 {
        return Err(TimecodeError::InvalidFormat(value.to_string()));
    }

    let mut seconds = 0.0f64;
    for part in &parts {
        let n: f64 = part
            .parse()
            .map_err(|_| TimecodeError::InvalidFormat(value.to_string()))?;
        if n < 0.0 {
            return Err(TimecodeError::InvalidFormat(value.to_string()));
        }
        seconds = seconds * 60.0 + n;
    }

    if seconds == 0.0 {
        Ok(None)
    } else {
        Ok(Some(seconds))
    }
}

/// Format seconds as `HH:MM:SS`.
pub fn format_seconds(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_timecode() {
        assert_eq!(parse_timecode("00:02:00").unwrap(), Some(120.0));
        assert_eq!(parse_timecode("01:00:30").unwrap(), Some(3630.0));
        assert_eq!(parse_timecode("02:30").unwrap(), Some(150.0));
        assert_eq!(parse_timecode("45").unwrap(), Some(45.0));
    }

    #[test]
    fn test_zero_and_empty_mean_unset() {
        assert_eq!(parse_timecode("").unwrap(), None);
        assert_eq!(parse_timecode("  ").unwrap(), None);
        assert_eq!(parse_timecode("00:00:00").unwrap(), None);
    }

    #[test]
    fn test_invalid_timecodes() {
        assert!(parse_timecode("a:b:c").is_err());
        assert!(parse_timecode("1:2:3:4").is_err());
        assert!(parse_timecode("-5").is_err());
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(0.0), "00:00:00");
        assert_eq!(format_seconds(3630.0), "01:00:30");
        assert_eq!(format_seconds(133.4), "00:02:13");
    }
}
