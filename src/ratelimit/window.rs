//! Rate limit window parsing.

use std::time::Duration;

/// Window length used whenever a window string cannot be parsed (one minute).
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Unit of a window string and its length in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl WindowUnit {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "ms" => Some(WindowUnit::Millisecond),
            "s" => Some(WindowUnit::Second),
            "m" => Some(WindowUnit::Minute),
            "h" => Some(WindowUnit::Hour),
            "d" => Some(WindowUnit::Day),
            _ => None,
        }
    }

    fn millis(&self) -> u64 {
        match self {
            WindowUnit::Millisecond => 1,
            WindowUnit::Second => 1_000,
            WindowUnit::Minute => 60_000,
            WindowUnit::Hour => 3_600_000,
            WindowUnit::Day => 86_400_000,
        }
    }
}

/// Convert a window string such as `"10 s"`, `"1m"` or `"2  h"` to milliseconds.
///
/// Accepts an unsigned integer followed by any amount of whitespace and one of
/// `ms`, `s`, `m`, `h`, `d`. Anything else yields [`DEFAULT_WINDOW_MS`].
pub fn parse_window(window: &str) -> u64 {
    try_parse_window(window).unwrap_or(DEFAULT_WINDOW_MS)
}

/// Same as [`parse_window`], as a [`Duration`].
pub fn window_duration(window: &str) -> Duration {
    Duration::from_millis(parse_window(window))
}

fn try_parse_window(window: &str) -> Option<u64> {
    let trimmed = window.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if digits_end == 0 {
        return None;
    }

    let (digits, rest) = trimmed.split_at(digits_end);
    let value: u64 = digits.parse().ok()?;
    let unit = WindowUnit::from_token(rest.trim_start())?;

    value.checked_mul(unit.millis())
}
