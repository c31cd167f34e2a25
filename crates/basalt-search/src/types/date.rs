//! Date normalization and precision widening.
//!
//! Indexed date values are 14-digit `YYYYMMDDhhmmss` strings, so range
//! comparisons are plain lexicographic string comparisons. A query value
//! at reduced precision widens into the earliest and latest instants it
//! could denote.

/// Strips `-`, `:` and `T` separators and drops any zone suffix, leaving
/// the bare digit string. Returns `None` when what remains is not digits
/// or is longer than a full timestamp.
pub fn digits_of(raw: &str) -> Option<String> {
    // Zone designators only appear after a time component.
    let raw = raw
        .split_once(['Z', 'z', '+'])
        .map(|(head, _)| head)
        .unwrap_or(raw);
    // A trailing -hh:mm offset still contains ':'; strip from the last '-'
    // only when it appears after the time separator.
    let raw = match raw.find('T') {
        Some(t_pos) => match raw[t_pos..].rfind('-') {
            Some(rel) => &raw[..t_pos + rel],
            None => raw,
        },
        None => raw,
    };

    // Fractional seconds are discarded, not folded into the digits.
    let raw = raw.split_once('.').map(|(head, _)| head).unwrap_or(raw);

    let digits: String = raw.chars().filter(|c| !matches!(c, '-' | ':' | 'T')).collect();
    if digits.is_empty() || digits.len() > 14 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    // Partial components (e.g. "202") are not meaningful precisions.
    if !matches!(digits.len(), 4 | 6 | 8 | 10 | 12 | 14) {
        return None;
    }
    Some(digits)
}

/// Normalizes a date(time) to its 14-digit low bound, for index storage.
pub fn normalize(raw: &str) -> Option<String> {
    widen(raw).map(|(low, _)| low)
}

/// Widens a date(time) to the inclusive `[low, high]` 14-digit pair of
/// instants it covers. `"2020"` covers the whole year; `"202002"` knows
/// February 2020 had 29 days.
pub fn widen(raw: &str) -> Option<(String, String)> {
    let digits = digits_of(raw)?;

    let mut low = digits.clone();
    match low.len() {
        4 => low.push_str("0101000000"),
        6 => low.push_str("01000000"),
        8 => low.push_str("000000"),
        10 => low.push_str("0000"),
        12 => low.push_str("00"),
        _ => {}
    }

    let mut high = digits.clone();
    match high.len() {
        4 => high.push_str("1231235959"),
        6 => {
            let year: i32 = digits[..4].parse().ok()?;
            let month: u8 = digits[4..6].parse().ok()?;
            if !(1..=12).contains(&month) {
                return None;
            }
            high.push_str(&format!("{:02}235959", last_day_of_month(year, month)));
        }
        8 => high.push_str("235959"),
        10 => high.push_str("5959"),
        12 => high.push_str("59"),
        _ => {}
    }

    Some((low, high))
}

fn last_day_of_month(year: i32, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 28,
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
