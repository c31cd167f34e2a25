//! Numeric precision widening.
//!
//! A query number matches anything that would round to it at its written
//! precision, so `100.24` covers `[100.235, 100.245]` and the integer
//! `100` covers `[99.5, 100.5]`. The bounds are built on the digit string
//! to avoid float drift, then parsed for comparison.

/// Widens a decimal literal to its `(low, high)` bounds as strings.
pub fn widen(raw: &str) -> Option<(String, String)> {
    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    if body.matches('.').count() > 1 || body.starts_with('.') || body.ends_with('.') {
        return None;
    }

    let (low, high) = match body.split_once('.') {
        None => {
            let high = format!("{body}.5");
            let low = if is_zero(body) {
                "-0.5".to_string()
            } else {
                format!("{}.5", decrement_digits(body))
            };
            (low, high)
        }
        Some((int_part, frac_part)) => {
            // Half an ulp up is the value itself with a trailing 5.
            let high = format!("{int_part}.{frac_part}5");
            let low = if is_zero(int_part) && is_zero(frac_part) {
                // Stepping below zero mirrors the high bound.
                format!("-{high}")
            } else {
                format!("{}5", step_down(int_part, frac_part))
            };
            (low, high)
        }
    };

    if negative {
        // Negation swaps which bound is low.
        Some((negate(&high), negate(&low)))
    } else {
        Some((low, high))
    }
}

/// Parses the widened bounds to floats for comparison.
pub fn widen_f64(raw: &str) -> Option<(f64, f64)> {
    let (low, high) = widen(raw)?;
    Some((low.parse().ok()?, high.parse().ok()?))
}

pub fn parse(raw: &str) -> Option<f64> {
    raw.trim().parse().ok()
}

fn is_zero(digits: &str) -> bool {
    digits.chars().all(|c| c == '0')
}

fn negate(value: &str) -> String {
    match value.strip_prefix('-') {
        Some(rest) => rest.to_string(),
        None => format!("-{value}"),
    }
}

/// `int.frac` with the last fractional digit stepped down by one. Caller
/// guarantees the value is nonzero.
fn step_down(int_part: &str, frac_part: &str) -> String {
    let combined = format!("{int_part}{frac_part}");
    let stepped = decrement_digits(&combined);
    let padded = format!("{stepped:0>width$}", width = combined.len());
    split_at_fraction(&padded, frac_part.len())
}

fn split_at_fraction(digits: &str, frac_len: usize) -> String {
    let split = digits.len() - frac_len;
    let int_part = digits[..split].trim_start_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    format!("{int_part}.{}", &digits[split..])
}

/// Decrements a nonzero digit string, borrowing as needed. Leading zeros
/// are trimmed by the caller when reassembling.
fn decrement_digits(digits: &str) -> String {
    let mut out: Vec<u8> = digits.bytes().collect();
    for b in out.iter_mut().rev() {
        if *b == b'0' {
            *b = b'9';
        } else {
            *b -= 1;
            break;
        }
    }
    let trimmed = String::from_utf8(out).unwrap_or_default();
    let trimmed = trimmed.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_widens_half_last_digit() {
        assert_eq!(
            widen("100.24"),
            Some(("100.235".to_string(), "100.245".to_string()))
        );
        assert_eq!(widen("0.5"), Some(("0.45".to_string(), "0.55".to_string())));
    }

    #[test]
    fn test_integer_widens_half_unit() {
        assert_eq!(widen("100"), Some(("99.5".to_string(), "100.5".to_string())));
        assert_eq!(widen("1"), Some(("0.5".to_string(), "1.5".to_string())));
        assert_eq!(widen("0"), Some(("-0.5".to_string(), "0.5".to_string())));
    }

    #[test]
    fn test_borrow_across_digits() {
        // 1.00 steps down through the hundredths to 0.995.
        assert_eq!(widen("1.00"), Some(("0.995".to_string(), "1.005".to_string())));
        assert_eq!(widen("2.0"), Some(("1.95".to_string(), "2.05".to_string())));
    }

    #[test]
    fn test_high_bound_is_value_plus_half_ulp() {
        assert_eq!(widen("9.99"), Some(("9.985".to_string(), "9.995".to_string())));
        assert_eq!(widen("0.99").unwrap().1, "0.995");
    }

    #[test]
    fn test_zero_decimal_is_symmetric() {
        assert_eq!(widen("0.00"), Some(("-0.005".to_string(), "0.005".to_string())));
    }

    #[test]
    fn test_negative_swaps_bounds() {
        assert_eq!(
            widen("-100.24"),
            Some(("-100.245".to_string(), "-100.235".to_string()))
        );
        let (low, high) = widen_f64("-100").unwrap();
        assert!((low - -100.5).abs() < 1e-9);
        assert!((high - -99.5).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        assert!(widen("").is_none());
        assert!(widen("abc").is_none());
        assert!(widen("1.2.3").is_none());
        assert!(widen(".5").is_none());
        assert!(widen("5.").is_none());
        assert!(widen("--5").is_none());
    }

    #[test]
    fn test_bounds_parse_as_floats() {
        let (low, high) = widen_f64("100.24").unwrap();
        assert!(low < 100.24 && 100.24 < high);
    }
}
