/// Exact currency amounts as integer cents. The ledger never touches floats;
/// rounding happens once, here, at the parse boundary.
pub type Cents = i64;

/// Maximum absolute mismatch treated as balanced, for both double-entry
/// totals and checkpoint comparison.
pub const TOLERANCE_CENTS: Cents = 1;

/// Parse a locale-formatted amount string into exact cents.
///
/// Accepts currency symbols, thousands separators, surrounding quotes, and
/// parenthesized negatives. Fractions beyond two digits round half away from
/// zero. Returns `None` when no amount can be read.
pub fn parse_cents(raw: &str) -> Option<Cents> {
    let mut s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let mut negative = false;
    s = s.trim_matches('"').trim();
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        negative = true;
        s = inner.trim();
    }
    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, '$' | '\u{20ac}' | '\u{a3}' | ',' | ' ' | '\u{a0}'))
        .collect();
    let mut t = cleaned.as_str();
    if let Some(rest) = t.strip_prefix('-') {
        negative = !negative;
        t = rest;
    } else if let Some(rest) = t.strip_prefix('+') {
        t = rest;
    }
    if t.is_empty() {
        return None;
    }

    let (int_part, frac_part) = match t.split_once('.') {
        Some((i, f)) => (i, f),
        None => (t, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole: i64 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let mut frac_digits = frac_part.chars();
    let d1 = frac_digits.next().map(|c| c as i64 - '0' as i64).unwrap_or(0);
    let d2 = frac_digits.next().map(|c| c as i64 - '0' as i64).unwrap_or(0);
    let round_up = frac_digits.next().map(|c| c as i64 - '0' as i64).unwrap_or(0) >= 5;

    let mut cents = whole.checked_mul(100)? + d1 * 10 + d2;
    if round_up {
        cents += 1;
    }
    Some(if negative { -cents } else { cents })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        assert_eq!(parse_cents("1234.56"), Some(123456));
        assert_eq!(parse_cents("0"), Some(0));
        assert_eq!(parse_cents("  -42.50  "), Some(-4250));
        assert_eq!(parse_cents("7"), Some(700));
    }

    #[test]
    fn test_parse_thousands_and_symbols() {
        assert_eq!(parse_cents("$1,234.56"), Some(123456));
        assert_eq!(parse_cents("\"2,000.00\""), Some(200000));
        assert_eq!(parse_cents("-$50.00"), Some(-5000));
        assert_eq!(parse_cents("\u{20ac}12.00"), Some(1200));
    }

    #[test]
    fn test_parse_parenthesized_negatives() {
        assert_eq!(parse_cents("(500.00)"), Some(-50000));
        assert_eq!(parse_cents("($1,234.56)"), Some(-123456));
    }

    #[test]
    fn test_parse_rounds_half_away_from_zero() {
        assert_eq!(parse_cents("1000.005"), Some(100001));
        assert_eq!(parse_cents("1000.004"), Some(100000));
        assert_eq!(parse_cents("(0.005)"), Some(-1));
        assert_eq!(parse_cents("0.1"), Some(10));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_cents(""), None);
        assert_eq!(parse_cents("   "), None);
        assert_eq!(parse_cents("not_a_number"), None);
        assert_eq!(parse_cents("12.3.4"), None);
        assert_eq!(parse_cents("--5"), None);
    }
}
