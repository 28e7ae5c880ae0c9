//! Phone number normalization and masking.
//!
//! Numbers arrive in whatever shape the upstream CRM captured them
//! ("+1 (555) 010-4477", "555.010.4477", "5550104477"). Comparison always
//! happens on the digit suffix; logs only ever see the masked form.

/// Strip everything but ASCII digits.
pub fn digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Last 10 significant digits: the comparison key for opt-out matching.
///
/// Tolerates country-code prefix variance ("+15550104477" and "5550104477"
/// compare equal). Known limitation: numbers from different countries that
/// share a 10-digit suffix collide.
pub fn suffix10(raw: &str) -> String {
    let d = digits(raw);
    if d.len() > 10 {
        d[d.len() - 10..].to_string()
    } else {
        d
    }
}

/// Display form for logs and UI: only the last 4 digits are visible.
pub fn mask(raw: &str) -> String {
    let d = digits(raw);
    if d.len() <= 4 {
        "***".to_string()
    } else {
        format!("***{}", &d[d.len() - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digits_strips_formatting() {
        assert_eq!(digits("+1 (555) 010-4477"), "15550104477");
        assert_eq!(digits("555.010.4477"), "5550104477");
        assert_eq!(digits("no digits"), "");
    }

    #[test]
    fn test_suffix10_drops_country_code() {
        assert_eq!(suffix10("+15550104477"), "5550104477");
        assert_eq!(suffix10("5550104477"), "5550104477");
        assert_eq!(suffix10("(555) 010-4477"), "5550104477");
    }

    #[test]
    fn test_suffix10_short_number_kept_whole() {
        assert_eq!(suffix10("0104477"), "0104477");
    }

    #[test]
    fn test_mask_shows_last_four_only() {
        assert_eq!(mask("+15550104477"), "***4477");
        assert_eq!(mask("4477"), "***");
        assert_eq!(mask(""), "***");
    }
}
