//! Message formatting for SMS-sized channels.
//!
//! Builds the final outbound body: optional greeting, truncation to the
//! channel length limit, and the mandatory compliance footer. Pure: no
//! side effects, no clock, no I/O.

use thiserror::Error;

/// Marker appended when the body had to be cut to fit the channel limit.
const ELLIPSIS: &str = "...";

/// Formatting failures. Both are permanent: retrying the same input cannot
/// succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("message body is empty")]
    EmptyBody,

    #[error("length limit {limit} leaves no room for the compliance footer")]
    FooterExceedsLimit { limit: usize },
}

/// Build a channel-safe message body.
///
/// The greeting (when a display name is available) and the footer both count
/// against `limit`. When greeting + body + footer exceed the limit, the text
/// is truncated to `limit - footer - 3` characters and an ellipsis marker is
/// inserted before the footer. Length units are `char`s.
pub fn format_reply(
    body: &str,
    recipient_name: Option<&str>,
    limit: usize,
    footer: &str,
) -> Result<String, FormatError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(FormatError::EmptyBody);
    }

    let mut text = match recipient_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => format!("Hi {}! {}", name, body),
        None => body.to_string(),
    };

    let footer_len = footer.chars().count();
    let ellipsis_len = ELLIPSIS.chars().count();
    if text.chars().count() + footer_len > limit {
        // Need at least one character of body next to the ellipsis.
        if limit < footer_len + ellipsis_len + 1 {
            return Err(FormatError::FooterExceedsLimit { limit });
        }
        let keep = limit - footer_len - ellipsis_len;
        text = text.chars().take(keep).collect();
        text.push_str(ELLIPSIS);
    }

    text.push_str(footer);
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOOTER: &str = " Reply STOP to opt out";

    #[test]
    fn test_short_body_passes_through() {
        let out = format_reply("See you at 2pm.", None, 160, FOOTER).unwrap();
        assert_eq!(out, format!("See you at 2pm.{}", FOOTER));
    }

    #[test]
    fn test_greeting_prefix_when_name_present() {
        let out = format_reply("your car is ready.", Some("Dana"), 160, FOOTER).unwrap();
        assert!(out.starts_with("Hi Dana! your car is ready."));
        assert!(out.ends_with(FOOTER));
    }

    #[test]
    fn test_blank_name_skips_greeting() {
        let out = format_reply("your car is ready.", Some("   "), 160, FOOTER).unwrap();
        assert!(out.starts_with("your car is ready."));
    }

    #[test]
    fn test_long_body_truncated_with_ellipsis() {
        let body = "x".repeat(300);
        let out = format_reply(&body, None, 160, FOOTER).unwrap();
        assert_eq!(out.chars().count(), 160);
        assert!(out.ends_with(FOOTER));
        let footer_len = FOOTER.chars().count();
        let cut: String = out.chars().take(160 - footer_len).collect();
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_footer_always_appended() {
        let exactly_fits = "y".repeat(160 - FOOTER.chars().count());
        let out = format_reply(&exactly_fits, None, 160, FOOTER).unwrap();
        assert_eq!(out.chars().count(), 160);
        assert!(out.ends_with(FOOTER));
    }

    #[test]
    fn test_empty_body_rejected() {
        assert_eq!(format_reply("   ", None, 160, FOOTER), Err(FormatError::EmptyBody));
    }

    #[test]
    fn test_limit_too_small_for_footer() {
        let err = format_reply("hello there everyone", None, 10, FOOTER).unwrap_err();
        assert_eq!(err, FormatError::FooterExceedsLimit { limit: 10 });
    }

    #[test]
    fn test_truncation_counts_chars_not_bytes() {
        let body = "é".repeat(300);
        let out = format_reply(&body, None, 160, FOOTER).unwrap();
        assert_eq!(out.chars().count(), 160);
    }
}
