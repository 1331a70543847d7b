//! Secret masking for anything printed or logged.

use std::sync::OnceLock;

use regex::Regex;

const MASK: &str = "***";

fn json_secret_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)"(access_token|refresh_token|auth|webhook_code|client_secret)"\s*:\s*"[^"]*""#,
        )
        .expect("Invalid JSON secret regex")
    })
}

fn query_secret_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b(access_token|refresh_token|auth)=[^&\s"]+"#)
            .expect("Invalid query secret regex")
    })
}

/// Replace token values in JSON text and query strings with `***`.
pub fn mask_secrets(text: &str) -> String {
    let masked = json_secret_regex().replace_all(text, |caps: &regex::Captures<'_>| {
        format!("\"{}\":\"{MASK}\"", &caps[1])
    });
    query_secret_regex()
        .replace_all(&masked, |caps: &regex::Captures<'_>| format!("{}={MASK}", &caps[1]))
        .into_owned()
}

/// Constant-time comparison. Missing values never match.
pub fn secure_compare(expected: Option<&str>, provided: Option<&str>) -> bool {
    let (Some(expected), Some(provided)) = (expected, provided) else {
        return false;
    };
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_json_fields() {
        let text = r#"{"access_token": "abc123", "AUTH":"zzz", "title": "keep"}"#;
        let masked = mask_secrets(text);
        assert!(!masked.contains("abc123"));
        assert!(!masked.contains("zzz"));
        assert!(masked.contains(r#""access_token":"***""#));
        assert!(masked.contains(r#""title": "keep""#));
    }

    #[test]
    fn test_masks_query_strings() {
        let masked = mask_secrets("https://x.bitrix24.ru/rest/user.current?auth=tok&x=1");
        assert_eq!(masked, "https://x.bitrix24.ru/rest/user.current?auth=***&x=1");
        assert_eq!(mask_secrets("refresh_token=r1 done"), "refresh_token=*** done");
    }

    #[test]
    fn test_secure_compare() {
        assert!(secure_compare(Some("token"), Some("token")));
        assert!(!secure_compare(Some("token"), Some("tokeN")));
        assert!(!secure_compare(Some("token"), Some("tok")));
        assert!(!secure_compare(None, Some("token")));
        assert!(!secure_compare(Some("token"), None));
    }
}
