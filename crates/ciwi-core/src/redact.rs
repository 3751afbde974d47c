//! Masking of sensitive values in job output.

pub const MASK: &str = "***";

/// Replace every non-empty sensitive value in `text` with `***`.
///
/// Longer values are masked first so a secret containing another secret is
/// hidden whole.
pub fn redact(text: &str, sensitive: &[String]) -> String {
    let mut values: Vec<&str> = sensitive
        .iter()
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .collect();
    if values.is_empty() {
        return text.to_string();
    }
    values.sort_by_key(|v| std::cmp::Reverse(v.len()));
    let mut masked = text.to_string();
    for value in values {
        masked = masked.replace(value, MASK);
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_masks_all_occurrences() {
        let secrets = vec!["s3cret".to_string()];
        assert_eq!(redact("a s3cret b s3cret", &secrets), "a *** b ***");
    }

    #[test]
    fn test_redact_prefers_longer_values() {
        let secrets = vec!["abc".to_string(), "abcdef".to_string()];
        assert_eq!(redact("xabcdefx", &secrets), "x***x");
    }

    #[test]
    fn test_redact_ignores_blank_values() {
        let secrets = vec![String::new(), "  ".to_string()];
        assert_eq!(redact("keep me", &secrets), "keep me");
    }
}
