//! Context-usage extraction from terminal output.
//!
//! The hosted CLIs report remaining context in a handful of phrasings. All
//! matching is case-insensitive and whitespace-tolerant; out-of-range
//! numbers are ignored, and when a chunk carries several markers the
//! largest valid one wins.

use std::sync::LazyLock;

use regex::Regex;

static PERCENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // "42% context", "42 % of context", "42% ctx"
        r"(?i)(\d{1,3})\s*%\s*(?:of\s+)?(?:context|ctx)\b",
        // "context: 42%", "context 42%"
        r"(?i)\bcontext\s*:?\s*(\d{1,3})\s*%",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("context percent regex"))
    .collect()
});

/// Extract the largest valid context percentage from `text`, if any.
pub fn extract_context_percent(text: &str) -> Option<u8> {
    let mut best: Option<u8> = None;
    for pattern in PERCENT_PATTERNS.iter() {
        for captures in pattern.captures_iter(text) {
            let Ok(value) = captures[1].parse::<u16>() else {
                continue;
            };
            if value > 100 {
                continue;
            }
            let value = value as u8;
            if best.map_or(true, |b| value > b) {
                best = Some(value);
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_pattern_families() {
        assert_eq!(extract_context_percent("45% context"), Some(45));
        assert_eq!(extract_context_percent("45% of context"), Some(45));
        assert_eq!(extract_context_percent("context: 45%"), Some(45));
        assert_eq!(extract_context_percent("context 45%"), Some(45));
        assert_eq!(extract_context_percent("45% ctx"), Some(45));
    }

    #[test]
    fn test_case_and_whitespace_tolerance() {
        assert_eq!(extract_context_percent("CONTEXT :  87 %"), Some(87));
        assert_eq!(extract_context_percent("12 %  Context left"), Some(12));
    }

    #[test]
    fn test_largest_valid_match_wins() {
        assert_eq!(
            extract_context_percent("was 45% context, now 72% context"),
            Some(72)
        );
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        assert_eq!(extract_context_percent("150% context"), None);
        assert_eq!(extract_context_percent("101% context"), None);
        assert_eq!(extract_context_percent("100% context"), Some(100));
        assert_eq!(extract_context_percent("0% context"), Some(0));
    }

    #[test]
    fn test_unrelated_percentages_do_not_match() {
        assert_eq!(extract_context_percent("progress 80% done"), None);
        assert_eq!(extract_context_percent("cpu at 97%"), None);
    }
}
