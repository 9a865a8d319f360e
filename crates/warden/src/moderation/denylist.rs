//! Fixed denylists for caption text and classifier tags.

use regex::RegexSet;
use std::sync::LazyLock;

/// Terms checked against captions and OCR output, whole-word.
pub(crate) const FORBIDDEN_TERMS: &[&str] = &[
    "наркота",
    "нарк",
    "меф",
    "мефедрон",
    "секс",
    "порно",
    "18+",
    "спайс",
    "гашиш",
    "кокаин",
    "марихуана",
    "травка",
    "закладк",
];

/// Classifier tags that count as a violation above the confidence threshold.
pub(crate) const FORBIDDEN_TAGS: &[&str] = &[
    "drugs",
    "narcotic",
    "weapon",
    "nude",
    "porn",
    "nsfw",
    "adult content",
];

static TERM_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(
        FORBIDDEN_TERMS
            .iter()
            .map(|term| format!(r"\b{}\b", regex::escape(term))),
    )
    .expect("denylist patterns are valid")
});

/// First denylisted term appearing in `text` as a whole word,
/// case-insensitively.
pub(crate) fn find_term(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    TERM_PATTERNS
        .matches(&lowered)
        .iter()
        .next()
        .map(|i| FORBIDDEN_TERMS[i])
}

/// The forbidden tag contained in a classifier tag name, if any.
pub(crate) fn matching_tag(name: &str) -> Option<&'static str> {
    let lowered = name.to_lowercase();
    FORBIDDEN_TAGS
        .iter()
        .copied()
        .find(|tag| lowered.contains(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_terms_as_whole_words() {
        assert_eq!(find_term("buy мефедрон now"), Some("мефедрон"));
        assert_eq!(find_term("ГАШИШ дешево"), Some("гашиш"));
        // Substrings of longer words do not count.
        assert_eq!(find_term("секстант для навигации"), None);
        assert_eq!(find_term("clean caption"), None);
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(find_term("ПОРНО"), Some("порно"));
    }

    #[test]
    fn tags_match_by_containment() {
        assert_eq!(matching_tag("Narcotic substance"), Some("narcotic"));
        assert_eq!(matching_tag("adult content warning"), Some("adult content"));
        assert_eq!(matching_tag("landscape"), None);
    }
}
