//! Laughter markers in reply text

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

static LAUGHTER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:ha|he)(?:[\s-]?(?:ha|he))+h?\b|\b(?:lol|lmao|lmfao|rofl)\b|[😂🤣😆😹]",
    )
    .map_err(|e| tracing::error!(error = %e, "invalid laughter pattern"))
    .ok()
});

/// Character ranges of `text` that are laughter
#[must_use]
pub fn spans(text: &str) -> Vec<Range<usize>> {
    let Some(re) = LAUGHTER.as_ref() else {
        return Vec::new();
    };
    re.find_iter(text)
        .map(|m| {
            let start = text[..m.start()].chars().count();
            let len = m.as_str().chars().count();
            start..start + len
        })
        .collect()
}

/// Whether the character at `index` falls inside a laughter marker
#[must_use]
pub fn is_laughing_at(text: &str, index: usize) -> bool {
    spans(text).iter().any(|span| span.contains(&index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_repeated_syllables() {
        assert_eq!(spans("haha"), vec![0..4]);
        assert_eq!(spans("Ha ha ha!"), vec![0..8]);
        assert_eq!(spans("hehehe"), vec![0..6]);
        assert_eq!(spans("well hahah that"), vec![5..10]);
    }

    #[test]
    fn matches_abbreviations_and_emoji() {
        assert_eq!(spans("that is LOL funny"), vec![8..11]);
        assert_eq!(spans("ok 😂"), vec![3..4]);
    }

    #[test]
    fn ordinary_words_do_not_match() {
        assert!(spans("he helped the hat shop").is_empty());
        assert!(spans("a single ha is not laughter").is_empty());
        assert!(spans("lollipop").is_empty());
    }

    #[test]
    fn position_inside_span() {
        assert!(is_laughing_at("oh haha", 4));
        assert!(!is_laughing_at("oh haha", 1));
    }
}
