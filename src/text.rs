//! Lightweight text normalization shared by the extractor, the hashing
//! embedder and keyword query building.

const STOPWORDS: &[&str] = &[
    "a", "about", "actually", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does",
    "for", "from", "has", "have", "how", "i", "in", "is", "it", "its", "me", "my", "of", "on",
    "or", "our", "that", "the", "this", "to", "was", "we", "were", "what", "when", "where",
    "which", "who", "why", "with", "you", "your",
];

/// True for short function words that carry no retrieval signal.
pub fn is_stopword(word: &str) -> bool {
    let lowered = word
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    STOPWORDS.binary_search(&lowered.as_str()).is_ok()
}

/// Lowercased alphanumeric tokens, apostrophes folded away (`user's` -> `users`).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '\u{2019}'))
        .map(|raw| {
            raw.chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Collapse whitespace and trim trailing sentence punctuation.
pub fn clean_value(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ',' | ';' | ':'))
        .trim()
        .to_string()
}

/// Case- and punctuation-insensitive key used to compare subjects and values.
pub fn normalize_key(raw: &str) -> String {
    tokenize(raw).join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwords_sorted() {
        let mut sorted = STOPWORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOPWORDS);
    }

    #[test]
    fn test_is_stopword() {
        assert!(is_stopword("What"));
        assert!(is_stopword("my,"));
        assert!(!is_stopword("color"));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("User's favorite Color is BLUE!"),
            vec!["users", "favorite", "color", "is", "blue"]
        );
    }

    #[test]
    fn test_clean_value() {
        assert_eq!(clean_value("  dark   blue. "), "dark blue");
        assert_eq!(clean_value("Oslo!?"), "Oslo");
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("Favorite  Color"), "favorite color");
        assert_eq!(normalize_key("Blue."), "blue");
    }
}
