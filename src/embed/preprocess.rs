//! Text preprocessing for embedding input.
//!
//! Applied to catalog documents at build time and to queries at request
//! time, so both sides of the similarity comparison see the same
//! vocabulary:
//! 1. Collapse whitespace
//! 2. Fold possessives and connector symbols ("men's" -> "mens", "&" -> "and")
//! 3. Cap very long documents, keeping head and tail words

/// Word cap for embedding input; models truncate around this anyway.
const MAX_WORDS: usize = 256;

/// Words kept from each end when a document exceeds [`MAX_WORDS`].
const KEEP_EACH_END: usize = 128;

/// Prepare a text for the embedder. Empty input maps to an empty string;
/// callers decide whether that is an error.
pub fn prepare(text: &str) -> String {
    let mut processed = text.trim().to_string();

    for (from, to) in [
        ("\u{2019}", "'"),
        ("men's", "mens"),
        ("Men's", "Mens"),
        ("women's", "womens"),
        ("Women's", "Womens"),
        ("children's", "childrens"),
        ("&", " and "),
        ("+", " and "),
        ("/", " "),
    ] {
        processed = processed.replace(from, to);
    }

    let words: Vec<&str> = processed.split_whitespace().collect();
    if words.len() > MAX_WORDS {
        let head = &words[..KEEP_EACH_END];
        let tail = &words[words.len() - KEEP_EACH_END..];
        return format!("{} {}", head.join(" "), tail.join(" "));
    }

    words.join(" ")
}

/// Prepare a batch, order-preserving.
pub fn prepare_all(texts: &[String]) -> Vec<String> {
    texts.iter().map(|t| prepare(t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapses_whitespace() {
        assert_eq!(prepare("  red   jacket \n"), "red jacket");
    }

    #[test]
    fn test_folds_possessives() {
        assert_eq!(prepare("Men's running shoes"), "Mens running shoes");
        assert_eq!(prepare("women's dress"), "womens dress");
    }

    #[test]
    fn test_folds_unicode_apostrophe() {
        assert_eq!(prepare("men\u{2019}s boots"), "mens boots");
    }

    #[test]
    fn test_replaces_connectors() {
        assert_eq!(prepare("shirts & ties"), "shirts and ties");
        assert_eq!(prepare("tops/bottoms"), "tops bottoms");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(prepare("   "), "");
    }

    #[test]
    fn test_long_input_keeps_head_and_tail() {
        let words: Vec<String> = (0..400).map(|i| format!("w{i}")).collect();
        let prepared = prepare(&words.join(" "));
        let kept: Vec<&str> = prepared.split_whitespace().collect();
        assert_eq!(kept.len(), 2 * KEEP_EACH_END);
        assert_eq!(kept[0], "w0");
        assert_eq!(kept[kept.len() - 1], "w399");
    }

    #[test]
    fn test_prepare_all_preserves_order() {
        let texts = vec!["a  b".to_string(), "c".to_string()];
        assert_eq!(prepare_all(&texts), vec!["a b", "c"]);
    }
}
