//! Deterministic token counting.
//!
//! Counts use the fixed cl100k byte-pair encoding so chunk sizes are
//! stable across machines and releases.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k tokenizer data is bundled"))
}

/// Token count of `text` under cl100k.
pub fn count_tokens(text: &str) -> usize {
    bpe().encode_with_special_tokens(text).len()
}

/// Split text on sentence boundaries, keeping terminators attached.
/// Newlines also terminate so list items split cleanly.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);

        let boundary = match c {
            '.' | '!' | '?' => chars.peek().is_none_or(|next| next.is_whitespace()),
            '\n' => true,
            _ => false,
        };

        if boundary && !current.trim().is_empty() {
            sentences.push(std::mem::take(&mut current));
        } else if boundary {
            current.clear();
        }
    }

    if !current.trim().is_empty() {
        sentences.push(current);
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_deterministic() {
        let text = "Reciprocal rank fusion combines two retrievers.";
        assert_eq!(count_tokens(text), count_tokens(text));
        assert!(count_tokens(text) > 0);
    }

    #[test]
    fn sentences_split_on_terminators() {
        let sentences = split_sentences("First. Second! Third?");
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0].trim(), "First.");
        assert_eq!(sentences[2].trim(), "Third?");
    }

    #[test]
    fn dotted_identifiers_do_not_split() {
        let sentences = split_sentences("Call foo.bar() today.");
        assert_eq!(sentences.len(), 1);
    }
}
