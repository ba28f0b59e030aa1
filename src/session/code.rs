//! Human-readable transfer codes

use std::fmt;

use rand::seq::SliceRandom;

use crate::transport::TransferId;

/// Number of words in a generated code
pub const CODE_WORDS: usize = 3;

const WORDS: &[&str] = &[
    "acorn", "amber", "anchor", "arrow", "aspen", "badge", "basil", "beacon", "birch", "bison",
    "cedar", "cobalt", "comet", "coral", "crane", "delta", "dune", "ember", "falcon", "fern",
    "fjord", "flint", "garnet", "glacier", "granite", "harbor", "hazel", "heron", "indigo",
    "iris", "jasper", "juniper", "kelp", "kestrel", "lagoon", "lantern", "lilac", "linen",
    "maple", "marble", "meadow", "mesa", "nectar", "nimbus", "oak", "onyx", "orbit", "otter",
    "pebble", "pepper", "pine", "plume", "quartz", "quill", "raven", "reef", "river", "saffron",
    "sage", "sierra", "slate", "sparrow", "spruce", "summit", "thistle", "tide", "timber",
    "topaz", "tundra", "umber", "valley", "velvet", "violet", "walnut", "willow", "yarrow",
    "zephyr", "zinc",
];

/// Short secret shared out of band between sender and receiver
///
/// Serves both as the rendezvous identifier (through [`TransferId`]) and as
/// the key-derivation input. Debug output never shows it.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferCode(String);

impl TransferCode {
    /// Generate a fresh code of dictionary words joined by `-`
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let words: Vec<&str> = WORDS.choose_multiple(&mut rng, CODE_WORDS).copied().collect();
        TransferCode(words.join("-"))
    }

    /// Normalize a code typed by a user
    ///
    /// Trims, lowercases, and joins whitespace-separated words with `-`, so
    /// "Amber Falcon  river" and "amber-falcon-river" are the same code.
    /// Strength is checked later, when the key is derived.
    pub fn parse(input: &str) -> Self {
        let normalized = input
            .trim()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-");
        TransferCode(normalized)
    }

    /// The code as typed on the other side
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rendezvous identifier for this code
    pub fn transfer_id(&self) -> TransferId {
        TransferId::derive(&self.0)
    }
}

impl fmt::Debug for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferCode([{} chars])", self.0.chars().count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MIN_CODE_LENGTH;

    #[test]
    fn test_generated_codes_are_word_triples() {
        for _ in 0..50 {
            let code = TransferCode::generate();
            let words: Vec<&str> = code.as_str().split('-').collect();
            assert_eq!(words.len(), CODE_WORDS);
            assert!(words.iter().all(|w| WORDS.contains(w)));
            assert!(code.as_str().chars().count() >= MIN_CODE_LENGTH);
        }
    }

    #[test]
    fn test_parse_normalizes_user_input() {
        let typed = TransferCode::parse("  Amber Falcon\triver ");
        assert_eq!(typed.as_str(), "amber-falcon-river");
        assert_eq!(typed, TransferCode::parse("amber-falcon-river"));
        assert_eq!(typed.transfer_id(), TransferId::derive("amber-falcon-river"));
    }

    #[test]
    fn test_debug_redacts_code() {
        let code = TransferCode::parse("amber-falcon-river");
        let shown = format!("{:?}", code);
        assert!(!shown.contains("falcon"));
    }

    #[test]
    fn test_word_list_is_lowercase_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for word in WORDS {
            assert_eq!(*word, word.to_lowercase());
            assert!(seen.insert(*word), "duplicate word {}", word);
        }
    }
}
