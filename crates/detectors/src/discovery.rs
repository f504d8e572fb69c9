//! Caption phrase mining for entity discovery
//!
//! Captions are tokenized into candidate noun phrases: stop words split the
//! caption into chunks, every 1-3 word window inside a chunk becomes a
//! candidate, scenery terms are blocked, and plurals are folded. Longer,
//! more descriptive phrases are preferred when the candidate list is capped.

use std::collections::HashSet;
use std::sync::OnceLock;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "of", "to", "in", "on", "at", "with", "for", "from", "by",
    "as", "is", "are", "was", "were", "this", "that", "these", "those", "it", "its", "their",
    "his", "her", "aerial", "view", "photo", "image", "picture", "scene", "background", "front",
    "back", "left", "right", "top", "bottom", "group", "people", "person", "man", "woman", "men",
    "women", "someone", "something", "large", "many", "over", "several", "some",
];

const BLOCKLIST: &[&str] = &[
    "sky", "water", "sea", "ocean", "cloud", "clouds", "ground", "field", "mountain",
    "mountains", "forest", "trees", "road", "grass",
];

/// Terms that gate discovery candidates when the domain-only filter is on
const DOMAIN_LEXICON: &[&str] = &[
    "military", "tank", "aircraft", "helicopter", "jet", "fighter", "missile", "drone",
    "artillery", "warship", "ship", "carrier", "soldier", "troop", "weapon", "rifle", "gun",
    "armored", "armoured", "convoy", "radar", "rocket", "submarine", "launcher", "uniform",
    "camouflage", "bomber", "apc", "vehicle", "personnel", "infantry", "navy", "army",
];

fn stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOPWORDS.iter().copied().collect())
}

fn blocklist() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| BLOCKLIST.iter().copied().collect())
}

/// True when a candidate touches the domain lexicon
#[must_use]
pub fn is_domain_term(label: &str) -> bool {
    label
        .split_whitespace()
        .any(|word| DOMAIN_LEXICON.contains(&word))
        || DOMAIN_LEXICON.iter().any(|term| label.contains(term))
}

fn singularize_phrase(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(|word| {
            if word.ends_with('s') && word.len() > 3 {
                &word[..word.len() - 1]
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Mine candidate entity phrases out of a generated caption
#[must_use]
pub fn extract_candidate_phrases(caption: &str, max_phrases: usize) -> Vec<String> {
    let text: String = caption
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    // Stop words delimit candidate chunks
    let mut chunks: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for token in text.split_whitespace() {
        if stopwords().contains(token) {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(token);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let mut seen = HashSet::new();
    let mut phrases = Vec::new();
    for chunk in &chunks {
        let max_n = chunk.len().min(3);
        for n in 1..=max_n {
            for window in chunk.windows(n) {
                let phrase = window.join(" ");
                if phrase.len() < 3
                    || blocklist().contains(phrase.as_str())
                    || phrase.chars().all(|c| c.is_ascii_digit())
                {
                    continue;
                }
                let normalized = singularize_phrase(&phrase);
                if normalized.is_empty() || blocklist().contains(normalized.as_str()) {
                    continue;
                }
                if seen.insert(normalized.clone()) {
                    phrases.push(normalized);
                }
            }
        }
    }

    // Longer phrases first, then lexicographic for determinism
    phrases.sort_by(|a, b| {
        b.split_whitespace()
            .count()
            .cmp(&a.split_whitespace().count())
            .then_with(|| a.cmp(b))
    });
    phrases.truncate(max_phrases);
    phrases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwords_delimit_chunks() {
        let phrases = extract_candidate_phrases("a military convoy on the road to the coast", 8);
        assert!(phrases.contains(&"military convoy".to_string()));
        // "road" is blocked scenery, "the"/"on"/"to" are stop words
        assert!(!phrases.iter().any(|p| p.contains("road")));
    }

    #[test]
    fn test_blocklist_and_digits() {
        let phrases = extract_candidate_phrases("clouds over water near 12345", 8);
        assert!(!phrases.contains(&"clouds".to_string()));
        assert!(!phrases.contains(&"water".to_string()));
        assert!(!phrases.iter().any(|p| p.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn test_plural_folding() {
        let phrases = extract_candidate_phrases("two fighter jets and tanks", 8);
        assert!(phrases.contains(&"fighter jet".to_string()));
        assert!(phrases.contains(&"tank".to_string()));
    }

    #[test]
    fn test_longer_phrases_preferred_under_cap() {
        let phrases = extract_candidate_phrases("armored personnel carrier near a tank", 2);
        assert_eq!(phrases.len(), 2);
        assert_eq!(phrases[0], "armored personnel carrier");
    }

    #[test]
    fn test_domain_lexicon() {
        assert!(is_domain_term("fighter jet"));
        assert!(is_domain_term("armored column"));
        assert!(!is_domain_term("birthday cake"));
    }
}
