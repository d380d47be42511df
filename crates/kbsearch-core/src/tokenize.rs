//! Pluggable tokenization used for lexical indexing, lexical queries and
//! term-coverage scoring.

use std::collections::HashSet;

pub trait Tokenizer: Send + Sync {
    /// Lower-cased tokens in document order. Punctuation never appears.
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Word-boundary tokenizer with a single-character fallback for CJK scripts.
///
/// Alphanumeric runs form one token; every CJK ideograph, kana or hangul
/// syllable is emitted as its own token since those scripts carry no spaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTokenizer;

impl Tokenizer for DefaultTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut word = String::new();
        for ch in text.chars() {
            if is_cjk(ch) {
                flush(&mut word, &mut tokens);
                tokens.push(ch.to_lowercase().collect());
            } else if ch.is_alphanumeric() {
                word.extend(ch.to_lowercase());
            } else {
                flush(&mut word, &mut tokens);
            }
        }
        flush(&mut word, &mut tokens);
        tokens
    }
}

fn flush(word: &mut String, tokens: &mut Vec<String>) {
    if !word.is_empty() {
        tokens.push(std::mem::take(word));
    }
}

pub fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF      // hiragana, katakana
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified ideographs
        | 0xAC00..=0xD7AF    // hangul syllables
        | 0xF900..=0xFAFF    // CJK compatibility ideographs
        | 0x20000..=0x2FFFF) // CJK extensions B+
}

/// Distinct query terms that count towards coverage.
///
/// Terms shorter than two characters are ignored unless nothing else is left,
/// so a single-ideograph query still has something to cover.
pub fn significant_terms(tokens: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let distinct: Vec<String> = tokens.iter().filter(|t| seen.insert(t.as_str())).cloned().collect();
    let long: Vec<String> = distinct.iter().filter(|t| t.chars().count() >= 2).cloned().collect();
    if long.is_empty() { distinct } else { long }
}

/// Fraction of `terms` present in `token_set`; 0.0 when there are no terms.
pub fn term_coverage(terms: &[String], token_set: &HashSet<&str>) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let hit = terms.iter().filter(|t| token_set.contains(t.as_str())).count();
    hit as f64 / terms.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_punctuation_and_lowercases() {
        let t = DefaultTokenizer.tokenize("Manager-approval, REQUIRED!! ... (v2)");
        assert_eq!(t, vec!["manager", "approval", "required", "v2"]);
    }

    #[test]
    fn cjk_falls_back_to_single_characters() {
        let t = DefaultTokenizer.tokenize("审批流程 requires 承認");
        assert_eq!(t, vec!["审", "批", "流", "程", "requires", "承", "認"]);
    }

    #[test]
    fn pure_punctuation_yields_nothing() {
        assert!(DefaultTokenizer.tokenize("--- !!! ...").is_empty());
    }

    #[test]
    fn significant_terms_drop_short_tokens_unless_nothing_remains() {
        let toks: Vec<String> = ["a", "invoice", "a", "of", "x"].iter().map(|s| s.to_string()).collect();
        assert_eq!(significant_terms(&toks), vec!["invoice", "of"]);
        let short: Vec<String> = ["审", "批", "审"].iter().map(|s| s.to_string()).collect();
        assert_eq!(significant_terms(&short), vec!["审", "批"]);
    }

    #[test]
    fn coverage_counts_distinct_hits() {
        let terms: Vec<String> = ["manager", "approval", "workflow"].iter().map(|s| s.to_string()).collect();
        let set: HashSet<&str> = ["manager", "approval", "payment"].into_iter().collect();
        assert!((term_coverage(&terms, &set) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(term_coverage(&[], &set), 0.0);
    }
}
