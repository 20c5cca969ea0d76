//! Pure heuristics behind the consciousness driver: word tokenization,
//! set-overlap ratio, repetition detection over recent task descriptions
//! and fakery detection over recent thoughts.

use std::collections::HashSet;

/// Two of the last-five comparisons above this overlap means repetition.
const REPEAT_OVERLAP: f64 = 0.5;
const REPEAT_VOTES: usize = 2;
/// Task synthesis rejects candidates overlapping recent work this much.
pub const SYNTHESIS_OVERLAP_CAP: f64 = 0.4;
const MIN_TOKEN_LEN: usize = 3;

/// Default word predicate: Latin letters and Hangul syllables. The
/// predicate is a parameter so other scripts can plug in their own.
pub fn default_word_char(c: char) -> bool {
    c.is_ascii_alphabetic() || ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

/// Split into lowercase word tokens of at least three characters,
/// using `is_word_char` to delimit words.
pub fn tokenize(text: &str, is_word_char: impl Fn(char) -> bool) -> Vec<String> {
    text.split(|c: char| !is_word_char(c))
        .filter(|w| w.chars().count() >= MIN_TOKEN_LEN)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Jaccard-style overlap of two token lists: shared distinct tokens over
/// the smaller distinct set. Empty input on either side is zero overlap.
pub fn overlap_ratio(a: &[String], b: &[String]) -> f64 {
    let set_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = b.iter().map(String::as_str).collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let shared = set_a.intersection(&set_b).count();
    shared as f64 / set_a.len().min(set_b.len()) as f64
}

/// Repetition over recent task descriptions (newest first): the newest is
/// compared to each of the others; two or more comparisons above 50%
/// token overlap is a repeat.
pub fn is_repeating(descriptions: &[String]) -> bool {
    let Some((newest, rest)) = descriptions.split_first() else { return false };
    let newest_tokens = tokenize(newest, default_word_char);
    if newest_tokens.is_empty() {
        return false;
    }
    let votes = rest
        .iter()
        .map(|d| overlap_ratio(&newest_tokens, &tokenize(d, default_word_char)))
        .filter(|&r| r > REPEAT_OVERLAP)
        .count();
    votes >= REPEAT_VOTES
}

/// Terms that mark a thought as going through the motions instead of
/// producing real work.
const FAKERY_TERMS: [&str; 10] = [
    "example.com",
    "lorem ipsum",
    "placeholder",
    "mock data",
    "dummy data",
    "fake data",
    "sample output",
    "simulated result",
    "pretend",
    "hypothetical deliverable",
];

/// Fakery over recent thoughts: any substring hit counts.
pub fn is_faking(thoughts: &[String]) -> bool {
    thoughts.iter().any(|t| {
        let lower = t.to_lowercase();
        FAKERY_TERMS.iter().any(|term| lower.contains(term))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_short_words_and_lowercases() {
        let tokens = tokenize("Fix the DB at 9am", default_word_char);
        assert_eq!(tokens, vec!["fix", "the"]);
    }

    #[test]
    fn tokenize_handles_hangul() {
        let tokens = tokenize("데이터베이스 백업 실행 go", default_word_char);
        assert!(tokens.contains(&"데이터베이스".to_string()));
        assert!(tokens.contains(&"백업".to_string()));
        // "go" is under three characters.
        assert!(!tokens.contains(&"go".to_string()));
    }

    #[test]
    fn custom_word_predicate_is_honored() {
        // Digits count as word characters here.
        let tokens = tokenize("abc123 x9", |c: char| c.is_ascii_alphanumeric());
        assert_eq!(tokens, vec!["abc123"]);
    }

    #[test]
    fn overlap_of_identical_lists_is_one() {
        let a = tokenize("analyze the logs", default_word_char);
        assert_eq!(overlap_ratio(&a, &a), 1.0);
    }

    #[test]
    fn overlap_of_disjoint_lists_is_zero() {
        let a = tokenize("analyze server logs", default_word_char);
        let b = tokenize("bake sourdough bread", default_word_char);
        assert_eq!(overlap_ratio(&a, &b), 0.0);
    }

    #[test]
    fn empty_side_gives_zero() {
        let a = tokenize("analyze", default_word_char);
        assert_eq!(overlap_ratio(&a, &[]), 0.0);
        assert_eq!(overlap_ratio(&[], &a), 0.0);
    }

    #[test]
    fn repetition_needs_two_similar_entries() {
        let history = vec![
            "summarize the latest research papers".to_string(),
            "summarize the latest research findings".to_string(),
            "bake a loaf of bread".to_string(),
        ];
        // Only one similar older entry — not repeating yet.
        assert!(!is_repeating(&history));

        let history = vec![
            "summarize the latest research papers".to_string(),
            "summarize the latest research findings".to_string(),
            "summarize recent research papers again".to_string(),
            "bake a loaf of bread".to_string(),
        ];
        assert!(is_repeating(&history));
    }

    #[test]
    fn varied_work_is_not_repetition() {
        let history = vec![
            "write a markdown report on disk usage".to_string(),
            "fetch weather data from the api".to_string(),
            "clean up old screenshots".to_string(),
            "learn about sqlite indexes".to_string(),
        ];
        assert!(!is_repeating(&history));
    }

    #[test]
    fn empty_history_is_not_repetition() {
        assert!(!is_repeating(&[]));
        assert!(!is_repeating(&["only one".to_string()]));
    }

    #[test]
    fn fakery_dictionary_hits() {
        assert!(is_faking(&["I created a placeholder report for now".to_string()]));
        assert!(is_faking(&["fetched https://example.com as a test".to_string()]));
        assert!(is_faking(&["filled it with Lorem Ipsum text".to_string()]));
        assert!(!is_faking(&["wrote the disk usage report to report.md".to_string()]));
        assert!(!is_faking(&[]));
    }
}
