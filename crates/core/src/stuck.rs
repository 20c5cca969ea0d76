//! Repetitive-action detector for the agent loop.
//!
//! Keeps a rolling window of `(tool_name, input_fingerprint)` records and a
//! monotonic iteration counter. The verdict escalates in order: iteration
//! ceiling (terminate), identical call repeated (warn), single tool
//! monopolizing the loop (warn).

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

/// Consecutive identical (name, fingerprint) records that trigger a warning.
const SAME_INPUT_THRESHOLD: usize = 3;
/// Consecutive same-name records (any input) that trigger a warning.
const SINGLE_TOOL_THRESHOLD: usize = 10;
/// Window size — enough for the longest rule.
const HISTORY_CAP: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub is_stuck: bool,
    pub should_terminate: bool,
    pub message: Option<String>,
}

impl Verdict {
    fn clear() -> Self {
        Self { is_stuck: false, should_terminate: false, message: None }
    }

    fn warn(message: String) -> Self {
        Self { is_stuck: true, should_terminate: false, message: Some(message) }
    }

    fn terminate(message: String) -> Self {
        Self { is_stuck: true, should_terminate: true, message: Some(message) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    tool_name: String,
    fingerprint: u64,
}

pub struct StuckDetector {
    history: VecDeque<Record>,
    iteration: u32,
    max_iterations: u32,
}

impl StuckDetector {
    /// `max_iterations` is clamped into [1, 1000].
    pub fn new(max_iterations: u32) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAP),
            iteration: 0,
            max_iterations: max_iterations.clamp(1, 1000),
        }
    }

    /// Stable hash of the argument string; used only for equality.
    fn fingerprint(input: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        hasher.finish()
    }

    /// Record one tool call and bump the iteration counter.
    pub fn record(&mut self, tool_name: &str, input: &str) {
        self.iteration += 1;
        self.history.push_back(Record {
            tool_name: tool_name.to_string(),
            fingerprint: Self::fingerprint(input),
        });
        while self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Evaluate the rules in escalation order.
    pub fn check(&self) -> Verdict {
        if self.iteration >= self.max_iterations {
            return Verdict::terminate(format!(
                "reached max {} iterations",
                self.max_iterations
            ));
        }

        if self.history.len() >= SAME_INPUT_THRESHOLD {
            let tail: Vec<&Record> =
                self.history.iter().rev().take(SAME_INPUT_THRESHOLD).collect();
            if tail.iter().all(|r| **r == *tail[0]) {
                return Verdict::warn(format!(
                    "called {} with the same input {}x in a row, change approach",
                    tail[0].tool_name, SAME_INPUT_THRESHOLD
                ));
            }
        }

        if self.history.len() >= SINGLE_TOOL_THRESHOLD {
            let tail: Vec<&Record> =
                self.history.iter().rev().take(SINGLE_TOOL_THRESHOLD).collect();
            if tail.iter().all(|r| r.tool_name == tail[0].tool_name) {
                return Verdict::warn(format!(
                    "used {} {}x in a row, try another tool",
                    tail[0].tool_name, SINGLE_TOOL_THRESHOLD
                ));
            }
        }

        Verdict::clear()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.iteration = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_detector_is_clear() {
        let detector = StuckDetector::new(100);
        assert_eq!(detector.check(), Verdict::clear());
    }

    #[test]
    fn same_input_three_times_warns() {
        let mut detector = StuckDetector::new(100);
        detector.record("shell", "ls");
        detector.record("shell", "ls");
        assert!(!detector.check().is_stuck);
        detector.record("shell", "ls");

        let verdict = detector.check();
        assert!(verdict.is_stuck);
        assert!(!verdict.should_terminate);
        assert!(verdict.message.unwrap().contains("same input"));
    }

    #[test]
    fn different_input_breaks_the_streak() {
        let mut detector = StuckDetector::new(100);
        detector.record("shell", "ls");
        detector.record("shell", "ls");
        detector.record("shell", "pwd");
        assert!(!detector.check().is_stuck);
    }

    #[test]
    fn ten_same_tool_any_input_warns() {
        let mut detector = StuckDetector::new(100);
        for i in 0..10 {
            detector.record("web", &format!("https://example.com/{i}"));
        }
        let verdict = detector.check();
        assert!(verdict.is_stuck);
        assert!(!verdict.should_terminate);
        assert!(verdict.message.unwrap().contains("another tool"));
    }

    #[test]
    fn nine_same_tool_does_not_warn() {
        let mut detector = StuckDetector::new(100);
        for i in 0..9 {
            detector.record("web", &format!("https://example.com/{i}"));
        }
        assert!(!detector.check().is_stuck);
    }

    #[test]
    fn iteration_ceiling_terminates() {
        let mut detector = StuckDetector::new(3);
        detector.record("a", "1");
        detector.record("b", "2");
        assert!(!detector.check().should_terminate);
        detector.record("c", "3");

        let verdict = detector.check();
        assert!(verdict.is_stuck);
        assert!(verdict.should_terminate);
        assert!(verdict.message.unwrap().contains("max 3 iterations"));
    }

    #[test]
    fn max_iterations_is_clamped() {
        let detector = StuckDetector::new(0);
        assert_eq!(detector.max_iterations, 1);
        let detector = StuckDetector::new(5000);
        assert_eq!(detector.max_iterations, 1000);
    }

    #[test]
    fn ceiling_takes_precedence_over_warnings() {
        let mut detector = StuckDetector::new(3);
        detector.record("shell", "ls");
        detector.record("shell", "ls");
        detector.record("shell", "ls");
        let verdict = detector.check();
        assert!(verdict.should_terminate, "rule 1 wins over rule 2");
    }

    #[test]
    fn reset_clears_everything() {
        let mut detector = StuckDetector::new(100);
        for _ in 0..3 {
            detector.record("shell", "ls");
        }
        assert!(detector.check().is_stuck);
        detector.reset();
        assert_eq!(detector.iteration(), 0);
        assert!(!detector.check().is_stuck);
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(StuckDetector::fingerprint("abc"), StuckDetector::fingerprint("abc"));
        assert_ne!(StuckDetector::fingerprint("abc"), StuckDetector::fingerprint("abd"));
    }
}
