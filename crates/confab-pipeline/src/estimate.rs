use std::sync::Arc;

use confab_core::config::EstimatorKind;

/// Token-estimation strategy, fixed at startup.
///
/// No exact tokenizer is in play; both strategies are deliberate
/// approximations and the budgeting layer treats them as such.
pub trait TokenEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Estimated token count for a piece of text. Monotone in prefix
    /// length, which the instruction truncation's binary search relies on.
    fn estimate(&self, text: &str) -> u32;
}

/// Word-based approximation: English text runs ~4 tokens per 3 words.
pub struct WordpieceEstimator;

impl TokenEstimator for WordpieceEstimator {
    fn name(&self) -> &'static str {
        "wordpiece"
    }

    fn estimate(&self, text: &str) -> u32 {
        let words = text.split_whitespace().count() as u32;
        words.saturating_mul(4).div_ceil(3)
    }
}

/// Character heuristic: length / 3, rounded up.
pub struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn name(&self) -> &'static str {
        "chars"
    }

    fn estimate(&self, text: &str) -> u32 {
        (text.chars().count() as u32).div_ceil(3)
    }
}

pub fn build_estimator(kind: EstimatorKind) -> Arc<dyn TokenEstimator> {
    match kind {
        EstimatorKind::Wordpiece => Arc::new(WordpieceEstimator),
        EstimatorKind::Chars => Arc::new(CharEstimator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_free() {
        assert_eq!(WordpieceEstimator.estimate(""), 0);
        assert_eq!(CharEstimator.estimate(""), 0);
    }

    #[test]
    fn char_estimator_is_length_over_three() {
        assert_eq!(CharEstimator.estimate("abc"), 1);
        assert_eq!(CharEstimator.estimate("abcd"), 2);
        assert_eq!(CharEstimator.estimate(&"x".repeat(300)), 100);
    }

    #[test]
    fn wordpiece_scales_with_words() {
        assert_eq!(WordpieceEstimator.estimate("one two three"), 4);
        let fifty = vec!["word"; 50].join(" ");
        assert_eq!(WordpieceEstimator.estimate(&fifty), 67);
    }

    #[test]
    fn estimates_are_monotone_in_prefix_length() {
        let text = "the quick brown fox jumps over the lazy dog and keeps going";
        for est in [&WordpieceEstimator as &dyn TokenEstimator, &CharEstimator] {
            let mut prev = 0;
            for end in 0..=text.len() {
                if !text.is_char_boundary(end) {
                    continue;
                }
                let now = est.estimate(&text[..end]);
                assert!(now >= prev, "estimate dipped at prefix {end}");
                prev = now;
            }
        }
    }
}
