//! Pluggable token counting.
//!
//! The whole engine shares one estimator so budget math, compaction
//! metrics, and sampling agree with each other. The default is the
//! ceil(chars/4) heuristic; an exact tokenizer can be plugged in through
//! the trait.

use std::sync::Arc;

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
    fn name(&self) -> &str;
}

/// Default: ceil(chars/4) estimation (fast, no dependencies).
pub struct CharEstimateTokenizer;

impl Tokenizer for CharEstimateTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
    fn name(&self) -> &str {
        "char-estimate"
    }
}

/// Create a tokenizer by name. Unknown names fall back to char-estimate,
/// so callers can pass through user configuration untouched.
pub fn create_tokenizer(name: &str) -> Arc<dyn Tokenizer> {
    if name != "char-estimate" {
        tracing::debug!(tokenizer = name, "unknown tokenizer, using char-estimate");
    }
    Arc::new(CharEstimateTokenizer)
}
