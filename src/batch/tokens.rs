//! Token estimation.

use std::sync::LazyLock;

use regex::Regex;

static SYMBOLS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[.,!?;:(){}\[\]<>+\-*/=@#$%^&|~]").expect("static regex is valid")
});

/// Estimates how many model tokens a piece of text costs.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Whitespace-separated words plus one token per punctuation or operator
/// character. Cheap, and close enough for budgeting.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleTokenCounter;

impl TokenCounter for SimpleTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count() + SYMBOLS.find_iter(text).count()
    }
}

impl<F> TokenCounter for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count_tokens(&self, text: &str) -> usize {
        self(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn counts_words_and_symbols() {
        let counter = SimpleTokenCounter;
        assert_eq!(counter.count_tokens(""), 0);
        assert_eq!(counter.count_tokens("hello world"), 2);
        // 3 words + '(' ')' ';'
        assert_eq!(counter.count_tokens("let x = f();"), 4 + 4);
        assert_eq!(counter.count_tokens("src/lib.rs"), 1 + 2);
    }

    #[test]
    fn closures_are_counters() {
        let chars = |s: &str| s.len();
        assert_eq!(chars.count_tokens("abcd"), 4);
    }

    proptest! {
        #[test]
        fn concatenation_with_space_is_additive(a in "[a-z.;(){} ]{0,40}", b in "[a-z.;(){} ]{0,40}") {
            let counter = SimpleTokenCounter;
            let joined = format!("{a} {b}");
            prop_assert_eq!(
                counter.count_tokens(&joined),
                counter.count_tokens(&a) + counter.count_tokens(&b)
            );
        }
    }
}
