//! Input normalization: length cap, NFKC, keyword-case folding.

use unicode_normalization::UnicodeNormalization;

/// Normalized views of one input.
#[derive(Debug, Clone)]
pub struct NormalizedInput {
    /// NFKC-normalized text with original case (regex rules see this).
    pub text: String,
    /// Lowercased variant for the keyword automaton pass.
    pub lowered: String,
    /// True when the input exceeded the configured bound and was cut.
    pub truncated: bool,
}

/// Cap `input` at `max_chars` characters, then NFKC-normalize.
///
/// The cap is applied on character count before normalization so an
/// attacker cannot smuggle extra content past the bound via expanding
/// compatibility forms.
pub fn normalize(input: &str, max_chars: usize) -> NormalizedInput {
    let (capped, truncated) = match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (&input[..byte_idx], true),
        None => (input, false),
    };

    let text: String = capped.nfkc().collect();
    let lowered = text.to_lowercase();

    NormalizedInput {
        text,
        lowered,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_input_untouched() {
        let n = normalize("Hello World", 100);
        assert_eq!(n.text, "Hello World");
        assert_eq!(n.lowered, "hello world");
        assert!(!n.truncated);
    }

    #[test]
    fn test_exact_length_not_truncated() {
        let n = normalize("abcde", 5);
        assert_eq!(n.text, "abcde");
        assert!(!n.truncated);
    }

    #[test]
    fn test_over_length_truncated() {
        let n = normalize("abcdef", 5);
        assert_eq!(n.text, "abcde");
        assert!(n.truncated);
    }

    #[test]
    fn test_nfkc_folds_compatibility_forms() {
        // Fullwidth letters fold to ASCII under NFKC.
        let n = normalize("ｂｏｍｂ", 100);
        assert_eq!(n.lowered, "bomb");
    }

    #[test]
    fn test_multibyte_cap_respects_char_boundaries() {
        let n = normalize("héllo wörld", 4);
        assert_eq!(n.text.chars().count(), 4);
        assert!(n.truncated);
    }
}
