//! Token counting, encoding and truncation shared by every stage.
//!
//! The whole crate measures text with one encoding (cl100k_base) so chunk
//! boundaries and prompt budgets are reproducible between runs.

use tiktoken_rs::CoreBPE;
use tracing::debug;

use crate::error::TokenizerError;

/// Token id produced by the BPE encoder.
pub type Token = tiktoken_rs::Rank;

/// Encoding service used to measure and bound text length.
pub trait Tokenizer: Send + Sync {
    /// Encodes text into token ids.
    fn encode(&self, text: &str) -> Vec<Token>;

    /// Decodes token ids back into text.
    fn decode(&self, tokens: &[Token]) -> Result<String, TokenizerError>;

    /// Raw bytes behind `tokens`, which need not be valid UTF-8.
    fn decode_bytes(&self, tokens: &[Token]) -> Vec<u8>;

    /// Decodes `tokens`, replacing partial characters with U+FFFD.
    fn decode_lossy(&self, tokens: &[Token]) -> String {
        String::from_utf8_lossy(&self.decode_bytes(tokens)).into_owned()
    }

    /// Number of tokens in `text`.
    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    /// Keeps the first `max_tokens` tokens of `text`.
    ///
    /// Text already within budget is returned unchanged. When the cut lands
    /// inside a multi-byte character the cut moves left until it decodes.
    fn truncate(&self, text: &str, max_tokens: usize) -> Result<String, TokenizerError> {
        let tokens = self.encode(text);
        if tokens.len() <= max_tokens {
            return Ok(text.to_string());
        }
        if max_tokens == 0 {
            return Ok(String::new());
        }
        let (decoded, _) = decode_prefix(self, &tokens, 0, max_tokens);
        Ok(decoded)
    }
}

/// Decodes `tokens[start..end]`, shrinking `end` until the window decodes.
///
/// A window that cannot decode at any length (a lone character split across
/// more tokens than the budget allows) is decoded lossily in full, so the
/// result always covers at least one token. Returns the text and the
/// exclusive end that was actually used.
pub(crate) fn decode_prefix<T: Tokenizer + ?Sized>(
    tokenizer: &T,
    tokens: &[Token],
    start: usize,
    end: usize,
) -> (String, usize) {
    let mut cut = end;
    while cut > start {
        if let Ok(text) = tokenizer.decode(&tokens[start..cut]) {
            return (text, cut);
        }
        cut -= 1;
    }
    if end > start {
        debug!(start, end, "token window splits a character; decoding lossily");
    }
    (tokenizer.decode_lossy(&tokens[start..end]), end)
}

/// cl100k_base byte-pair encoder backed by `tiktoken-rs`.
pub struct BpeTokenizer {
    bpe: CoreBPE,
}

impl BpeTokenizer {
    /// Loads the cl100k_base encoding (the gpt-3.5-turbo / gpt-4 vocabulary).
    pub fn cl100k() -> Result<Self, TokenizerError> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|err| TokenizerError::Load(err.to_string()))?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<Token> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[Token]) -> Result<String, TokenizerError> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|err| TokenizerError::Decode {
                start: 0,
                end: tokens.len(),
                reason: err.to_string(),
            })
    }

    fn decode_bytes(&self, tokens: &[Token]) -> Vec<u8> {
        self.bpe
            ._decode_native_and_split(tokens.to_vec())
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bpe() -> BpeTokenizer {
        BpeTokenizer::cl100k().expect("cl100k vocabulary")
    }

    #[test]
    fn truncate_keeps_short_text_verbatim() {
        let tokenizer = bpe();
        let text = "Metformin 500 mg twice daily.";
        assert_eq!(tokenizer.truncate(text, 100).unwrap(), text);
    }

    #[test]
    fn truncate_bounds_token_count() {
        let tokenizer = bpe();
        let text = "blood pressure reading ".repeat(50);
        let clipped = tokenizer.truncate(&text, 12).unwrap();
        assert!(tokenizer.count_tokens(&clipped) <= 12);
        assert!(text.starts_with(&clipped));
    }

    #[test]
    fn truncate_to_zero_is_empty() {
        let tokenizer = bpe();
        assert_eq!(tokenizer.truncate("anything at all", 0).unwrap(), "");
    }

    #[test]
    fn truncate_never_splits_a_character() {
        let tokenizer = bpe();
        let text = "体温正常，血压稳定。".repeat(8);
        for budget in 4..20 {
            let clipped = tokenizer.truncate(&text, budget).unwrap();
            assert!(text.starts_with(&clipped), "budget {budget}");
            assert!(!clipped.is_empty());
        }
    }

    #[test]
    fn truncate_to_one_or_two_tokens_survives_split_characters() {
        let tokenizer = bpe();
        for text in ["患者有高血压病史", "🩺 vitals 🫀 ok"] {
            for budget in [1, 2] {
                let clipped = tokenizer.truncate(text, budget).unwrap();
                assert!(!clipped.is_empty(), "{text:?} at {budget}");
            }
        }
    }

    #[test]
    fn lossy_decode_marks_partial_characters() {
        let tokenizer = bpe();
        let tokens = tokenizer.encode("🩺");
        assert!(tokens.len() > 1);
        assert!(tokenizer.decode(&tokens[..1]).is_err());
        assert!(tokenizer.decode_lossy(&tokens[..1]).contains('\u{FFFD}'));
        assert_eq!(tokenizer.decode_lossy(&tokens), "🩺");
    }
}
