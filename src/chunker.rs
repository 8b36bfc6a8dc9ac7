//! Token-bounded splitting of long record text.

use serde::Serialize;

use crate::error::TokenizerError;
use crate::tokenizer::{decode_prefix, Tokenizer};

/// Contiguous token window of a larger text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    /// Position of the chunk in the source text (0-based).
    pub index: usize,
    /// Decoded chunk text.
    pub text: String,
    /// Number of source tokens the chunk covers.
    pub token_count: usize,
}

/// Splits `text` into consecutive windows of at most `max_tokens` tokens.
///
/// The text is encoded once and walked in non-overlapping windows; the last
/// window may be shorter. Boundaries follow the encoding only, so a split can
/// land mid-sentence. A budget too small to hold a whole character still
/// advances, with the partial character rendered as U+FFFD. Empty input
/// yields no chunks.
pub fn chunk_text<T: Tokenizer + ?Sized>(
    tokenizer: &T,
    text: &str,
    max_tokens: usize,
) -> Result<Vec<TextChunk>, TokenizerError> {
    if max_tokens == 0 {
        return Err(TokenizerError::ZeroBudget);
    }
    let tokens = tokenizer.encode(text);
    let mut chunks = Vec::with_capacity(tokens.len().div_ceil(max_tokens));
    let mut start = 0usize;
    while start < tokens.len() {
        let end = (start + max_tokens).min(tokens.len());
        let (decoded, used_end) = decode_prefix(tokenizer, &tokens, start, end);
        chunks.push(TextChunk {
            index: chunks.len(),
            text: decoded,
            token_count: used_end - start,
        });
        start = used_end;
    }
    Ok(chunks)
}
