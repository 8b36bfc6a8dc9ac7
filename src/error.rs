//! Typed errors for the pure building blocks of the crate.
//!
//! Adapter boundaries (HTTP, Postgres, files) use `anyhow` with context
//! instead; these enums cover the parts callers may want to match on.

use thiserror::Error;

/// Failures surfaced by the tokenizer adapter and the chunker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenizerError {
    /// The BPE vocabulary could not be loaded.
    #[error("failed to load tokenizer encoding: {0}")]
    Load(String),
    /// A token window could not be turned back into UTF-8 text.
    #[error("tokens {start}..{end} do not decode to valid text: {reason}")]
    Decode {
        /// First token index of the failing window.
        start: usize,
        /// Exclusive end index of the failing window.
        end: usize,
        /// Decoder message.
        reason: String,
    },
    /// A zero-sized token budget was requested.
    #[error("token budget must be positive")]
    ZeroBudget,
}

/// Rejected summarizer or retrieval settings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric knob that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// The requested provider name is unknown.
    #[error("unsupported llm provider '{0}'; use openai or anthropic")]
    UnknownProvider(String),
    /// A required credential or endpoint was missing.
    #[error("missing {0}")]
    Missing(&'static str),
}
