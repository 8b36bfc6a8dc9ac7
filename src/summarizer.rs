//! Hierarchical map-reduce summarization over token-bounded chunks.
//!
//! The run is strictly sequential: every chunk is mapped in index order, the
//! partial summaries are merged in fixed-size batches, and a capped number of
//! intermediates feeds one final call. Every LLM call is attempted once and a
//! failure only replaces the output of its own unit with a placeholder.
//! Intermediates beyond the final fan-in cap are left out of the final
//! summary.

use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::chunker::TextChunk;
use crate::error::ConfigError;
use crate::llm::{attempt, Completion, LlmClient};
use crate::progress::ProgressSink;
use crate::prompts;
use crate::tokenizer::Tokenizer;

/// Result text of a final stage that had no input at all.
pub const NO_DATA: &str = "No data found.";

/// Token budgets and batch shape of a summarization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryConfig {
    /// Token size of map-stage chunks.
    pub chunk_tokens: usize,
    /// Number of partial summaries merged per reduce call.
    pub batch_size: usize,
    /// Budget each partial summary is truncated to inside a merge prompt.
    pub batch_member_tokens: usize,
    /// How many intermediates feed the final call.
    pub final_fanin: usize,
    /// Budget each intermediate is truncated to inside the final prompt.
    pub final_member_tokens: usize,
    /// Input budget of one per-resource-type section prompt.
    pub section_tokens: usize,
    /// Input budget of the overview built from section summaries.
    pub sections_final_tokens: usize,
    /// Word limit applied to section summaries.
    pub max_words: usize,
    /// Sentence limit applied to section summaries.
    pub max_sentences: usize,
    /// Optional cap on the number of chunks that are mapped.
    pub max_chunks: Option<usize>,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: 1500,
            batch_size: 4,
            batch_member_tokens: 700,
            final_fanin: 2,
            final_member_tokens: 450,
            section_tokens: 1500,
            sections_final_tokens: 2000,
            max_words: 100,
            max_sentences: 5,
            max_chunks: None,
        }
    }
}

impl SummaryConfig {
    /// Rejects zero budgets and batch sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("chunk_tokens", self.chunk_tokens),
            ("batch_size", self.batch_size),
            ("batch_member_tokens", self.batch_member_tokens),
            ("final_fanin", self.final_fanin),
            ("final_member_tokens", self.final_member_tokens),
            ("section_tokens", self.section_tokens),
            ("sections_final_tokens", self.sections_final_tokens),
            ("max_words", self.max_words),
            ("max_sentences", self.max_sentences),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.max_chunks == Some(0) {
            return Err(ConfigError::Zero("max_chunks"));
        }
        Ok(())
    }
}

/// Where a summary came from; display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Provenance {
    /// Map stage output for chunk `n` (0-based).
    Chunk(usize),
    /// Reduce stage output for batch `n` (0-based).
    Batch(usize),
    /// Section summary for one resource type.
    ResourceType(String),
    /// Terminal summary.
    Final,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunk(i) => write!(f, "Chunk {}", i + 1),
            Self::Batch(i) => write!(f, "Intermediate summary {}", i + 1),
            Self::ResourceType(kind) => write!(f, "{kind} summary"),
            Self::Final => f.write_str("Final summary"),
        }
    }
}

/// Text produced by one summarization unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Summary text or a placeholder.
    pub text: String,
    /// Which unit produced it.
    pub provenance: Provenance,
    /// True when `text` is a failure placeholder.
    pub failed: bool,
}

impl Summary {
    pub(crate) fn content(text: String, provenance: Provenance) -> Self {
        Self {
            text,
            provenance,
            failed: false,
        }
    }

    pub(crate) fn placeholder(text: String, provenance: Provenance) -> Self {
        Self {
            text,
            provenance,
            failed: true,
        }
    }
}

/// Everything a map-reduce run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryReport {
    /// One summary per mapped chunk, in chunk order.
    pub partials: Vec<Summary>,
    /// One summary per reduce batch, in batch order.
    pub intermediates: Vec<Summary>,
    /// The terminal summary.
    pub final_summary: Summary,
}

impl SummaryReport {
    /// Number of units that ended in a placeholder.
    pub fn failed_units(&self) -> usize {
        self.partials
            .iter()
            .chain(&self.intermediates)
            .chain(std::iter::once(&self.final_summary))
            .filter(|summary| summary.failed)
            .count()
    }
}

/// Placeholder for a failed map call.
pub fn chunk_failed_marker(index: usize) -> String {
    format!("[chunk {} summarization failed]", index + 1)
}

/// Placeholder for a failed merge call.
pub fn batch_failed_marker(index: usize) -> String {
    format!("[batch {} summarization failed]", index + 1)
}

/// Placeholder for a failed final call.
pub const FINAL_FAILED_MARKER: &str = "[final summary could not be generated]";

/// Placeholder for a failed section call.
pub fn section_failed_marker(resource_type: &str) -> String {
    format!("[summarization failed for {resource_type}]")
}

/// Note shown for a resource type with no usable rows.
pub fn no_section_data(resource_type: &str) -> String {
    format!("No {resource_type} data found.")
}

/// Map-reduce engine over an injected LLM client and tokenizer.
#[derive(Clone)]
pub struct HierarchicalSummarizer {
    llm: Arc<dyn LlmClient>,
    tokenizer: Arc<dyn Tokenizer>,
    config: SummaryConfig,
}

impl HierarchicalSummarizer {
    /// Builds a summarizer after validating `config`.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tokenizer: Arc<dyn Tokenizer>,
        config: SummaryConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            llm,
            tokenizer,
            config,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &SummaryConfig {
        &self.config
    }

    /// Tokenizer used for every budget.
    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Applies `max_chunks` to a chunk list.
    pub fn limit_chunks<'a>(&self, chunks: &'a [TextChunk]) -> &'a [TextChunk] {
        match self.config.max_chunks {
            Some(cap) if cap < chunks.len() => &chunks[..cap],
            _ => chunks,
        }
    }

    /// Map stage for one chunk.
    pub fn map_chunk(&self, chunk: &TextChunk, total: usize) -> Summary {
        let unit = format!("chunk {}", chunk.index + 1);
        let prompt = prompts::chunk_prompt(&chunk.text, chunk.index, total);
        self.call(&unit, &prompt, Provenance::Chunk(chunk.index), || {
            chunk_failed_marker(chunk.index)
        })
    }

    /// Splits partial summaries into consecutive reduce batches.
    pub fn batches<'a>(&self, partials: &'a [Summary]) -> std::slice::Chunks<'a, Summary> {
        partials.chunks(self.config.batch_size)
    }

    /// Reduce stage for one batch of partial summaries.
    pub fn merge_batch(&self, index: usize, members: &[Summary]) -> Summary {
        let unit = format!("batch {}", index + 1);
        let Some(joined) = self.join_clipped(&unit, members, self.config.batch_member_tokens) else {
            return Summary::placeholder(batch_failed_marker(index), Provenance::Batch(index));
        };
        let prompt = prompts::merge_prompt(&joined, index);
        self.call(&unit, &prompt, Provenance::Batch(index), || batch_failed_marker(index))
    }

    /// Final stage over at most `final_fanin` intermediates.
    ///
    /// With no intermediates at all the result is [`NO_DATA`] and the LLM is
    /// not called.
    pub fn finalize(&self, intermediates: &[Summary]) -> Summary {
        if intermediates.is_empty() {
            return Summary::content(NO_DATA.to_string(), Provenance::Final);
        }
        let used = &intermediates[..intermediates.len().min(self.config.final_fanin)];
        if used.len() < intermediates.len() {
            info!(
                used = used.len(),
                dropped = intermediates.len() - used.len(),
                "final fan-in cap reached"
            );
        }
        let Some(joined) = self.join_clipped("final", used, self.config.final_member_tokens) else {
            return Summary::placeholder(FINAL_FAILED_MARKER.to_string(), Provenance::Final);
        };
        let prompt = prompts::final_prompt(&joined);
        self.call("final", &prompt, Provenance::Final, || FINAL_FAILED_MARKER.to_string())
    }

    /// Runs map, reduce and final stages synchronously.
    pub fn run(&self, chunks: &[TextChunk], progress: &mut dyn ProgressSink) -> SummaryReport {
        let chunks = self.limit_chunks(chunks);

        progress.start_stage("map", chunks.len());
        let mut partials = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let summary = self.map_chunk(chunk, chunks.len());
            progress.publish(&summary.provenance.to_string(), &summary.text);
            progress.advance(1);
            partials.push(summary);
        }

        let batch_count = partials.len().div_ceil(self.config.batch_size);
        progress.start_stage("reduce", batch_count);
        let mut intermediates = Vec::with_capacity(batch_count);
        for (index, batch) in self.batches(&partials).enumerate() {
            let summary = self.merge_batch(index, batch);
            progress.publish(&summary.provenance.to_string(), &summary.text);
            progress.advance(1);
            intermediates.push(summary);
        }

        progress.start_stage("final", 1);
        let final_summary = self.finalize(&intermediates);
        progress.publish(&final_summary.provenance.to_string(), &final_summary.text);
        progress.advance(1);

        SummaryReport {
            partials,
            intermediates,
            final_summary,
        }
    }

    /// Section summary for one resource type from its normalized row texts.
    ///
    /// No texts means no LLM call and a "no data found" note.
    pub fn summarize_section(&self, resource_type: &str, texts: &[String]) -> Summary {
        let provenance = Provenance::ResourceType(resource_type.to_string());
        if texts.is_empty() {
            info!(resource_type, "no usable rows; skipping section");
            return Summary::content(no_section_data(resource_type), provenance);
        }
        let joined = texts.join("\n");
        let context = match self.tokenizer.truncate(&joined, self.config.section_tokens) {
            Ok(context) => context,
            Err(err) => {
                warn!(resource_type, error = %err, "section truncation failed");
                return Summary::placeholder(section_failed_marker(resource_type), provenance);
            }
        };
        let prompt = prompts::section_prompt(
            resource_type,
            &context,
            self.config.max_words,
            self.config.max_sentences,
        );
        let mut summary = self.call(resource_type, &prompt, provenance, || {
            section_failed_marker(resource_type)
        });
        if !summary.failed {
            summary.text = enforce_length(&summary.text, self.config.max_words, self.config.max_sentences);
        }
        summary
    }

    /// Overview from section summaries; skipped sections must be filtered out
    /// by the caller. No sections yields [`NO_DATA`] without an LLM call.
    pub fn combine_sections(&self, sections: &[Summary]) -> Summary {
        if sections.is_empty() {
            return Summary::content(NO_DATA.to_string(), Provenance::Final);
        }
        let joined = sections
            .iter()
            .map(|section| section.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let context = match self.tokenizer.truncate(&joined, self.config.sections_final_tokens) {
            Ok(context) => context,
            Err(err) => {
                warn!(error = %err, "overview truncation failed");
                return Summary::placeholder(FINAL_FAILED_MARKER.to_string(), Provenance::Final);
            }
        };
        let prompt = prompts::sections_final_prompt(&context);
        self.call("overview", &prompt, Provenance::Final, || FINAL_FAILED_MARKER.to_string())
    }

    fn join_clipped(&self, unit: &str, members: &[Summary], budget: usize) -> Option<String> {
        let mut clipped = Vec::with_capacity(members.len());
        for member in members {
            match self.tokenizer.truncate(&member.text, budget) {
                Ok(text) => clipped.push(text),
                Err(err) => {
                    warn!(unit, error = %err, "member truncation failed");
                    return None;
                }
            }
        }
        Some(clipped.join("\n\n"))
    }

    fn call(
        &self,
        unit: &str,
        prompt: &str,
        provenance: Provenance,
        marker: impl FnOnce() -> String,
    ) -> Summary {
        match attempt(self.llm.as_ref(), unit, prompt) {
            Completion::Content(text) => Summary::content(text, provenance),
            Completion::Failed(_) => Summary::placeholder(marker(), provenance),
        }
    }
}

fn sentence_break() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[.!?]\s+").ok()).as_ref()
}

/// Trims `text` to `max_words` words, then to `max_sentences` sentences,
/// appending `...` whenever something was cut.
pub fn enforce_length(text: &str, max_words: usize, max_sentences: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut out = if words.len() > max_words {
        format!("{}...", words[..max_words].join(" "))
    } else {
        text.trim().to_string()
    };

    let Some(pattern) = sentence_break() else {
        return out;
    };
    let mut sentences = Vec::new();
    let mut start = 0usize;
    for found in pattern.find_iter(&out) {
        // Terminators are ASCII, so `start + 1` is a char boundary.
        sentences.push(&out[start..found.start() + 1]);
        start = found.end();
    }
    if start < out.len() {
        sentences.push(&out[start..]);
    }
    if sentences.len() > max_sentences {
        out = format!("{}...", sentences[..max_sentences].join(" "));
    }
    out
}
