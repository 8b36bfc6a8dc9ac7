//! Retrieval-augmented answers over one patient's stored resources.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::llm::{attempt, Completion, LlmClient};
use crate::pipeline::run_blocking;
use crate::prompts;
use crate::retrieval::{RetrievalRow, SimilarityRetriever};
use crate::tokenizer::Tokenizer;
use crate::vector_store::{PatientName, ScopeFilter, VectorStore};

/// Reply shown when retrieval found nothing.
pub const NO_MATCH: &str = "No matching data found for that patient.";

/// Reply shown when the LLM call failed.
pub const ANSWER_FAILED: &str = "[answer unavailable: the language model call failed]";

/// Outcome of one question.
#[derive(Debug, Clone, PartialEq)]
pub enum RagAnswer {
    /// Nothing similar was stored; the LLM was not called.
    NoMatch,
    /// The LLM was asked with the retrieved context.
    Answered {
        /// Answer text or [`ANSWER_FAILED`].
        text: String,
        /// True when `text` is the failure placeholder.
        failed: bool,
        /// Passages used as context, best first.
        passages: Vec<RetrievalRow>,
        /// Recorded patient name, when known.
        patient: Option<PatientName>,
    },
}

impl RagAnswer {
    /// Text to display.
    pub fn text(&self) -> &str {
        match self {
            Self::NoMatch => NO_MATCH,
            Self::Answered { text, .. } => text,
        }
    }
}

/// Answers questions about a patient from retrieved passages.
pub struct RagAnswerer {
    retriever: SimilarityRetriever,
    store: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    tokenizer: Arc<dyn Tokenizer>,
    top_k: usize,
    context_tokens: usize,
    resource_type: Option<String>,
}

impl RagAnswerer {
    /// `context_tokens` bounds the rendered passages inside the prompt.
    pub fn new(
        retriever: SimilarityRetriever,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmClient>,
        tokenizer: Arc<dyn Tokenizer>,
        top_k: usize,
        context_tokens: usize,
    ) -> Result<Self> {
        anyhow::ensure!(top_k > 0, "top_k must be positive");
        anyhow::ensure!(context_tokens > 0, "context_tokens must be positive");
        Ok(Self {
            retriever,
            store,
            llm,
            tokenizer,
            top_k,
            context_tokens,
            resource_type: None,
        })
    }

    /// Restricts retrieval to one resource type.
    pub fn with_resource_type(mut self, resource_type: Option<String>) -> Self {
        self.resource_type = resource_type;
        self
    }

    /// Retrieves, prompts and answers. Retrieval errors are returned;
    /// an LLM failure becomes [`ANSWER_FAILED`] and a failed name lookup
    /// leaves `patient` empty.
    pub async fn answer(&self, patient_id: &str, question: &str) -> Result<RagAnswer> {
        let mut scope = ScopeFilter::patient(patient_id);
        scope.resource_type = self.resource_type.clone();
        let results = self.retriever.retrieve(question, &scope, self.top_k).await?;
        if results.is_empty() {
            info!(patient_id, "no passages matched");
            return Ok(RagAnswer::NoMatch);
        }
        let passages = results.into_rows();
        let context = self.render_context(&passages)?;
        debug!(patient_id, passages = passages.len(), context_chars = context.len(), "context rendered");

        let patient = match self.store.patient_name(patient_id).await {
            Ok(patient) => patient,
            Err(err) => {
                warn!(patient_id, error = %format!("{err:#}"), "patient name lookup failed");
                None
            }
        };

        let prompt = prompts::rag_prompt(&context, question);
        let llm = Arc::clone(&self.llm);
        let completion = run_blocking("answer", move || attempt(llm.as_ref(), "answer", &prompt))
            .await
            .unwrap_or_else(|err| Completion::Failed(err.to_string()));
        let failed = completion.is_failed();
        Ok(RagAnswer::Answered {
            text: completion.or_placeholder(ANSWER_FAILED),
            failed,
            passages,
            patient,
        })
    }

    /// Joins passage texts with blank lines and clips to the context budget.
    pub fn render_context(&self, passages: &[RetrievalRow]) -> Result<String> {
        let joined = passages
            .iter()
            .map(|row| row.payload.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(self.tokenizer.truncate(&joined, self.context_tokens)?)
    }
}

/// Patients whose stored resources best match `query`, one row each.
pub async fn similar_patients(
    retriever: &SimilarityRetriever,
    query: &str,
    resource_type: Option<String>,
    top_k: usize,
) -> Result<Vec<RetrievalRow>> {
    let scope = ScopeFilter {
        patient_id: None,
        resource_type,
    };
    let results = retriever.retrieve(query, &scope, top_k).await?;
    Ok(results.best_per_key())
}
