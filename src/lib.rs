#![warn(missing_docs)]
//! Token-aware summarization and similarity retrieval over patient records.
//!
//! The library splits serialized FHIR bundles into token-bounded chunks,
//! reduces them through a hierarchical map-reduce of LLM calls, and answers
//! questions from pgvector similarity search. The binaries under `src/bin`
//! wire these pieces to real services.

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod embeddings;
pub mod error;
pub mod indexer;
pub mod llm;
pub mod normalizer;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod rag;
pub mod records;
pub mod retrieval;
pub mod summarizer;
pub mod telemetry;
pub mod tokenizer;
pub mod vector_store;

pub use chunker::{chunk_text, TextChunk};
pub use embeddings::{Embedder, StoredResource, VectorLiteral};
pub use error::{ConfigError, TokenizerError};
pub use indexer::{IndexReport, Indexer};
pub use llm::{Completion, LlmClient};
pub use normalizer::{collect_texts, normalize, NormalizedValue, RawValue, SkipReason};
pub use progress::{ConsoleProgress, NullProgress, ProgressSink};
pub use rag::{similar_patients, RagAnswer, RagAnswerer};
pub use records::{BundleFileSource, FhirServerSource, RecordSource, RESOURCE_TYPES};
pub use retrieval::{
    dedupe_best_per_key, RankDirection, RankedResultSet, RetrievalRow, SimilarityRetriever,
};
pub use summarizer::{enforce_length, HierarchicalSummarizer, Summary, SummaryConfig};
pub use tokenizer::{BpeTokenizer, Tokenizer};
pub use vector_store::{MemoryVectorStore, PgVectorStore, ScopeFilter, VectorStore};
