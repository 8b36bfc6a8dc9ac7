//! Command-line argument groups shared by the binaries, and the builders
//! that turn them into configured collaborators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use crate::embedder::OpenAiEmbedder;
use crate::embeddings::Embedder;
use crate::error::ConfigError;
use crate::llm::{AnthropicClient, LlmClient, LlmSettings, OpenAiClient};
use crate::records::{BundleFileSource, FhirServerSource, RecordSource, RESOURCE_TYPES};
use crate::summarizer::SummaryConfig;
use crate::vector_store::{PgVectorStore, TableName};

/// Postgres connection and vector table location.
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Schema holding the vector table
    #[arg(long, env = "CLINSUM_PG_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Vector table name
    #[arg(long, env = "CLINSUM_PG_TABLE", default_value = "patient_vectors")]
    pub table: String,
}

impl DatabaseArgs {
    /// Validated table identifier.
    pub fn table_name(&self) -> Result<TableName> {
        TableName::new(self.schema.clone(), self.table.clone())
    }

    /// Connects to Postgres on the current runtime.
    pub async fn connect(&self) -> Result<PgVectorStore> {
        PgVectorStore::connect(&self.database_url, self.table_name()?).await
    }
}

/// OpenAI-compatible embeddings endpoint.
#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    /// Base URL of the embeddings API (LM Studio, Ollama, OpenAI)
    #[arg(long, env = "CLINSUM_EMBED_BASE_URL", default_value = "http://127.0.0.1:1234/v1")]
    pub embedding_base_url: String,

    /// Embedding model identifier
    #[arg(
        long,
        env = "CLINSUM_EMBED_MODEL",
        default_value = "text-embedding-nomic-embed-text-v1.5"
    )]
    pub embedding_model: String,

    /// Dimensionality of stored vectors
    #[arg(long, env = "CLINSUM_EMBED_DIMENSIONS", default_value_t = 768)]
    pub embedding_dimensions: usize,

    /// Send the dimensionality with each request (models with truncatable outputs)
    #[arg(long, default_value_t = false)]
    pub request_dimensions: bool,

    /// API key, when the endpoint requires one
    #[arg(long, env = "CLINSUM_EMBED_API_KEY")]
    pub embedding_api_key: Option<String>,

    /// Inputs per embeddings request
    #[arg(long, env = "CLINSUM_EMBED_BATCH", default_value_t = 16)]
    pub embedding_batch_size: usize,

    /// Request timeout in seconds
    #[arg(long, env = "CLINSUM_EMBED_TIMEOUT_SECS", default_value_t = 30)]
    pub embedding_timeout_secs: u64,

    /// Attempts per request before giving up
    #[arg(long, env = "CLINSUM_EMBED_MAX_RETRIES", default_value_t = 3)]
    pub embedding_max_retries: usize,
}

impl EmbeddingArgs {
    /// Builds the embeddings client.
    pub fn build(&self) -> Result<Arc<dyn Embedder>> {
        if self.embedding_dimensions == 0 {
            return Err(ConfigError::Zero("embedding dimensions").into());
        }
        let embedder = OpenAiEmbedder::new(
            self.embedding_api_key.clone(),
            self.embedding_base_url.clone(),
            self.embedding_model.clone(),
            self.request_dimensions.then_some(self.embedding_dimensions),
            Duration::from_secs(self.embedding_timeout_secs),
            self.embedding_max_retries,
            self.embedding_batch_size,
        )?;
        Ok(Arc::new(embedder))
    }
}

/// Chat model used for summaries and answers.
#[derive(Args, Debug, Clone)]
pub struct LlmArgs {
    /// Target LLM provider (openai or anthropic)
    #[arg(long, env = "CLINSUM_LLM_PROVIDER", default_value = "openai")]
    pub llm_provider: String,

    /// Base URL of the OpenAI-compatible chat API; point at LM Studio for local models
    #[arg(long, env = "CLINSUM_LLM_BASE_URL", default_value = "http://127.0.0.1:1234/v1")]
    pub llm_base_url: String,

    /// OpenAI API key (optional for local servers)
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    /// Chat model for the openai provider
    #[arg(long, env = "CLINSUM_OPENAI_MODEL", default_value = "llama-3.2-3b-instruct")]
    pub openai_model: String,

    /// Anthropic API key (required when --llm-provider anthropic)
    #[arg(long, env = "ANTHROPIC_API_KEY")]
    pub anthropic_api_key: Option<String>,

    /// Anthropic model identifier
    #[arg(
        long,
        env = "CLINSUM_ANTHROPIC_MODEL",
        default_value = "claude-3-5-haiku-latest"
    )]
    pub anthropic_model: String,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.3)]
    pub temperature: f32,

    /// Maximum tokens to request from the completion model
    #[arg(long, default_value_t = 1024)]
    pub max_completion_tokens: usize,

    /// Completion request timeout in seconds
    #[arg(long, env = "CLINSUM_LLM_TIMEOUT_SECS", default_value_t = 120)]
    pub llm_timeout_secs: u64,
}

impl LlmArgs {
    /// Builds the configured provider with `system_prompt`.
    pub fn build(&self, system_prompt: &str) -> Result<Arc<dyn LlmClient>> {
        let provider = self.llm_provider.trim().to_ascii_lowercase();
        let settings = |api_key: Option<String>, model: &str| LlmSettings {
            api_key,
            model: model.to_string(),
            temperature: self.temperature,
            max_tokens: self.max_completion_tokens,
            timeout: Duration::from_secs(self.llm_timeout_secs),
            system_prompt: system_prompt.to_string(),
        };
        match provider.as_str() {
            "openai" => {
                let settings = settings(self.openai_api_key.clone(), &self.openai_model);
                Ok(Arc::new(OpenAiClient::new(&self.llm_base_url, settings)?))
            }
            "anthropic" => {
                let key = self
                    .anthropic_api_key
                    .clone()
                    .ok_or(ConfigError::Missing("ANTHROPIC_API_KEY"))?;
                let settings = settings(Some(key), &self.anthropic_model);
                Ok(Arc::new(AnthropicClient::new(settings)?))
            }
            _ => Err(ConfigError::UnknownProvider(self.llm_provider.clone()).into()),
        }
    }
}

/// Token budgets of the summarizer.
#[derive(Args, Debug, Clone)]
pub struct SummaryArgs {
    /// Tokens per map-stage chunk
    #[arg(long, env = "CLINSUM_CHUNK_TOKENS", default_value_t = 1500)]
    pub chunk_tokens: usize,

    /// Partial summaries merged per reduce call
    #[arg(long, env = "CLINSUM_BATCH_SIZE", default_value_t = 4)]
    pub batch_size: usize,

    /// Token budget of each partial summary inside a merge prompt
    #[arg(long, default_value_t = 700)]
    pub batch_member_tokens: usize,

    /// Intermediate summaries fed to the final call
    #[arg(long, env = "CLINSUM_FINAL_FANIN", default_value_t = 2)]
    pub final_fanin: usize,

    /// Token budget of each intermediate inside the final prompt
    #[arg(long, default_value_t = 450)]
    pub final_member_tokens: usize,

    /// Input token budget of one resource-type section
    #[arg(long, default_value_t = 1500)]
    pub section_tokens: usize,

    /// Input token budget of the overview over all sections
    #[arg(long, default_value_t = 2000)]
    pub sections_final_tokens: usize,

    /// Word limit of section summaries
    #[arg(long, default_value_t = 100)]
    pub max_words: usize,

    /// Sentence limit of section summaries
    #[arg(long, default_value_t = 5)]
    pub max_sentences: usize,

    /// Only map the first N chunks
    #[arg(long, env = "CLINSUM_MAX_CHUNKS")]
    pub max_chunks: Option<usize>,
}

impl SummaryArgs {
    /// Validated summarizer configuration.
    pub fn to_config(&self) -> Result<SummaryConfig, ConfigError> {
        let config = SummaryConfig {
            chunk_tokens: self.chunk_tokens,
            batch_size: self.batch_size,
            batch_member_tokens: self.batch_member_tokens,
            final_fanin: self.final_fanin,
            final_member_tokens: self.final_member_tokens,
            section_tokens: self.section_tokens,
            sections_final_tokens: self.sections_final_tokens,
            max_words: self.max_words,
            max_sentences: self.max_sentences,
            max_chunks: self.max_chunks,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Where patient bundles come from.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// FHIR R4 server base URL
    #[arg(long, env = "CLINSUM_FHIR_BASE_URL")]
    pub fhir_base_url: Option<String>,

    /// Bundle JSON file or directory of <patient-id>.json files (takes precedence)
    #[arg(long, env = "CLINSUM_BUNDLE_PATH")]
    pub bundle_path: Option<PathBuf>,

    /// FHIR request timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub fhir_timeout_secs: u64,

    /// Maximum bundle pages followed per request
    #[arg(long, default_value_t = 50)]
    pub fhir_max_pages: usize,
}

impl SourceArgs {
    /// Builds the record source.
    pub fn build(&self) -> Result<Arc<dyn RecordSource>> {
        if let Some(path) = &self.bundle_path {
            anyhow::ensure!(path.exists(), "bundle path {} does not exist", path.display());
            return Ok(Arc::new(BundleFileSource::new(path.clone())));
        }
        let base = self
            .fhir_base_url
            .as_deref()
            .ok_or(ConfigError::Missing("--fhir-base-url or --bundle-path"))?;
        let source = FhirServerSource::new(
            base,
            Duration::from_secs(self.fhir_timeout_secs),
            self.fhir_max_pages,
        )
        .context("failed to configure FHIR source")?;
        Ok(Arc::new(source))
    }
}

/// Diagnostics output.
#[derive(Args, Debug, Clone, Default)]
pub struct LoggingArgs {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, env = "CLINSUM_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Parses a comma-separated resource-type list; empty means the default list.
pub fn resource_types(list: Option<&str>) -> Vec<String> {
    let parsed: Vec<String> = list
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .map(str::to_string)
        .collect();
    if parsed.is_empty() {
        RESOURCE_TYPES.iter().map(|kind| kind.to_string()).collect()
    } else {
        parsed
    }
}
