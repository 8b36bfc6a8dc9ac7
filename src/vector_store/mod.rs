//! Vector store contract plus the pgvector and in-memory implementations.

use anyhow::Result;
use async_trait::async_trait;

use crate::embeddings::{StoredResource, VectorLiteral};
use crate::normalizer::FetchedValue;
use crate::retrieval::{RankDirection, RetrievalRow};

pub mod memory;
pub mod postgres;

pub use memory::MemoryVectorStore;
pub use postgres::PgVectorStore;

/// Restricts a similarity query to one patient and/or one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    /// Only rows for this patient id.
    pub patient_id: Option<String>,
    /// Only rows of this resource type.
    pub resource_type: Option<String>,
}

impl ScopeFilter {
    /// No restriction.
    pub fn all() -> Self {
        Self::default()
    }

    /// Rows of a single patient.
    pub fn patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: Some(patient_id.into()),
            resource_type: None,
        }
    }

    /// Narrows to a resource type.
    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Whether a row with the given keys passes the filter.
    pub fn matches(&self, patient_id: &str, resource_type: &str) -> bool {
        self.patient_id.as_deref().map_or(true, |p| p == patient_id)
            && self.resource_type.as_deref().map_or(true, |t| t == resource_type)
    }
}

/// Display name of a patient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientName {
    /// Given name.
    pub first: String,
    /// Family name.
    pub last: String,
}

impl PatientName {
    /// `First Last`, or an empty string when both are unknown.
    pub fn display(&self) -> String {
        format!("{} {}", self.first, self.last).trim().to_string()
    }
}

/// Storage backend for embedded resources.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces one resource row.
    async fn upsert(&self, record: &StoredResource) -> Result<()>;

    /// Top-K rows nearest to `query`, ordered by `direction`.
    async fn nearest(
        &self,
        query: &VectorLiteral,
        scope: &ScopeFilter,
        top_k: usize,
        direction: RankDirection,
    ) -> Result<Vec<RetrievalRow>>;

    /// Raw text column values for a patient and resource type.
    ///
    /// A failure while streaming is returned as the final `Err` item; rows
    /// read before it are kept. A failure to run the query at all is `Err`.
    async fn resource_rows(&self, patient_id: &str, resource_type: &str) -> Result<Vec<FetchedValue>>;

    /// Name recorded for a patient, if any row exists.
    async fn patient_name(&self, patient_id: &str) -> Result<Option<PatientName>>;
}

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Both identifiers must be non-blank and at most 63 bytes, the length
    /// past which Postgres truncates names.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let (schema, table) = (schema.into(), table.into());
        for (kind, name) in [("schema", &schema), ("table", &table)] {
            anyhow::ensure!(!name.trim().is_empty(), "{kind} name is required");
            anyhow::ensure!(
                name.len() <= MAX_IDENT_BYTES,
                "{kind} name {name:?} exceeds {MAX_IDENT_BYTES} bytes"
            );
        }
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Name of the cosine HNSW index over the embedding column.
    pub fn hnsw_index_name(&self) -> String {
        format!(
            "{}_{}_embedding_hnsw_idx",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table)
        )
    }
}

const MAX_IDENT_BYTES: usize = 63;

/// Double-quotes a Postgres identifier, doubling embedded quotes.
pub fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| match ch {
            'a'..='z' | '0'..='9' => ch,
            'A'..='Z' => ch.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}
