//! In-process vector store used by tests and dry runs.

use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{PatientName, ScopeFilter, VectorStore};
use crate::embeddings::{cosine_similarity, StoredResource, VectorLiteral};
use crate::normalizer::{FetchedValue, RawValue};
use crate::retrieval::{RankDirection, RankedResultSet, RetrievalRow};

/// Rows kept in a `Vec`, scored by brute-force cosine similarity.
#[derive(Default)]
pub struct MemoryVectorStore {
    rows: RwLock<Vec<StoredResource>>,
    raw_rows: RwLock<Vec<(String, String, Vec<FetchedValue>)>>,
}

impl MemoryVectorStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored resources.
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all stored resources in insertion order.
    pub fn records(&self) -> Vec<StoredResource> {
        self.rows.read().map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Overrides what [`VectorStore::resource_rows`] returns for one
    /// patient and resource type, including non-text values and fetch errors.
    pub fn set_raw_rows(
        &self,
        patient_id: impl Into<String>,
        resource_type: impl Into<String>,
        rows: Vec<FetchedValue>,
    ) -> Result<()> {
        let patient_id = patient_id.into();
        let resource_type = resource_type.into();
        let mut raw = self
            .raw_rows
            .write()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        raw.retain(|(p, t, _)| !(p == &patient_id && t == &resource_type));
        raw.push((patient_id, resource_type, rows));
        Ok(())
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, record: &StoredResource) -> Result<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let existing = rows.iter_mut().find(|row| {
            row.patient_id == record.patient_id
                && row.resource_type == record.resource_type
                && row.resource_id == record.resource_id
        });
        match existing {
            Some(row) => *row = record.clone(),
            None => rows.push(record.clone()),
        }
        Ok(())
    }

    async fn nearest(
        &self,
        query: &VectorLiteral,
        scope: &ScopeFilter,
        top_k: usize,
        direction: RankDirection,
    ) -> Result<Vec<RetrievalRow>> {
        let query = query.values()?;
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let scored = rows
            .iter()
            .filter(|row| scope.matches(&row.patient_id, &row.resource_type))
            .map(|row| RetrievalRow {
                entity_id: row.resource_id.clone(),
                group_key: row.patient_id.clone(),
                category: row.resource_type.clone(),
                score: cosine_similarity(&row.embedding, &query),
                payload: row.text.clone(),
            })
            .collect();
        Ok(RankedResultSet::new(scored, direction, top_k).into_rows())
    }

    async fn resource_rows(&self, patient_id: &str, resource_type: &str) -> Result<Vec<FetchedValue>> {
        {
            let mut raw = self
                .raw_rows
                .write()
                .map_err(|_| anyhow!("memory store lock poisoned"))?;
            if let Some(pos) = raw
                .iter()
                .position(|(p, t, _)| p == patient_id && t == resource_type)
            {
                // Injected rows are handed out once, like a consumed cursor.
                let (_, _, rows) = raw.remove(pos);
                return Ok(rows);
            }
        }
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let mut matching: Vec<&StoredResource> = rows
            .iter()
            .filter(|row| row.patient_id == patient_id && row.resource_type == resource_type)
            .collect();
        matching.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(matching
            .into_iter()
            .map(|row| Ok(RawValue::Text(row.text.clone())))
            .collect())
    }

    async fn patient_name(&self, patient_id: &str) -> Result<Option<PatientName>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(rows
            .iter()
            .find(|row| row.patient_id == patient_id)
            .map(|row| PatientName {
                first: row.patient_firstname.clone(),
                last: row.patient_lastname.clone(),
            }))
    }
}
