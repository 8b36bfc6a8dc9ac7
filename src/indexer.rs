//! Embeds every resource of a patient bundle into the vector store.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::embeddings::{Embedder, StoredResource};
use crate::pipeline::run_blocking;
use crate::progress::ProgressSink;
use crate::records::{flatten_resource, resource_id, resources_of_type, RecordSource};
use crate::tokenizer::Tokenizer;
use crate::vector_store::{PatientName, VectorStore};

/// Token budget of one embedded resource text.
pub const RESOURCE_TOKENS: usize = 1500;

/// Byte cap of one stored resource text.
pub const RESOURCE_BYTES: usize = 4000;

/// Counts from indexing one patient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    /// Patient that was indexed.
    pub patient_id: String,
    /// Resources embedded and stored.
    pub indexed: usize,
    /// Resources with no usable text or id.
    pub skipped: usize,
    /// Resources whose embedding or insert failed.
    pub failed: usize,
}

/// Collaborators needed to index a patient.
#[derive(Clone)]
pub struct Indexer {
    source: Arc<dyn RecordSource>,
    embedder: Arc<dyn Embedder>,
    tokenizer: Arc<dyn Tokenizer>,
    store: Arc<dyn VectorStore>,
}

impl Indexer {
    /// Bundles the collaborators.
    pub fn new(
        source: Arc<dyn RecordSource>,
        embedder: Arc<dyn Embedder>,
        tokenizer: Arc<dyn Tokenizer>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            source,
            embedder,
            tokenizer,
            store,
        }
    }

    /// Indexes every resource of `resource_types` in the patient's bundle.
    ///
    /// The bundle must hold exactly one Patient resource. A failure on one
    /// resource is logged and counted; it does not stop the run.
    pub async fn index_patient(
        &self,
        patient_id: &str,
        resource_types: &[String],
        progress: &mut dyn ProgressSink,
    ) -> Result<IndexReport> {
        let source = Arc::clone(&self.source);
        let subject = patient_id.to_string();
        let bundle = run_blocking("bundle fetch", move || source.bundle(&subject)).await??;
        let name = patient_name_from_bundle(&bundle)?;
        info!(patient_id, name = %name.display(), resources = bundle.len(), "indexing patient");

        let mut report = IndexReport {
            patient_id: patient_id.to_string(),
            ..IndexReport::default()
        };
        progress.start_stage("index", resource_types.len());
        for resource_type in resource_types {
            let resources = resources_of_type(&bundle, resource_type);
            if resources.is_empty() {
                debug!(patient_id, resource_type = %resource_type, "no resources of this type");
            }
            for resource in resources {
                let Some(record) = self.prepare(patient_id, &name, resource_type, resource) else {
                    report.skipped += 1;
                    continue;
                };
                match self.embed_and_store(record).await {
                    Ok(()) => {
                        report.indexed += 1;
                        if report.indexed % 10 == 0 {
                            info!(patient_id, indexed = report.indexed, "resources indexed");
                        }
                    }
                    Err(err) => {
                        warn!(
                            patient_id,
                            resource_type = %resource_type,
                            resource_id = resource_id(resource).unwrap_or("?"),
                            error = %format!("{err:#}"),
                            "failed to index resource"
                        );
                        report.failed += 1;
                    }
                }
            }
            progress.advance(1);
        }
        info!(
            patient_id,
            indexed = report.indexed,
            skipped = report.skipped,
            failed = report.failed,
            "patient indexed"
        );
        Ok(report)
    }

    fn prepare(
        &self,
        patient_id: &str,
        name: &PatientName,
        resource_type: &str,
        resource: &Value,
    ) -> Option<StoredResource> {
        let Some(id) = resource_id(resource) else {
            warn!(patient_id, resource_type, "resource without id skipped");
            return None;
        };
        let text = match resource_text(self.tokenizer.as_ref(), resource) {
            Ok(Some(text)) => text,
            Ok(None) => {
                debug!(patient_id, resource_type, resource_id = id, "blank resource text skipped");
                return None;
            }
            Err(err) => {
                warn!(patient_id, resource_type, resource_id = id, error = %err, "resource text could not be truncated");
                return None;
            }
        };
        Some(StoredResource {
            patient_id: patient_id.to_string(),
            patient_lastname: name.last.clone(),
            patient_firstname: name.first.clone(),
            resource_type: resource_type.to_string(),
            resource_id: id.to_string(),
            text,
            embedding: Vec::new(),
        })
    }

    async fn embed_and_store(&self, mut record: StoredResource) -> Result<()> {
        let embedder = Arc::clone(&self.embedder);
        let text = record.text.clone();
        record.embedding = run_blocking("embedding", move || embedder.embed(&text)).await??;
        self.store.upsert(&record).await
    }
}

/// Flattened, token-truncated and byte-capped text of one resource;
/// `None` when nothing but whitespace remains.
pub fn resource_text<T: Tokenizer + ?Sized>(
    tokenizer: &T,
    resource: &Value,
) -> Result<Option<String>, crate::error::TokenizerError> {
    let flat = flatten_resource(resource);
    let truncated = tokenizer.truncate(&flat, RESOURCE_TOKENS)?;
    let capped = truncate_bytes(&truncated, RESOURCE_BYTES);
    if capped.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(capped.to_string()))
}

/// Longest prefix of `text` within `max_bytes` that ends on a char boundary.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

/// Name of the single Patient resource in a bundle.
pub fn patient_name_from_bundle(bundle: &[Value]) -> Result<PatientName> {
    let patients = resources_of_type(bundle, "Patient");
    match patients.as_slice() {
        [] => bail!("bundle has no Patient resource"),
        [patient] => Ok(patient_name(patient)),
        many => bail!("bundle has {} Patient resources; expected one", many.len()),
    }
}

/// First given name and family name of a Patient resource.
pub fn patient_name(patient: &Value) -> PatientName {
    let name = patient.get("name").and_then(|names| names.get(0));
    let first = name
        .and_then(|name| name.get("given"))
        .and_then(|given| given.get(0))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let last = name
        .and_then(|name| name.get("family"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    PatientName {
        first: first.to_string(),
        last: last.to_string(),
    }
}
