//! Async drivers that run each stage in order and keep blocking calls off
//! the coordinating task.
//!
//! Every LLM, embedding and HTTP call goes through [`run_blocking`], one at a
//! time, so chunk order and batch composition match the synchronous
//! [`HierarchicalSummarizer::run`]. Progress is reported between calls.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::chunker::{chunk_text, TextChunk};
use crate::normalizer::collect_texts;
use crate::progress::ProgressSink;
use crate::records::{bundle_text, RecordSource};
use crate::summarizer::{
    batch_failed_marker, chunk_failed_marker, section_failed_marker, HierarchicalSummarizer,
    Provenance, Summary, SummaryReport, FINAL_FAILED_MARKER,
};
use crate::vector_store::VectorStore;

/// Runs a blocking closure on the blocking pool and waits for it.
///
/// A panicked or cancelled task comes back as `Err` labelled with `unit`.
pub async fn run_blocking<T, F>(unit: &str, work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| anyhow!("{unit} worker did not finish: {err}"))
}

/// Fetches a subject's bundle and renders it as one text.
pub async fn load_bundle_text(source: Arc<dyn RecordSource>, subject_id: &str) -> Result<String> {
    let subject = subject_id.to_string();
    let resources = run_blocking("bundle fetch", move || source.bundle(&subject)).await??;
    info!(subject_id, resources = resources.len(), "bundle loaded");
    Ok(bundle_text(&resources))
}

/// Chunks `text` and runs the map, reduce and final stages.
pub async fn summarize_text(
    summarizer: &HierarchicalSummarizer,
    text: &str,
    progress: &mut dyn ProgressSink,
) -> Result<SummaryReport> {
    let chunks = chunk_text(
        summarizer.tokenizer().as_ref(),
        text,
        summarizer.config().chunk_tokens,
    )?;
    info!(chunks = chunks.len(), "text chunked");
    Ok(summarize_chunks(summarizer, &chunks, progress).await)
}

/// Stage driver over pre-built chunks. Never fails; failed units become
/// placeholders.
pub async fn summarize_chunks(
    summarizer: &HierarchicalSummarizer,
    chunks: &[TextChunk],
    progress: &mut dyn ProgressSink,
) -> SummaryReport {
    let chunks = summarizer.limit_chunks(chunks);
    let total = chunks.len();

    progress.start_stage("map", total);
    let mut partials = Vec::with_capacity(total);
    for chunk in chunks {
        let worker = summarizer.clone();
        let owned = chunk.clone();
        let summary = run_blocking("map", move || worker.map_chunk(&owned, total))
            .await
            .unwrap_or_else(|err| {
                warn!(chunk = chunk.index + 1, error = %err, "map worker failed");
                Summary::placeholder(chunk_failed_marker(chunk.index), Provenance::Chunk(chunk.index))
            });
        progress.publish(&summary.provenance.to_string(), &summary.text);
        progress.advance(1);
        partials.push(summary);
    }

    let batches: Vec<Vec<Summary>> = summarizer.batches(&partials).map(<[Summary]>::to_vec).collect();
    progress.start_stage("reduce", batches.len());
    let mut intermediates = Vec::with_capacity(batches.len());
    for (index, members) in batches.into_iter().enumerate() {
        let worker = summarizer.clone();
        let summary = run_blocking("reduce", move || worker.merge_batch(index, &members))
            .await
            .unwrap_or_else(|err| {
                warn!(batch = index + 1, error = %err, "reduce worker failed");
                Summary::placeholder(batch_failed_marker(index), Provenance::Batch(index))
            });
        progress.publish(&summary.provenance.to_string(), &summary.text);
        progress.advance(1);
        intermediates.push(summary);
    }

    progress.start_stage("final", 1);
    let worker = summarizer.clone();
    let inputs = intermediates.clone();
    let final_summary = run_blocking("final", move || worker.finalize(&inputs))
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "final worker failed");
            Summary::placeholder(FINAL_FAILED_MARKER.to_string(), Provenance::Final)
        });
    progress.publish(&final_summary.provenance.to_string(), &final_summary.text);
    progress.advance(1);

    SummaryReport {
        partials,
        intermediates,
        final_summary,
    }
}

/// Per-resource-type summaries plus the overview built from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionReport {
    /// Section summaries for types that had usable rows, in type order.
    pub sections: Vec<Summary>,
    /// Types skipped for lack of usable rows.
    pub empty_types: Vec<String>,
    /// Overview of all sections.
    pub final_summary: Summary,
}

/// Summarizes each resource type stored for `patient_id`, then combines the
/// sections into one overview.
pub async fn summarize_sections(
    store: &dyn VectorStore,
    summarizer: &HierarchicalSummarizer,
    patient_id: &str,
    resource_types: &[String],
    progress: &mut dyn ProgressSink,
) -> SectionReport {
    progress.start_stage("sections", resource_types.len() + 1);
    let mut sections = Vec::new();
    let mut empty_types = Vec::new();

    for resource_type in resource_types {
        let rows = match store.resource_rows(patient_id, resource_type).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(patient_id, resource_type = %resource_type, error = %format!("{err:#}"), "row query failed");
                Vec::new()
            }
        };
        let collected = collect_texts(resource_type, rows);
        if !collected.skipped.is_empty() {
            info!(
                resource_type = %resource_type,
                skipped = collected.skipped.len(),
                "rows skipped during normalization"
            );
        }

        let worker = summarizer.clone();
        let kind = resource_type.clone();
        let texts = collected.texts;
        let no_data = texts.is_empty();
        let summary = run_blocking("section", move || worker.summarize_section(&kind, &texts))
            .await
            .unwrap_or_else(|err| {
                warn!(resource_type = %resource_type, error = %err, "section worker failed");
                Summary::placeholder(
                    section_failed_marker(resource_type),
                    Provenance::ResourceType(resource_type.clone()),
                )
            });
        progress.publish(&summary.provenance.to_string(), &summary.text);
        progress.advance(1);
        if no_data {
            empty_types.push(resource_type.clone());
        } else {
            sections.push(summary);
        }
    }

    let worker = summarizer.clone();
    let inputs = sections.clone();
    let final_summary = run_blocking("overview", move || worker.combine_sections(&inputs))
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "overview worker failed");
            Summary::placeholder(FINAL_FAILED_MARKER.to_string(), Provenance::Final)
        });
    progress.publish(&final_summary.provenance.to_string(), &final_summary.text);
    progress.advance(1);

    SectionReport {
        sections,
        empty_types,
        final_summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn panicking_worker_is_an_error() {
        let result: Result<()> = run_blocking("map", || panic!("boom")).await;
        let message = result.unwrap_err().to_string();
        assert!(message.starts_with("map worker did not finish"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_result_is_returned() {
        assert_eq!(run_blocking("sum", || 2 + 2).await.unwrap(), 4);
    }
}
