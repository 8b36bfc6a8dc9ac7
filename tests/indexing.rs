mod common;

use std::fs;
use std::sync::Arc;

use clinsum::pipeline::load_bundle_text;
use clinsum::progress::RecordingProgress;
use clinsum::{BpeTokenizer, BundleFileSource, Embedder, Indexer, MemoryVectorStore, RecordSource, VectorStore};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{FixedEmbedder, PoisonedEmbedder};

fn bundle() -> serde_json::Value {
    json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "entry": [
            {"resource": {
                "resourceType": "Patient",
                "id": "p1",
                "name": [{"family": "Doe", "given": ["Jane", "Q"]}],
                "gender": "female"
            }},
            {"resource": {
                "resourceType": "Condition",
                "id": "c1",
                "code": {"text": "Essential hypertension"}
            }},
            {"resource": {
                "resourceType": "Condition",
                "code": {"text": "Condition without an id"}
            }},
            {"resource": {
                "resourceType": "Observation",
                "id": "o1",
                "code": {"text": "explode on embed"}
            }}
        ]
    })
}

fn write_bundle(dir: &tempfile::TempDir, name: &str, value: &serde_json::Value) {
    fs::write(dir.path().join(name), serde_json::to_string_pretty(value).unwrap()).unwrap();
}

fn kinds(list: &[&str]) -> Vec<String> {
    list.iter().map(|kind| kind.to_string()).collect()
}

async fn index_with(
    embedder: Arc<dyn Embedder>,
    source: Arc<dyn RecordSource>,
    store: Arc<MemoryVectorStore>,
) -> anyhow::Result<clinsum::IndexReport> {
    let tokenizer = Arc::new(BpeTokenizer::cl100k().unwrap());
    let indexer = Indexer::new(source, embedder, tokenizer, store);
    indexer
        .index_patient(
            "p1",
            &kinds(&["Patient", "Condition", "Observation", "Procedure"]),
            &mut RecordingProgress::default(),
        )
        .await
}

#[tokio::test(flavor = "current_thread")]
async fn bundle_directory_is_indexed_per_resource() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(&dir, "p1.json", &bundle());
    let source = Arc::new(BundleFileSource::new(dir.path()));
    let store = Arc::new(MemoryVectorStore::new());

    let report = index_with(Arc::new(FixedEmbedder::default()), source, store.clone())
        .await
        .unwrap();

    assert_eq!((report.indexed, report.skipped, report.failed), (3, 1, 0));
    let mut stored: Vec<(String, String)> = store
        .records()
        .into_iter()
        .map(|row| (row.resource_type, row.resource_id))
        .collect();
    stored.sort();
    assert_eq!(
        stored,
        vec![
            ("Condition".to_string(), "c1".to_string()),
            ("Observation".to_string(), "o1".to_string()),
            ("Patient".to_string(), "p1".to_string()),
        ]
    );
    let name = store.patient_name("p1").await.unwrap().unwrap();
    assert_eq!(name.display(), "Jane Doe");
    let condition = store
        .records()
        .into_iter()
        .find(|row| row.resource_id == "c1")
        .unwrap();
    assert!(condition.text.contains("Essential hypertension"));
    assert_eq!(condition.embedding, vec![1.0, 0.0]);
}

#[tokio::test(flavor = "current_thread")]
async fn embedding_failure_is_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(&dir, "p1.json", &bundle());
    let source = Arc::new(BundleFileSource::new(dir.path()));
    let store = Arc::new(MemoryVectorStore::new());

    let report = index_with(Arc::new(PoisonedEmbedder { poison: "explode" }), source, store.clone())
        .await
        .unwrap();

    assert_eq!((report.indexed, report.skipped, report.failed), (2, 1, 1));
    assert_eq!(store.len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn bundle_with_two_patients_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let value = json!([
        {"resourceType": "Patient", "id": "p1"},
        {"resourceType": "Patient", "id": "p2"}
    ]);
    write_bundle(&dir, "p1.json", &value);
    let source = Arc::new(BundleFileSource::new(dir.path()));
    let store = Arc::new(MemoryVectorStore::new());

    let result = index_with(Arc::new(FixedEmbedder::default()), source, store.clone()).await;

    assert!(result.is_err());
    assert!(store.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn missing_bundle_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let source: Arc<dyn RecordSource> = Arc::new(BundleFileSource::new(dir.path()));

    let err = load_bundle_text(source, "nobody").await.unwrap_err();

    assert!(format!("{err:#}").contains("failed to read bundle"));
}

#[test]
fn bundle_directory_lists_subjects() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(&dir, "b.json", &bundle());
    write_bundle(&dir, "a.json", &bundle());
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
    let source = BundleFileSource::new(dir.path());

    assert_eq!(source.subject_ids().unwrap(), vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn single_bundle_file_lists_its_patient() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(&dir, "bundle.json", &bundle());
    let source = BundleFileSource::new(dir.path().join("bundle.json"));

    assert_eq!(source.subject_ids().unwrap(), vec!["p1".to_string()]);
    assert_eq!(source.bundle("anyone").unwrap().len(), 4);
}
