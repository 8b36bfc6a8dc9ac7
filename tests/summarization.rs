mod common;

use std::sync::Arc;

use anyhow::anyhow;
use clinsum::pipeline::{summarize_chunks, summarize_sections, summarize_text};
use clinsum::progress::RecordingProgress;
use clinsum::summarizer::{Provenance, NO_DATA};
use clinsum::{
    BpeTokenizer, HierarchicalSummarizer, MemoryVectorStore, RawValue, SummaryConfig, TextChunk,
    VectorStore,
};
use pretty_assertions::assert_eq;

use common::{stored, ScriptedLlm};

fn engine(llm: &Arc<ScriptedLlm>) -> HierarchicalSummarizer {
    let tokenizer = Arc::new(BpeTokenizer::cl100k().unwrap());
    HierarchicalSummarizer::new(llm.clone(), tokenizer, SummaryConfig::default()).unwrap()
}

fn chunks(count: usize) -> Vec<TextChunk> {
    (0..count)
        .map(|index| TextChunk {
            index,
            text: format!("record text {index}"),
            token_count: 3,
        })
        .collect()
}

#[tokio::test(flavor = "current_thread")]
async fn ten_chunks_reduce_through_three_batches() {
    let llm = Arc::new(ScriptedLlm::new());
    let summarizer = engine(&llm);
    let mut progress = RecordingProgress::default();

    let report = summarize_chunks(&summarizer, &chunks(10), &mut progress).await;

    assert_eq!(report.partials.len(), 10);
    assert_eq!(report.intermediates.len(), 3);
    assert_eq!(llm.calls(), 14);
    assert_eq!(
        progress.stages,
        vec![
            ("map".to_string(), 10),
            ("reduce".to_string(), 3),
            ("final".to_string(), 1)
        ]
    );
    assert_eq!(progress.advanced, 14);

    let prompts = llm.prompts();
    assert!(prompts[10].contains("summary #1") && prompts[10].contains("summary #4"));
    assert!(prompts[12].contains("summary #9") && prompts[12].contains("summary #10"));
    assert!(!prompts[12].contains("summary #8"));
    let final_prompt = &prompts[13];
    assert!(final_prompt.contains("summary #11"));
    assert!(final_prompt.contains("summary #12"));
    assert!(!final_prompt.contains("summary #13"));
    assert_eq!(report.final_summary.text, "summary #14");
    assert_eq!(report.failed_units(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn failed_map_call_becomes_placeholder_and_run_continues() {
    let llm = Arc::new(ScriptedLlm::failing_on(&["record text 1\n"]));
    let summarizer = engine(&llm);
    let mut progress = RecordingProgress::default();

    let report = summarize_chunks(&summarizer, &chunks(3), &mut progress).await;

    assert_eq!(report.partials[1].text, "[chunk 2 summarization failed]");
    assert!(report.partials[1].failed);
    assert!(!report.partials[0].failed);
    assert_eq!(report.failed_units(), 1);
    // The placeholder still feeds the merge prompt.
    assert!(llm.prompts()[3].contains("[chunk 2 summarization failed]"));
    assert_eq!(report.final_summary.provenance, Provenance::Final);
}

#[tokio::test(flavor = "current_thread")]
async fn empty_text_yields_no_data_without_llm_calls() {
    let llm = Arc::new(ScriptedLlm::new());
    let summarizer = engine(&llm);
    let mut progress = RecordingProgress::default();

    let report = summarize_text(&summarizer, "", &mut progress).await.unwrap();

    assert!(report.partials.is_empty());
    assert!(report.intermediates.is_empty());
    assert_eq!(report.final_summary.text, NO_DATA);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn long_text_is_chunked_before_mapping() {
    let llm = Arc::new(ScriptedLlm::new());
    let tokenizer = Arc::new(BpeTokenizer::cl100k().unwrap());
    let config = SummaryConfig {
        chunk_tokens: 50,
        ..SummaryConfig::default()
    };
    let summarizer = HierarchicalSummarizer::new(llm.clone(), tokenizer, config).unwrap();
    let text = "blood pressure recorded at clinic visit. ".repeat(40);

    let report = summarize_text(&summarizer, &text, &mut RecordingProgress::default())
        .await
        .unwrap();

    assert!(report.partials.len() > 1);
    assert!(llm.prompts()[0].contains("part 1 of"));
}

#[tokio::test(flavor = "current_thread")]
async fn sections_skip_malformed_rows_and_empty_types() {
    let store = MemoryVectorStore::new();
    store
        .upsert(&stored("p1", "MedicationRequest", "m1", "Lisinopril 10 mg daily", 0.5))
        .await
        .unwrap();
    store
        .set_raw_rows(
            "p1",
            "Condition",
            vec![
                Ok(RawValue::Text("Hypertension".into())),
                Ok(RawValue::Bytes(vec![0xff, 0xfe])),
                Ok(RawValue::List(vec![RawValue::Text("Type 2 diabetes".into())])),
                Err(anyhow!("connection reset")),
                Ok(RawValue::Text("never read".into())),
            ],
        )
        .unwrap();
    store
        .set_raw_rows(
            "p1",
            "Observation",
            vec![Ok(RawValue::Null), Ok(RawValue::List(vec![])), Ok(RawValue::Text("  ".into()))],
        )
        .unwrap();

    let llm = Arc::new(ScriptedLlm::new());
    let summarizer = engine(&llm);
    let mut progress = RecordingProgress::default();
    let kinds: Vec<String> = ["Condition", "Observation", "MedicationRequest"]
        .iter()
        .map(|kind| kind.to_string())
        .collect();

    let report = summarize_sections(&store, &summarizer, "p1", &kinds, &mut progress).await;

    assert_eq!(report.empty_types, vec!["Observation".to_string()]);
    let titles: Vec<String> = report.sections.iter().map(|s| s.provenance.to_string()).collect();
    assert_eq!(titles, vec!["Condition summary", "MedicationRequest summary"]);
    assert_eq!(llm.calls(), 3);

    let prompts = llm.prompts();
    assert!(prompts[0].contains("Hypertension\nType 2 diabetes"));
    assert!(!prompts[0].contains("never read"));
    assert!(prompts[1].contains("Lisinopril 10 mg daily"));
    assert!(prompts[2].contains("summary #1\nsummary #2"));
    assert_eq!(report.final_summary.text, "summary #3");

    let published: Vec<&str> = progress.published.iter().map(|(title, _)| title.as_str()).collect();
    assert_eq!(
        published,
        vec![
            "Condition summary",
            "Observation summary",
            "MedicationRequest summary",
            "Final summary"
        ]
    );
    assert_eq!(progress.published[1].1, "No Observation data found.");
    assert_eq!(progress.advanced, 4);
}

#[tokio::test(flavor = "current_thread")]
async fn sections_without_any_data_report_no_data() {
    let store = MemoryVectorStore::new();
    let llm = Arc::new(ScriptedLlm::new());
    let summarizer = engine(&llm);
    let kinds = vec!["Condition".to_string()];

    let report =
        summarize_sections(&store, &summarizer, "ghost", &kinds, &mut RecordingProgress::default()).await;

    assert!(report.sections.is_empty());
    assert_eq!(report.final_summary.text, NO_DATA);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn failed_section_call_is_reported_not_raised() {
    let store = MemoryVectorStore::new();
    store
        .upsert(&stored("p1", "Condition", "c1", "Asthma", 0.5))
        .await
        .unwrap();
    let llm = Arc::new(ScriptedLlm::failing_on(&["Asthma"]));
    let summarizer = engine(&llm);
    let kinds = vec!["Condition".to_string()];

    let report =
        summarize_sections(&store, &summarizer, "p1", &kinds, &mut RecordingProgress::default()).await;

    assert_eq!(report.sections.len(), 1);
    assert!(report.sections[0].failed);
    assert_eq!(report.sections[0].text, "[summarization failed for Condition]");
    assert_eq!(llm.calls(), 2);
}
