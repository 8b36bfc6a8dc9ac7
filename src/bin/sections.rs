use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clinsum::config::{resource_types, DatabaseArgs, LlmArgs, LoggingArgs, SummaryArgs};
use clinsum::pipeline::{summarize_sections, SectionReport};
use clinsum::progress::{ConsoleProgress, NullProgress, ProgressSink};
use clinsum::prompts::SUMMARY_SYSTEM_PROMPT;
use clinsum::telemetry::init_tracing;
use clinsum::{BpeTokenizer, HierarchicalSummarizer, VectorStore};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "clinsum-sections",
    about = "Summarize each stored resource type of a patient, then combine them"
)]
struct SectionsCli {
    /// Patient whose stored resources are summarized
    #[arg(long, env = "CLINSUM_PATIENT_ID")]
    patient_id: String,

    /// Comma-separated resource types (defaults to the standard clinical list)
    #[arg(long, env = "CLINSUM_RESOURCE_TYPES")]
    resource_types: Option<String>,

    /// Print the whole report as JSON instead of streaming sections
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Suppress the stderr progress counter
    #[arg(long, default_value_t = false)]
    quiet: bool,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    llm: LlmArgs,

    #[command(flatten)]
    summary: SummaryArgs,

    #[command(flatten)]
    logging: LoggingArgs,
}

fn main() -> Result<()> {
    let cli = SectionsCli::parse();
    let _guard = init_tracing(&cli.logging)?;

    let config = cli.summary.to_config()?;
    let llm = cli.llm.build(SUMMARY_SYSTEM_PROMPT)?;
    let tokenizer = Arc::new(BpeTokenizer::cl100k()?);
    let summarizer = HierarchicalSummarizer::new(llm, tokenizer, config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let report = runtime.block_on(run(&cli, &summarizer))?;
    drop(runtime);

    if cli.json {
        let rendered = serde_json::to_string_pretty(&report).context("failed to encode report")?;
        println!("{rendered}");
    } else if !report.empty_types.is_empty() {
        eprintln!("no data found for: {}", report.empty_types.join(", "));
    }
    Ok(())
}

async fn run(cli: &SectionsCli, summarizer: &HierarchicalSummarizer) -> Result<SectionReport> {
    let store = cli.database.connect().await?;
    let name = store.patient_name(&cli.patient_id).await?;
    if let Some(name) = &name {
        info!(patient_id = %cli.patient_id, name = %name.display(), "patient found");
    }

    let kinds = resource_types(cli.resource_types.as_deref());
    let mut console = ConsoleProgress::new(cli.quiet);
    let mut silent = NullProgress;
    let progress: &mut dyn ProgressSink = if cli.json { &mut silent } else { &mut console };
    let report = summarize_sections(&store, summarizer, &cli.patient_id, &kinds, progress).await;
    info!(
        patient_id = %cli.patient_id,
        sections = report.sections.len(),
        empty = report.empty_types.len(),
        "section summaries finished"
    );
    Ok(report)
}
