use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clinsum::config::{LlmArgs, LoggingArgs, SourceArgs, SummaryArgs};
use clinsum::pipeline::{load_bundle_text, summarize_text};
use clinsum::progress::{ConsoleProgress, NullProgress, ProgressSink};
use clinsum::prompts::SUMMARY_SYSTEM_PROMPT;
use clinsum::summarizer::SummaryReport;
use clinsum::telemetry::init_tracing;
use clinsum::{BpeTokenizer, HierarchicalSummarizer, RecordSource};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "clinsum-summarize",
    about = "Summarize a patient bundle through chunked map-reduce LLM calls"
)]
struct SummarizeCli {
    /// Patient whose bundle is summarized
    #[arg(long, env = "CLINSUM_PATIENT_ID")]
    patient_id: String,

    /// Print the whole report as JSON instead of streaming sections
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Suppress the stderr progress counter
    #[arg(long, default_value_t = false)]
    quiet: bool,

    #[command(flatten)]
    source: SourceArgs,

    #[command(flatten)]
    llm: LlmArgs,

    #[command(flatten)]
    summary: SummaryArgs,

    #[command(flatten)]
    logging: LoggingArgs,
}

fn main() -> Result<()> {
    let cli = SummarizeCli::parse();
    let _guard = init_tracing(&cli.logging)?;

    let config = cli.summary.to_config()?;
    let source = cli.source.build()?;
    let llm = cli.llm.build(SUMMARY_SYSTEM_PROMPT)?;
    let tokenizer = Arc::new(BpeTokenizer::cl100k()?);
    let summarizer = HierarchicalSummarizer::new(llm, tokenizer, config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let report = runtime.block_on(run(&cli, &source, &summarizer))?;
    drop(runtime);

    if cli.json {
        let rendered = serde_json::to_string_pretty(&report).context("failed to encode report")?;
        println!("{rendered}");
    }
    let failed = report.failed_units();
    if failed > 0 {
        warn!(failed, "some summarization calls failed; placeholders were used");
    }
    Ok(())
}

async fn run(
    cli: &SummarizeCli,
    source: &Arc<dyn RecordSource>,
    summarizer: &HierarchicalSummarizer,
) -> Result<SummaryReport> {
    let text = load_bundle_text(Arc::clone(source), &cli.patient_id).await?;
    if text.trim().is_empty() {
        info!(patient_id = %cli.patient_id, "bundle is empty");
    }
    let mut console = ConsoleProgress::new(cli.quiet);
    let mut silent = NullProgress;
    let progress: &mut dyn ProgressSink = if cli.json { &mut silent } else { &mut console };
    let report = summarize_text(summarizer, &text, progress).await?;
    info!(
        patient_id = %cli.patient_id,
        chunks = report.partials.len(),
        batches = report.intermediates.len(),
        "summary finished"
    );
    Ok(report)
}
