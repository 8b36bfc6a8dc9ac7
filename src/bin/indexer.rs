use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use clinsum::config::{resource_types, DatabaseArgs, EmbeddingArgs, LoggingArgs, SourceArgs};
use clinsum::telemetry::init_tracing;
use clinsum::{BpeTokenizer, ConsoleProgress, Embedder, IndexReport, Indexer, RecordSource, VectorStore};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "clinsum-index",
    about = "Embed patient bundle resources into a pgvector table"
)]
struct IndexCli {
    /// Patient to index (repeatable)
    #[arg(long = "patient-id", env = "CLINSUM_PATIENT_ID", value_delimiter = ',')]
    patient_ids: Vec<String>,

    /// Index every patient the source knows about
    #[arg(long, default_value_t = false, conflicts_with = "patient_ids")]
    all: bool,

    /// Comma-separated resource types (defaults to the standard clinical list)
    #[arg(long, env = "CLINSUM_RESOURCE_TYPES")]
    resource_types: Option<String>,

    /// Create the vector extension, table and HNSW index if missing
    #[arg(long, default_value_t = false)]
    prepare_table: bool,

    /// Suppress the stderr progress counter
    #[arg(long, default_value_t = false)]
    quiet: bool,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    source: SourceArgs,

    #[command(flatten)]
    logging: LoggingArgs,
}

fn main() -> Result<()> {
    let cli = IndexCli::parse();
    let _guard = init_tracing(&cli.logging)?;

    // Blocking HTTP clients must be created and dropped outside the runtime.
    let source = cli.source.build()?;
    let embedder = cli.embedding.build()?;
    let tokenizer = Arc::new(BpeTokenizer::cl100k()?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let reports = runtime.block_on(run(&cli, &source, &embedder, tokenizer))?;
    drop(runtime);

    let failed: usize = reports.iter().map(|report| report.failed).sum();
    for report in &reports {
        println!(
            "{}: indexed {} skipped {} failed {}",
            report.patient_id, report.indexed, report.skipped, report.failed
        );
    }
    if failed > 0 {
        eprintln!("{failed} resources failed to index; see logs for details");
    }
    Ok(())
}

async fn run(
    cli: &IndexCli,
    source: &Arc<dyn RecordSource>,
    embedder: &Arc<dyn Embedder>,
    tokenizer: Arc<BpeTokenizer>,
) -> Result<Vec<IndexReport>> {
    let store = cli.database.connect().await?;
    if cli.prepare_table {
        store.ensure_schema(cli.embedding.embedding_dimensions).await?;
        info!(table = %store.table().qualified(), "vector table ready");
    }
    let store: Arc<dyn VectorStore> = Arc::new(store);

    let patients = if cli.all {
        let lister = Arc::clone(source);
        clinsum::pipeline::run_blocking("patient listing", move || lister.subject_ids()).await??
    } else {
        cli.patient_ids.clone()
    };
    if patients.is_empty() {
        bail!("no patients to index; pass --patient-id or --all");
    }

    let kinds = resource_types(cli.resource_types.as_deref());
    let indexer = Indexer::new(Arc::clone(source), Arc::clone(embedder), tokenizer, store);
    let mut progress = ConsoleProgress::new(cli.quiet);
    let mut reports = Vec::with_capacity(patients.len());
    for patient_id in &patients {
        match indexer.index_patient(patient_id, &kinds, &mut progress).await {
            Ok(report) => reports.push(report),
            Err(err) => error!(patient_id = %patient_id, error = %format!("{err:#}"), "patient skipped"),
        }
    }
    info!(patients = reports.len(), requested = patients.len(), "indexing finished");
    Ok(reports)
}
