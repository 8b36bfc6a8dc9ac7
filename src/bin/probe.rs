use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clinsum::config::{DatabaseArgs, EmbeddingArgs, LoggingArgs};
use clinsum::telemetry::init_tracing;
use clinsum::{similar_patients, SimilarityRetriever, VectorStore};

#[derive(Parser, Debug)]
#[command(
    name = "clinsum-probe",
    about = "List the patients whose stored resources best match a query"
)]
struct ProbeCli {
    /// Free-text query to embed
    #[arg(long)]
    query: String,

    /// Rows fetched before keeping the best one per patient
    #[arg(long, default_value_t = 20)]
    top_k: usize,

    /// Only match resources of this type
    #[arg(long)]
    resource_type: Option<String>,

    /// Print matches as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    logging: LoggingArgs,
}

fn main() -> Result<()> {
    let cli = ProbeCli::parse();
    let _guard = init_tracing(&cli.logging)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let embedder = cli.embedding.build()?;
    let store: Arc<dyn VectorStore> = Arc::new(runtime.block_on(cli.database.connect())?);
    let retriever = SimilarityRetriever::new(store, embedder, 0);

    let matches = runtime.block_on(similar_patients(
        &retriever,
        &cli.query,
        cli.resource_type.clone(),
        cli.top_k,
    ))?;

    if cli.json {
        let rendered = serde_json::to_string_pretty(&matches).context("failed to encode matches")?;
        println!("{rendered}");
        return Ok(());
    }
    if matches.is_empty() {
        println!("no matching patients");
        return Ok(());
    }
    for (rank, row) in matches.iter().enumerate() {
        let snippet: String = row.payload.chars().take(120).collect();
        println!(
            "{:>2}. patient {} | {} {} | score {:.4}\n    {}",
            rank + 1,
            row.group_key,
            row.category,
            row.entity_id,
            row.score,
            snippet.replace('\n', " ")
        );
    }
    Ok(())
}
