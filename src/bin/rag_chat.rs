use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clinsum::config::{DatabaseArgs, EmbeddingArgs, LlmArgs, LoggingArgs};
use clinsum::prompts::RAG_SYSTEM_PROMPT;
use clinsum::telemetry::init_tracing;
use clinsum::{BpeTokenizer, RagAnswer, RagAnswerer, SimilarityRetriever, VectorStore};
use tokio::runtime::Runtime;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(
    name = "clinsum-chat",
    about = "Answer questions about a patient from their indexed resources"
)]
struct ChatCli {
    /// Patient the questions are about
    #[arg(long, env = "CLINSUM_PATIENT_ID")]
    patient_id: String,

    /// Ask a single question and exit; without it questions are read from stdin
    #[arg(long)]
    question: Option<String>,

    /// Passages retrieved per question
    #[arg(long, env = "CLINSUM_TOP_K", default_value_t = 5)]
    top_k: usize,

    /// Token budget of the retrieved context inside the prompt
    #[arg(long, default_value_t = 3000)]
    context_tokens: usize,

    /// Only retrieve passages of this resource type
    #[arg(long)]
    resource_type: Option<String>,

    /// Query embeddings kept in the LRU cache (0 disables it)
    #[arg(long, default_value_t = 256)]
    cache_size: usize,

    /// Print the retrieved passages before each answer
    #[arg(long, default_value_t = false)]
    show_context: bool,

    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    llm: LlmArgs,

    #[command(flatten)]
    logging: LoggingArgs,
}

fn main() -> Result<()> {
    let cli = ChatCli::parse();
    let _guard = init_tracing(&cli.logging)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let embedder = cli.embedding.build()?;
    let llm = cli.llm.build(RAG_SYSTEM_PROMPT)?;
    let tokenizer = Arc::new(BpeTokenizer::cl100k()?);
    let store: Arc<dyn VectorStore> = Arc::new(runtime.block_on(cli.database.connect())?);
    let retriever = SimilarityRetriever::new(Arc::clone(&store), embedder, cli.cache_size);
    let answerer = RagAnswerer::new(retriever, store, llm, tokenizer, cli.top_k, cli.context_tokens)?
        .with_resource_type(cli.resource_type.clone());

    if let Some(question) = &cli.question {
        return ask(&runtime, &answerer, &cli, question);
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("question> ");
        io::stdout().flush().context("failed to flush prompt")?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("failed to read question")?;
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }
        if let Err(err) = ask(&runtime, &answerer, &cli, question) {
            warn!(error = %format!("{err:#}"), "question failed");
            eprintln!("error: {err:#}");
        }
    }
    Ok(())
}

fn ask(runtime: &Runtime, answerer: &RagAnswerer, cli: &ChatCli, question: &str) -> Result<()> {
    let answer = runtime.block_on(answerer.answer(&cli.patient_id, question))?;
    if let RagAnswer::Answered {
        passages, patient, ..
    } = &answer
    {
        if let Some(patient) = patient {
            println!("--- Patient: {} ---", patient.display());
        }
        if cli.show_context {
            println!("--- Retrieved Context ---");
            for row in passages {
                println!(
                    "{} {} | score {:.4}\n{}\n---",
                    row.category,
                    row.entity_id,
                    row.score,
                    row.payload.trim()
                );
            }
        }
    }
    println!("--- Answer ---\n{}\n", answer.text());
    Ok(())
}
