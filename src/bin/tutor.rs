#![forbid(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use tutor_harness::config::TutorConfig;
use tutor_harness::gateway::{ProviderGateway, TracingUsageSink};
use tutor_harness::history::HistoryStore;
use tutor_harness::pipeline::{QueryOutcome, QueryPipeline, APOLOGY};
use tutor_harness::retrieval::{load_directory, SqliteVectorStore, VectorRetriever};

const DEFAULT_CONFIG: &str = "tutor.toml";

#[derive(Parser)]
#[command(name = "tutor", version, about = "Teaching-assistant question answering")]
struct Cli {
    /// Config file (defaults to ./tutor.toml when present)
    #[arg(long, global = true, env = "TUTOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question
    Ask {
        question: String,
        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Answer questions read line by line from stdin
    Chat,
    /// Embed course documents into the vector store
    Index {
        /// Directory of *.txt documents (overrides config)
        #[arg(long)]
        docs: Option<PathBuf>,
    },
    /// Print recent history records as JSON
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print history statistics as JSON
    Stats,
    /// Delete all history
    HistoryClear,
    /// List the scenario catalogue or export it as JSON
    Scenarios {
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<TutorConfig, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Ok(TutorConfig::load(p)?),
        None if Path::new(DEFAULT_CONFIG).exists() => Ok(TutorConfig::load(Path::new(DEFAULT_CONFIG))?),
        None => Ok(TutorConfig::default()),
    }
}

fn open_history(config: &TutorConfig) -> Result<HistoryStore, Box<dyn std::error::Error>> {
    let catalog = Arc::new(config.knowledge_catalog()?);
    Ok(HistoryStore::open(
        config.history_path(),
        config.history.max_size,
        catalog,
    ))
}

fn build_retriever(
    config: &TutorConfig,
    gateway: Arc<ProviderGateway<TracingUsageSink>>,
) -> Result<VectorRetriever, Box<dyn std::error::Error>> {
    let store = SqliteVectorStore::new(config.vector_store_path())?;
    let mut retriever = VectorRetriever::new(gateway, store, config.models.embedding);
    if let Some(min) = config.retrieval.min_score {
        retriever = retriever.with_min_score(min);
    }
    Ok(retriever)
}

fn build_pipeline(config: &TutorConfig) -> Result<QueryPipeline, Box<dyn std::error::Error>> {
    let gateway = Arc::new(ProviderGateway::from_env(Arc::new(TracingUsageSink))?);
    let retriever = Arc::new(build_retriever(config, gateway.clone())?);
    Ok(QueryPipeline::from_config(config, gateway, retriever)?)
}

/// Answer `question`, printing the reply as it streams in.
async fn ask_and_print(pipeline: &QueryPipeline, question: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut printed = false;
    let outcome = pipeline
        .ask_streaming(question, |text| {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(text.as_bytes()).and_then(|()| out.flush());
            printed = true;
        })
        .await?;
    if printed {
        println!();
    }
    if !printed || (outcome.degraded && outcome.answer == APOLOGY) {
        println!("{}", outcome.answer);
    }
    print_summary(&outcome);
    Ok(())
}

fn print_summary(outcome: &QueryOutcome) {
    eprintln!(
        "[scenario {}: {}] analysis {} ms, generation {} ms",
        outcome.scenario_number,
        outcome.scenario_label,
        outcome.timings.analysis_ms,
        outcome.timings.generation_ms
    );
    if let Some(err) = &outcome.error {
        eprintln!("[degraded] {err}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask { question, json } => {
            let pipeline = build_pipeline(&config)?;
            if json {
                let outcome = pipeline.ask(&question).await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                ask_and_print(&pipeline, &question).await?;
            }
        }
        Commands::Chat => {
            let pipeline = build_pipeline(&config)?;
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut stdout = tokio::io::stdout();
            loop {
                stdout.write_all(b"> ").await?;
                stdout.flush().await?;
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                let line = line.trim();
                match line {
                    "" => continue,
                    "exit" | "quit" => break,
                    "clear" => {
                        pipeline.clear_history().await;
                        println!("History cleared.");
                    }
                    question => ask_and_print(&pipeline, question).await?,
                }
            }
        }
        Commands::Index { docs } => {
            let dir = docs.unwrap_or_else(|| config.docs_dir());
            let documents = load_directory(&dir)?;
            if documents.is_empty() {
                return Err(format!("no .txt documents found in {}", dir.display()).into());
            }
            let gateway = Arc::new(ProviderGateway::from_env(Arc::new(TracingUsageSink))?);
            let retriever = build_retriever(&config, gateway)?;
            let report = retriever.index(documents).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            eprintln!(
                "[index] {} documents in {}",
                retriever.store().count().await?,
                retriever.store().path().display()
            );
        }
        Commands::History { limit } => {
            let history = open_history(&config)?;
            println!("{}", serde_json::to_string_pretty(&history.recent(limit))?);
        }
        Commands::Stats => {
            let history = open_history(&config)?;
            println!("{}", serde_json::to_string_pretty(&history.summary())?);
        }
        Commands::HistoryClear => {
            let history = open_history(&config)?;
            history.clear();
            history.flush()?;
            println!("History cleared.");
        }
        Commands::Scenarios { export } => {
            let catalog = config.scenario_catalog()?;
            match export {
                Some(path) => {
                    catalog.export_json(&path)?;
                    eprintln!("[scenarios] {} scenarios written to {}", catalog.len(), path.display());
                }
                None => {
                    for s in catalog.iter() {
                        println!("{:>2}  {}", s.number, s.label);
                    }
                    let d = catalog.default_scenario();
                    println!("{:>2}  {}", d.number, d.label);
                }
            }
        }
    }

    Ok(())
}
