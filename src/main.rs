//! khepri CLI: self-learning tool & capability recommender.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use khepri::config::SpeculationConfig;
use khepri::engine::{Engine, EngineConfig};
use khepri::worker::{TrainWorkerInput, TrainWorkerResult, run_training_job};

#[derive(Parser)]
#[command(name = "khepri", version, about = "Self-learning tool & capability recommender")]
struct Cli {
    /// Data directory for persistent storage (memory-only when omitted).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Embedding dimension.
    #[arg(long, global = true, default_value = "1024")]
    dimension: usize,

    /// Speculation config YAML (defaults apply when omitted).
    #[arg(long, global = true)]
    speculation_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine configuration and graph statistics.
    Info,

    /// Rank capabilities (or tools) against an intent.
    Score {
        /// Intent text, embedded with the engine's embedder.
        intent: String,

        /// Rank tools instead of capabilities.
        #[arg(long)]
        tools: bool,

        /// How many results to print.
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Predict likely next tools for a running context.
    Predict {
        /// Context tool ids, oldest first.
        context: Vec<String>,
    },

    /// Print speculation and emergence metrics as JSON.
    Metrics,

    /// Run as a training worker: JSON input on stdin, JSON result on stdout.
    TrainWorker,

    /// Serve the HTTP surface (requires the `server` feature).
    Serve {
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:7430")]
        addr: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let speculation = match &cli.speculation_config {
        Some(path) => SpeculationConfig::from_path(path).into_diagnostic()?,
        None => SpeculationConfig::default(),
    };
    let config = EngineConfig {
        embedding_dim: cli.dimension,
        data_dir: cli.data_dir.clone(),
        speculation,
        ..Default::default()
    };

    match cli.command {
        Commands::Info => {
            let engine = Engine::new(config).into_diagnostic()?;
            let snapshot = engine.snapshot();
            println!("khepri {}", env!("CARGO_PKG_VERSION"));
            println!("  embedding dim : {}", engine.config().embedding_dim);
            println!("  nodes         : {}", snapshot.metadata.node_count);
            println!("  edges         : {}", snapshot.metadata.edge_count);
            println!("  density       : {:.4}", snapshot.metadata.density);
            println!("  max level     : {}", snapshot.metadata.max_level);
            Ok(())
        }

        Commands::Score { intent, tools, top } => {
            let engine = Engine::new(config).into_diagnostic()?;
            let embedding = engine.embed(&intent);
            let scored = if tools {
                engine.score_tools(&embedding).into_diagnostic()?
            } else {
                engine.score_intent(&embedding).into_diagnostic()?
            };
            if scored.is_empty() {
                println!("nothing registered to score");
            }
            for candidate in scored.iter().take(top) {
                println!("{:.4}  {}", candidate.score, candidate.id);
            }
            Ok(())
        }

        Commands::Predict { context } => {
            let engine = Engine::new(config).into_diagnostic()?;
            let predictions = engine.predict_next(&context, &[]);
            if predictions.is_empty() {
                println!("no predictions for this context");
            }
            for p in predictions {
                println!("{:.2}  {:<24} {}", p.confidence, p.tool_id, p.reasoning);
            }
            Ok(())
        }

        Commands::Metrics => {
            let engine = Engine::new(config).into_diagnostic()?;
            let body = serde_json::json!({
                "speculation": engine.speculation_metrics(),
                "emergence": engine.emergence().into_diagnostic()?,
            });
            println!("{}", serde_json::to_string_pretty(&body).into_diagnostic()?);
            Ok(())
        }

        Commands::TrainWorker => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .into_diagnostic()?;
            let input: TrainWorkerInput = match serde_json::from_str(&raw) {
                Ok(input) => input,
                Err(e) => {
                    let result = TrainWorkerResult::failure(format!("invalid input JSON: {e}"));
                    println!("{}", serde_json::to_string(&result).into_diagnostic()?);
                    std::process::exit(1);
                }
            };
            // The worker writes params straight to the store; stdout only
            // carries the summary below.
            let engine = Engine::new(config).into_diagnostic()?;
            let store = Arc::clone(engine.param_store());
            match run_training_job(&input, &store) {
                Ok(result) => {
                    println!("{}", serde_json::to_string(&result).into_diagnostic()?);
                    Ok(())
                }
                Err(e) => {
                    let result = TrainWorkerResult::failure(e.to_string());
                    println!("{}", serde_json::to_string(&result).into_diagnostic()?);
                    std::process::exit(1);
                }
            }
        }

        Commands::Serve { addr } => serve(config, &addr),
    }
}

#[cfg(feature = "server")]
fn serve(config: EngineConfig, addr: &str) -> Result<()> {
    let addr: std::net::SocketAddr = addr.parse().into_diagnostic()?;
    let engine = Arc::new(Engine::new(config).into_diagnostic()?);
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(khepri::server::serve(engine, addr)).into_diagnostic()?;
    Ok(())
}

#[cfg(not(feature = "server"))]
fn serve(_config: EngineConfig, _addr: &str) -> Result<()> {
    Err(miette::miette!(
        "this build has no HTTP surface; rebuild with `--features server`"
    ))
}
