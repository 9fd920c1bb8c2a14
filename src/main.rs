//! CLI entry point for the matching engine.
//!
//! Provides commands for building an index artifact from an embedding file,
//! serving it over HTTP, and inspecting configuration.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use proxima::config::Settings;
use proxima::index::{BuilderConfig, IndexArtifact, IndexBuilder};
use proxima::server::{AppState, ServeOptions, ServingIndex, serve};
use proxima::vector::{ItemId, KMeansConfig, VectorDimension};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(
    name = "proxima",
    version = env!("CARGO_PKG_VERSION"),
    about = "Approximate nearest neighbor matching engine",
    long_about = "Build a partitioned, quantized index over item embeddings and serve top-K similarity queries over HTTP.",
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to a custom proxima.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an index artifact from embeddings
    #[command(
        about = "Build an index artifact from a JSONL embedding file",
        after_help = "Input format, one record per line:\n  {\"id\": \"item-1\", \"embedding\": [0.1, 0.2, ...]}\n\nExamples:\n  proxima build --input embeddings.jsonl --output index/\n  proxima build --input embeddings.jsonl --output index/ --partitions 64 --seed 42"
    )]
    Build {
        /// JSONL file of {"id", "embedding"} records
        #[arg(short, long)]
        input: PathBuf,

        /// Directory to write the artifact into
        #[arg(short, long)]
        output: PathBuf,

        /// Expected embedding dimension (default: taken from the first record)
        #[arg(short, long)]
        dimension: Option<usize>,

        /// Partition count (default: ceil(sqrt(N)))
        #[arg(long)]
        partitions: Option<usize>,

        /// Seed for a reproducible build
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Serve an index artifact over HTTP
    #[command(
        about = "Serve an index artifact over HTTP",
        after_help = "Examples:\n  proxima serve --artifact index/\n  proxima serve --artifact index/ --bind 0.0.0.0:8080"
    )]
    Serve {
        /// Artifact directory produced by 'proxima build'
        #[arg(short, long)]
        artifact: Option<PathBuf>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Show current configuration settings
    #[command(about = "Display the effective settings as TOML")]
    Config,
}

/// One line of the build input file.
#[derive(Deserialize)]
struct EmbeddingRecord {
    id: String,
    embedding: Vec<f32>,
}

fn read_embeddings(path: &PathBuf) -> anyhow::Result<Vec<(ItemId, Vec<f32>)>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut items = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EmbeddingRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed record", path.display(), line_no + 1))?;
        items.push((ItemId::from(record.id), record.embedding));
    }
    Ok(items)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    match cli.command {
        Commands::Build {
            input,
            output,
            dimension,
            partitions,
            seed,
        } => {
            let items = read_embeddings(&input)?;
            anyhow::ensure!(!items.is_empty(), "no records in {}", input.display());
            let dimension = VectorDimension::new(dimension.unwrap_or(items[0].1.len()))?;

            let builder = IndexBuilder::new(BuilderConfig {
                metric: settings.index.metric,
                partitions: partitions.or(settings.index.partitions),
                num_subspaces: settings.index.num_subspaces,
                kmeans: KMeansConfig {
                    max_iterations: settings.index.kmeans_iterations,
                    seed: seed.or(settings.index.seed),
                    ..KMeansConfig::default()
                },
            });

            let start = Instant::now();
            let artifact = builder.build(dimension, items)?;
            artifact.save(&output)?;
            tracing::info!(
                items = artifact.item_count(),
                partitions = artifact.partition_count(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "artifact written to {}",
                output.display()
            );
        }

        Commands::Serve { artifact, bind } => {
            let path = artifact.unwrap_or_else(|| settings.artifact_path.clone());
            let bind = bind.unwrap_or_else(|| settings.server.bind.clone());
            let options = ServeOptions::from(&settings);
            let search = options.search.clone();

            let state = AppState::empty(options);
            let loaded = IndexArtifact::load(&path)
                .with_context(|| format!("loading artifact from {}", path.display()))?;
            tracing::info!(
                items = loaded.item_count(),
                partitions = loaded.partition_count(),
                dimension = loaded.dimension().get(),
                "artifact loaded"
            );
            state.install(ServingIndex::from_artifact(Arc::new(loaded), search));

            serve(state, &bind, CancellationToken::new()).await?;
        }

        Commands::Config => {
            println!("{}", settings.to_toml()?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
