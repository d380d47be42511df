use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kbsearch_core::config::Config;
use kbsearch_core::types::{ChunkRecord, RetrievalMode};
use kbsearch_hybrid::{Engine, RetrievalRequest};

#[derive(Parser)]
#[command(name = "kbsearch", about = "Hybrid lexical + vector retrieval over knowledge bases")]
struct Cli {
    /// Settings file; defaults to config.toml + config.<RUST_ENV>.toml + KBSEARCH_* env vars
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory relative index paths resolve against
    #[arg(long, global = true, default_value = ".")]
    base_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index chunks from a JSONL file, one chunk and its vector per line
    Ingest {
        file: PathBuf,
        /// Generation tag for lines that carry none
        #[arg(long, default_value = "1")]
        generation: String,
    },
    /// Run a retrieval request
    Query {
        query: String,
        #[arg(long = "kb", required = true)]
        kbs: Vec<String>,
        /// Enabled knowledge bases; all requested ones when omitted
        #[arg(long = "enabled")]
        enabled: Vec<String>,
        #[arg(long)]
        mode: Option<RetrievalMode>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        recall_k: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        min_term_coverage: Option<f64>,
        /// Print the full output with diagnostics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete one document from both indexes
    DeleteDoc { kb: String, doc: String },
    /// Delete a whole knowledge base from both indexes
    DeleteKb { kb: String },
    /// Print chunks `start..=end` of a document
    Neighbors { kb: String, doc: String, start: u32, end: u32 },
}

#[derive(Deserialize)]
struct IngestLine {
    kb_id: String,
    doc_id: String,
    #[serde(default)]
    filename: String,
    chunk_id: String,
    chunk_index: u32,
    content: String,
    #[serde(default)]
    generation: Option<String>,
    vector: Vec<f32>,
}

/// Chunks of one document generation, gathered from every line naming it.
struct DocBatch {
    filename: String,
    generation: String,
    chunks: Vec<ChunkRecord>,
    vectors: Vec<Vec<f32>>,
}

fn read_batches(path: &Path, default_generation: &str) -> anyhow::Result<BTreeMap<(String, String), DocBatch>> {
    let reader = BufReader::new(File::open(path).with_context(|| format!("opening {}", path.display()))?);
    let mut batches: BTreeMap<(String, String), DocBatch> = BTreeMap::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: IngestLine = serde_json::from_str(&line).with_context(|| format!("line {}", n + 1))?;
        let generation = row.generation.unwrap_or_else(|| default_generation.to_string());
        let batch = batches.entry((row.kb_id.clone(), row.doc_id.clone())).or_insert_with(|| DocBatch {
            filename: row.filename.clone(),
            generation,
            chunks: Vec::new(),
            vectors: Vec::new(),
        });
        batch.chunks.push(ChunkRecord {
            chunk_id: row.chunk_id,
            kb_id: row.kb_id,
            doc_id: row.doc_id,
            filename: row.filename,
            chunk_index: row.chunk_index,
            content: row.content,
            ingest_generation: batch.generation.clone(),
        });
        batch.vectors.push(row.vector);
    }
    Ok(batches)
}

async fn ingest(engine: &Engine, file: &Path, generation: &str) -> anyhow::Result<()> {
    let batches = read_batches(file, generation)?;
    let total: usize = batches.values().map(|b| b.chunks.len()).sum();
    println!("Ingesting {} chunks from {} documents", total, batches.len());
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    let mut stale = 0usize;
    for ((kb, doc), batch) in &batches {
        pb.set_message(format!("{kb}/{doc}"));
        let report = engine
            .indexer
            .ingest_document(kb, doc, &batch.filename, &batch.generation, &batch.chunks, &batch.vectors)
            .await
            .with_context(|| format!("ingesting {kb}/{doc}"))?;
        stale += report.stale_removed;
        pb.inc(report.chunks as u64);
    }
    pb.finish_with_message("done");
    println!("Indexed {} chunks, removed {} stale rows", total, stale);
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling request");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .map_err(|e| {
        eprintln!("Error loading config: {}", e);
        e
    })?;
    let engine = Engine::open(config.settings()?, &cli.base_dir).await?;

    match cli.command {
        Command::Ingest { file, generation } => ingest(&engine, &file, &generation).await?,
        Command::Query { query, kbs, enabled, mode, top_k, recall_k, threshold, min_term_coverage, json } => {
            let mut request = RetrievalRequest::new(query, kbs);
            if !enabled.is_empty() {
                request = request.enabled(enabled);
            }
            request.mode = mode;
            request.top_k = top_k;
            request.recall_k = recall_k;
            request.score_threshold = threshold;
            request.min_term_coverage = min_term_coverage;
            let out = engine.retriever.retrieve(&request, &cancel_on_ctrl_c()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                if let Some(reason) = out.diagnostics.empty_reason {
                    println!("No results ({reason:?})");
                }
                for (i, c) in out.candidates.iter().enumerate() {
                    println!("{}. [{:.4}] {}/{} #{} ({})", i + 1, c.final_score, c.kb_id, c.doc_id, c.chunk_index, c.chunk_id);
                    println!("   {}", c.content.chars().take(160).collect::<String>());
                }
                for f in &out.diagnostics.failed_sources {
                    println!("! {} search failed for {}: {}", f.source, f.kb_id, f.message);
                }
            }
        }
        Command::DeleteDoc { kb, doc } => {
            engine.indexer.delete_document(&kb, &doc).await?;
            info!(kb = %kb, doc = %doc, "document deleted");
        }
        Command::DeleteKb { kb } => {
            engine.indexer.delete_collection(&kb).await?;
            info!(kb = %kb, "knowledge base deleted");
        }
        Command::Neighbors { kb, doc, start, end } => {
            for chunk in engine.retriever.read_range(&kb, &doc, start..=end).await? {
                println!("#{} ({}) {}", chunk.chunk_index, chunk.chunk_id, chunk.content);
            }
        }
    }
    Ok(())
}
