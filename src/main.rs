//! Tree Knowledge Base CLI
//!
//! Index documents into summarized trees and query them with LLM reasoning.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tree_knowledge_base::{
    config::Config,
    document::{Document, SegmentKind},
    llm::{LanguageModel, LlmClient, OfflineModel},
    manager::{DocumentManager, DocumentState, IndexJob},
    outline::{RawOutline, from_markdown},
    persistence::{FileStore, tree_size},
    retrieval::SearchRequest,
    tree_search::statistics,
};
use walkdir::WalkDir;

/// File extensions picked up when indexing a directory.
const INDEXABLE_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

/// Tree Knowledge Base - vectorless document retrieval
#[derive(Parser)]
#[command(name = "kb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or rebuild) the tree index for a document, or for every
    /// Markdown and text file under a directory
    Index {
        /// Path to the document (Markdown or plain text) or a directory
        document: PathBuf,

        /// Document id; defaults to the file stem
        #[arg(long)]
        id: Option<String>,

        /// JSON outline produced by an external parser
        #[arg(long)]
        outline: Option<PathBuf>,

        /// Split the document into pages on this delimiter instead of lines
        #[arg(long)]
        page_delimiter: Option<String>,

        /// Skip LLM summarization
        #[arg(long)]
        no_summaries: bool,

        /// Use extractive summaries only, without contacting the LLM
        #[arg(long)]
        offline: bool,

        /// Documents indexed at once when given a directory
        #[arg(long, default_value_t = 4)]
        max_concurrent: usize,
    },

    /// Search indexed documents
    Search {
        /// The search query
        query: String,

        /// Restrict the search to these document ids
        #[arg(long = "doc")]
        docs: Vec<String>,

        /// Number of results to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Return results without synthesizing an answer
        #[arg(long)]
        no_answer: bool,

        /// Token budget for the answer context
        #[arg(long)]
        max_context_tokens: Option<usize>,

        /// Keyword scoring only, without contacting the LLM
        #[arg(long)]
        offline: bool,

        /// Print the response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Display the tree of a document
    Show {
        /// Document id
        id: String,

        /// Print a single node with its full text
        #[arg(long)]
        node: Option<String>,

        /// Output as JSON instead of formatted tree
        #[arg(long)]
        json: bool,
    },

    /// Show information about a document
    Info {
        /// Document id
        id: String,
    },

    /// List known documents and their state
    List {
        /// Only documents in this state (pending, indexing, ready, error)
        #[arg(long)]
        state: Option<String>,
    },

    /// Remove a document and its stored tree
    Delete {
        /// Document id
        id: String,
    },

    /// Check a stored tree for structural problems
    Validate {
        /// Document id
        id: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show document counts and storage use
    Stats {
        /// Print the statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Test LLM connection
    Test,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("KB_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }
    config.validate_limits().context("Invalid configuration")?;

    match cli.command {
        Commands::Index {
            document,
            id,
            outline,
            page_delimiter,
            no_summaries,
            offline,
            max_concurrent,
        } if document.is_dir() => {
            if id.is_some() || outline.is_some() {
                anyhow::bail!("--id and --outline apply to a single document, not a directory");
            }
            cmd_index_dir(&config, &document, page_delimiter, no_summaries, offline, max_concurrent)
                .await
        }
        Commands::Index {
            document,
            id,
            outline,
            page_delimiter,
            no_summaries,
            offline,
            ..
        } => {
            cmd_index(
                &config,
                document,
                id,
                outline,
                page_delimiter,
                no_summaries,
                offline,
            )
            .await
        }
        Commands::Search {
            query,
            docs,
            top_k,
            no_answer,
            max_context_tokens,
            offline,
            json,
        } => {
            let mut request = SearchRequest::from_options(query, &config.retrieval);
            if let Some(k) = top_k {
                request = request.top_k(k);
            }
            if let Some(budget) = max_context_tokens {
                request = request.max_context_tokens(budget);
            }
            if no_answer {
                request = request.with_answer(false);
            }
            cmd_search(&config, request, docs, offline, json).await
        }
        Commands::Show { id, node, json } => cmd_show(&config, &id, node, json).await,
        Commands::Info { id } => cmd_info(&config, &id).await,
        Commands::List { state } => cmd_list(&config, state.as_deref()).await,
        Commands::Delete { id } => cmd_delete(&config, &id).await,
        Commands::Validate { id, json } => cmd_validate(&config, &id, json).await,
        Commands::Stats { json } => cmd_stats(&config, json).await,
        Commands::Test => cmd_test(&config).await,
    }
}

fn language_model(config: &Config, offline: bool) -> Result<Arc<dyn LanguageModel>> {
    if offline {
        return Ok(Arc::new(OfflineModel));
    }
    config.validate().context("Invalid configuration")?;
    let client = LlmClient::new(config.llm.clone()).context("Failed to create LLM client")?;
    Ok(Arc::new(client))
}

fn store(config: &Config) -> Arc<FileStore> {
    Arc::new(FileStore::new(config.data_dir(), config.storage.format))
}

async fn open_manager(config: &Config, llm: Arc<dyn LanguageModel>) -> Result<DocumentManager> {
    let manager = DocumentManager::from_config(llm, store(config), config);
    manager
        .restore()
        .await
        .context("Failed to read the data directory")?;
    Ok(manager)
}

async fn cmd_index(
    config: &Config,
    document_path: PathBuf,
    id: Option<String>,
    outline_path: Option<PathBuf>,
    page_delimiter: Option<String>,
    no_summaries: bool,
    offline: bool,
) -> Result<()> {
    let document = match &page_delimiter {
        Some(delimiter) => Document::from_text_file_with_delimiter(&document_path, delimiter),
        None => Document::from_text_file(&document_path),
    }
    .context("Failed to load document")?;

    let outline = match &outline_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read outline '{}'", path.display()))?;
            RawOutline::from_json(&json).context("Failed to parse outline")?
        }
        None if document.kind == SegmentKind::Line => from_markdown(&document.raw_content()),
        None => {
            info!("no outline given for a paged document, indexing it as a single section");
            RawOutline::default()
        }
    };

    let id = id.unwrap_or_else(|| document.name.clone());
    let manager = open_manager(config, language_model(config, offline)?).await?;

    println!("Indexing document: {} (id: {})", document_path.display(), id);
    println!(
        "  Document: {} ({} segments, ~{} tokens)",
        document.name,
        document.segment_count(),
        document.total_tokens()
    );

    let mut options = config.index.clone();
    if no_summaries {
        options.generate_summaries = false;
    }

    let start = Instant::now();
    let indexing = manager.index(&id, &outline, &document, Some(&options));
    tokio::pin!(indexing);
    let result = tokio::select! {
        result = &mut indexing => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling...");
            manager.cancel(&id)?;
            indexing.await
        }
    };
    let tree = result.context("Failed to build tree index")?;

    println!("\nTree Index Built:");
    println!("  Sections:    {}", tree.node_count());
    println!("  Max depth:   {}", tree.max_depth());
    println!("  Version:     {}", tree.version);
    println!("  Build time:  {:.2?}", start.elapsed());
    Ok(())
}

/// Markdown and text files under `dir`, in path order.
fn indexable_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| INDEXABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    files
}

async fn cmd_index_dir(
    config: &Config,
    dir: &Path,
    page_delimiter: Option<String>,
    no_summaries: bool,
    offline: bool,
    max_concurrent: usize,
) -> Result<()> {
    let mut jobs = Vec::new();
    for path in indexable_files(dir) {
        let document = match &page_delimiter {
            Some(delimiter) => Document::from_text_file_with_delimiter(&path, delimiter),
            None => Document::from_text_file(&path),
        };
        let document = match document {
            Ok(document) => document,
            Err(e) => {
                eprintln!("  skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let outline = if document.kind == SegmentKind::Line {
            from_markdown(&document.raw_content())
        } else {
            RawOutline::default()
        };
        jobs.push(IndexJob {
            document_id: document.name.clone(),
            outline,
            document,
        });
    }
    if jobs.is_empty() {
        println!("No Markdown or text files under {}", dir.display());
        return Ok(());
    }

    let mut config = config.clone();
    if no_summaries {
        config.index.generate_summaries = false;
    }
    let manager = open_manager(&config, language_model(&config, offline)?).await?;

    println!("Indexing {} documents from {}", jobs.len(), dir.display());
    let start = Instant::now();
    let report = manager.index_batch(&jobs, max_concurrent).await;

    println!("
Batch finished in {:.2?}:", start.elapsed());
    println!("  Indexed:  {}/{}", report.succeeded.len(), report.total());
    for (id, error) in &report.failed {
        println!("  Failed:   {} ({})", id, error);
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} of {} documents failed to index", report.failed.len(), report.total());
    }
    Ok(())
}

async fn cmd_search(
    config: &Config,
    request: SearchRequest,
    docs: Vec<String>,
    offline: bool,
    json: bool,
) -> Result<()> {
    let manager = open_manager(config, language_model(config, offline)?).await?;
    let ids = (!docs.is_empty()).then_some(docs);

    let response = manager
        .search(&request, ids.as_deref())
        .await
        .context("Search failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("Searching for: \"{}\"\n", response.query);
    if response.results.is_empty() {
        println!("No relevant sections found.");
    } else {
        println!("Results:");
        println!("{}", "─".repeat(60));
        for (i, result) in response.results.iter().enumerate() {
            let title = if result.title.is_empty() {
                "(untitled)"
            } else {
                result.title.as_str()
            };
            println!(
                "{:>2}. {} / {} [{}] [{}-{}] score {:.2} ({})",
                i + 1,
                result.document_id,
                title,
                result.node_id,
                result.page_index.start,
                result.page_index.end,
                result.score,
                result.scoring_method
            );
            if let Some(summary) = &result.summary {
                println!("    {}", summary);
            }
        }
        println!("{}", "─".repeat(60));
    }

    if let Some(answer) = &response.answer {
        println!("\nAnswer:\n{}", answer);
    }
    if response.context_dropped > 0 {
        println!(
            "\n({} lower-scored sections left out of the answer context)",
            response.context_dropped
        );
    }
    if response.timed_out {
        println!("\n(search deadline reached; slow documents were keyword scored)");
    }
    println!("\nFound {} results in {} ms", response.results.len(), response.latency_ms);
    Ok(())
}

async fn cmd_show(config: &Config, id: &str, node: Option<String>, json: bool) -> Result<()> {
    let manager = open_manager(config, Arc::new(OfflineModel)).await?;

    if let Some(node_id) = node {
        let node = manager.node_content(id, &node_id)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&node)?);
        } else {
            println!("[{}] {}", node.node_id, node.title);
            if let Some(summary) = &node.summary {
                println!("Summary ({:?}): {}", node.summary_source, summary);
            }
            println!("{}\n{}", "─".repeat(60), node.text);
        }
        return Ok(());
    }

    let tree = manager.tree(id)?;
    if json {
        println!("{}", tree.to_json().context("Failed to serialize tree")?);
    } else {
        println!("{}", tree.format());
    }
    Ok(())
}

async fn cmd_info(config: &Config, id: &str) -> Result<()> {
    let store = store(config);
    let manager = DocumentManager::from_config(Arc::new(OfflineModel), store.clone(), config);
    manager.restore().await?;
    let status = manager.status(id)?;

    println!("Document Information");
    println!("{}", "─".repeat(40));
    println!("  Id:           {}", status.document_id);
    println!("  Name:         {}", status.name);
    println!("  State:        {}", status.state);
    println!("  Updated:      {}", status.updated_at.to_rfc3339());

    if let Ok(tree) = manager.tree(id) {
        let stats = statistics(&tree);
        println!("  Version:      {}", tree.version);
        println!("  Sections:     {}", stats.total_nodes);
        println!("  Max depth:    {}", stats.max_depth);
        println!("  Top level:    {}", stats.root_nodes);
        println!("  Leaves:       {}", stats.leaf_nodes);
        if let Some(desc) = &tree.description {
            println!("  Description:  {}", desc);
        }
        let path = store.tree_path(id, config.storage.format);
        if let Ok(size) = tree_size(&path) {
            println!("  File size:    {:.1} KB", size as f64 / 1024.0);
            println!("  Index path:   {}", path.display());
        }
    }
    Ok(())
}

async fn cmd_list(config: &Config, state: Option<&str>) -> Result<()> {
    let manager = open_manager(config, Arc::new(OfflineModel)).await?;
    let statuses = match state {
        Some(state) => manager.statuses_in(state),
        None => manager.statuses(),
    };
    if statuses.is_empty() {
        match state {
            Some(state) => println!("No {} documents in {}", state, config.data_dir().display()),
            None => println!("No documents in {}", config.data_dir().display()),
        }
        return Ok(());
    }

    println!("{:<24} {:<10} {:>7}  Name", "Id", "State", "Version");
    for status in statuses {
        let version = status
            .tree_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = match &status.state {
            DocumentState::Error { kind, .. } => format!("error:{:?}", kind).to_lowercase(),
            other => other.name().to_string(),
        };
        println!(
            "{:<24} {:<10} {:>7}  {}",
            status.document_id, state, version, status.name
        );
    }
    Ok(())
}

async fn cmd_delete(config: &Config, id: &str) -> Result<()> {
    let manager = open_manager(config, Arc::new(OfflineModel)).await?;
    manager
        .delete(id)
        .await
        .with_context(|| format!("Failed to delete '{}'", id))?;
    println!("Deleted {}", id);
    Ok(())
}

async fn cmd_validate(config: &Config, id: &str, json: bool) -> Result<()> {
    let manager = open_manager(config, Arc::new(OfflineModel)).await?;
    let report = manager.validate(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    if !report.is_healthy() {
        anyhow::bail!("tree '{}' is not healthy", id);
    }
    Ok(())
}

async fn cmd_stats(config: &Config, json: bool) -> Result<()> {
    let manager = open_manager(config, Arc::new(OfflineModel)).await?;
    let stats = manager.storage_stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Knowledge Base Statistics");
    println!("{}", "─".repeat(40));
    println!("  Data dir:     {}", config.data_dir().display());
    println!("  Documents:    {}", stats.total_documents);
    for (state, count) in &stats.by_state {
        println!("    {:<10}  {}", state, count);
    }
    println!("  Sections:     {}", stats.total_nodes);
    println!("  Storage:      {:.1} KB", stats.storage_bytes as f64 / 1024.0);
    Ok(())
}

async fn cmd_test(config: &Config) -> Result<()> {
    println!("Testing LLM connection...\n");

    println!("Configuration:");
    println!("  API Base:  {}", config.llm.api_base);
    println!("  Model:     {}", config.llm.model);
    let key_prefix: String = config.llm.api_key.chars().take(8).collect();
    println!("  API Key:   {}...", key_prefix);
    println!();

    if let Err(e) = config.validate() {
        println!("Configuration error: {}", e);
        return Ok(());
    }

    let client = LlmClient::new(config.llm.clone())?;

    println!("Sending test request...");
    match client.test_connection().await {
        Ok(()) => println!("Connection successful!"),
        Err(e) => println!("Connection failed: {}", e),
    }

    Ok(())
}
