//! # Grounded Knowledge CLI (`gk`)
//!
//! The `gk` binary loads a JSON corpus into an in-memory knowledge base and
//! runs one operation against it: ask a question, search, find similar
//! items, or print counters.
//!
//! ## Usage
//!
//! ```bash
//! gk [--config ./gk.toml] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gk ask --corpus <file> "<question>"` | Answer with citations |
//! | `gk search --corpus <file> "<query>"` | Ranked results |
//! | `gk similar --corpus <file> <item-id>` | Items close to an item |
//! | `gk stats --corpus <file>` | Base, source and item counts |
//! | `gk check-config` | Validate the configuration file |
//!
//! Logs go to stderr; set `GK_LOG` (e.g. `GK_LOG=debug`) to change the filter.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use grounded_core::models::{GroundedAnswer, RetrievalResults, SearchType};
use grounded_core::text::truncate_chars;
use grounded_knowledge::answerer::AnswerOptions;
use grounded_knowledge::config::{self, Config};
use grounded_knowledge::corpus::{load_corpus_file, LoadedCorpus};
use grounded_knowledge::retriever::SearchOptions;
use grounded_knowledge::KnowledgeService;

/// Grounded Knowledge CLI: hybrid retrieval and cited answers over a corpus.
#[derive(Parser)]
#[command(
    name = "gk",
    about = "Grounded Knowledge: hybrid retrieval and cited answers over a JSON corpus",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless `GK_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question from the corpus, with citations.
    Ask {
        /// Corpus file (JSON).
        #[arg(long)]
        corpus: PathBuf,

        /// The question.
        question: String,

        /// Maximum number of citations.
        #[arg(long)]
        limit: Option<usize>,

        /// Extra context prepended to the question for retrieval.
        #[arg(long)]
        context: Option<String>,

        /// Print the answer as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search the corpus.
    Search {
        #[arg(long)]
        corpus: PathBuf,

        query: String,

        /// `text`, `semantic` or `hybrid`. Defaults to `retrieval.default_search_type`.
        #[arg(long)]
        mode: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// List items similar to an item.
    Similar {
        #[arg(long)]
        corpus: PathBuf,

        /// Item id.
        item_id: String,

        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Skip items from the same source.
        #[arg(long)]
        exclude_same_source: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show counts for the loaded corpus.
    Stats {
        #[arg(long)]
        corpus: PathBuf,
    },

    /// Validate the configuration and print the effective settings.
    CheckConfig,
}

fn init_logging(verbose: bool) {
    let fallback = if verbose {
        "grounded_knowledge=debug,grounded_core=debug"
    } else {
        "grounded_knowledge=info,grounded_core=info"
    };
    let filter = EnvFilter::try_from_env("GK_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None => Ok(Config::default()),
    }
}

async fn open(cfg: &Config, corpus: &Path) -> Result<(KnowledgeService, LoadedCorpus)> {
    let service = KnowledgeService::from_config(cfg)?;
    let loaded = load_corpus_file(&service, corpus).await?;
    Ok((service, loaded))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask {
            corpus,
            question,
            limit,
            context,
            json,
        } => {
            let (service, loaded) = open(&cfg, &corpus).await?;
            let opts = AnswerOptions::with_limit(limit.unwrap_or(cfg.answer.max_citations));
            let answer = match context {
                Some(context) => {
                    service
                        .get_answer_with_context(&loaded.base_id, &question, &context, &opts)
                        .await?
                }
                None => service.get_answer(&loaded.base_id, &question, &opts).await?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print_answer(&answer);
            }
        }
        Commands::Search {
            corpus,
            query,
            mode,
            limit,
            json,
        } => {
            let search_type = match mode {
                Some(mode) => mode.parse::<SearchType>()?,
                None => cfg.retrieval.search_type(),
            };
            let (service, loaded) = open(&cfg, &corpus).await?;
            let opts = SearchOptions {
                limit: limit.unwrap_or(cfg.retrieval.default_limit),
                min_score: cfg.retrieval.min_score,
                ..SearchOptions::default()
            };
            let results = service
                .search(&loaded.base_id, &query, search_type, &opts)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
        }
        Commands::Similar {
            corpus,
            item_id,
            limit,
            exclude_same_source,
            json,
        } => {
            let (service, loaded) = open(&cfg, &corpus).await?;
            let results = service
                .get_similar_items(&loaded.base_id, &item_id, limit, exclude_same_source)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
        }
        Commands::Stats { corpus } => {
            let (service, loaded) = open(&cfg, &corpus).await?;
            let stats = service.stats(Some(&loaded.base_id)).await?;
            println!("Grounded Knowledge: Corpus Stats");
            println!("================================");
            println!();
            println!("  Base:        {}", loaded.base_id);
            println!("  Backend:     {}", stats.backend);
            println!("  Sources:     {}", stats.source_count);
            println!("  Items:       {}", stats.item_count);
            println!("  Embedded:    {}", stats.embedded_item_count);
            println!("  Tokens:      {}", stats.indexed_token_count);
        }
        Commands::CheckConfig => {
            config::validate(&cfg).context("Configuration is invalid")?;
            println!("Configuration OK.");
            println!("  storage.backend:               {}", cfg.storage.backend);
            println!("  retrieval.default_search_type: {}", cfg.retrieval.search_type());
            println!("  retrieval.default_limit:       {}", cfg.retrieval.default_limit);
            println!("  embedding.provider:            {}", cfg.embedding.provider);
            println!("  answer.max_citations:          {}", cfg.answer.max_citations);
        }
    }

    Ok(())
}

fn print_answer(answer: &GroundedAnswer) {
    println!("{}", answer.answer_text);
    println!();
    println!(
        "confidence: {:.2}  ({} of {} matches, {})",
        answer.confidence_score, answer.retrieval_count, answer.total_matches, answer.model_name
    );
    for (i, citation) in answer.citations.iter().enumerate() {
        println!();
        println!(
            "[{}] [{:.2}] {} / {}",
            i + 1,
            citation.relevance_score,
            citation.source_name,
            citation.item_id
        );
        println!("    excerpt: \"{}\"", citation.content_excerpt.replace('\n', " ").trim());
    }
}

fn print_results(results: &RetrievalResults) {
    if !results.has_results() {
        println!("No results.");
        return;
    }
    for result in &results.results {
        let title = result.item.title.as_deref().unwrap_or("(untitled)");
        println!("{}. [{:.2}] {} / {}", result.rank, result.score, result.item.source_id, title);
        if let Some(text) = result.text_score {
            println!("    text_score: {:.3}", text);
        }
        if let Some(vector) = result.vector_score {
            println!("    vector_score: {:.3}", vector);
        }
        let excerpt = result
            .highlights
            .first()
            .cloned()
            .unwrap_or_else(|| truncate_chars(&result.item.content, 200));
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", result.item.id);
        println!();
    }
    println!("{} of {} matches", results.count(), results.total_count);
}
