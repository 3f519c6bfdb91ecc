use crate::config::UpdateStrategy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "codegraph",
    version,
    about = "Incremental knowledge-graph indexer for Python repositories",
    after_help = r#"Examples:
  codegraph index --repo .
  codegraph index --repo . --clear --skip-enrichment
  codegraph index-file --repo . src/app/models.py
  codegraph extract --repo . src/app/models.py
  codegraph show --repo . app.models.Order
  codegraph stats --repo .
"#
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Index the whole repository once and exit.
    Index {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Wipe the graph (not the enrichment cache) first.
        #[arg(long)]
        clear: bool,
        /// Include files ignored by .gitignore.
        #[arg(long)]
        no_ignore: bool,
        #[arg(long)]
        skip_enrichment: bool,
        /// fine-grained|recreate; overrides CODEGRAPH_UPDATE_STRATEGY.
        #[arg(long)]
        strategy: Option<UpdateStrategy>,
    },
    /// Index a single file (or drop it from the graph if it is gone).
    IndexFile {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        path: PathBuf,
    },
    /// Print the extracted entities of one file as JSON without storing them.
    Extract {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        path: PathBuf,
    },
    /// Print graph counts.
    Stats {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print one entity with its outgoing and incoming edges.
    Show {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        key: String,
    },
    /// Print the report of the last indexing run.
    Status {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Remove every enrichment cache entry.
    ClearCache {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}
