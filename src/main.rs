use anyhow::{Context, Result, anyhow};
use clap::Parser;
use codegraph::db::{Db, GraphStore};
use codegraph::enrich::EnrichmentCache;
use codegraph::indexer::{Indexer, IndexerOptions, RepositoryOptions};
use codegraph::model::RunStats;
use codegraph::cli;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const LAST_RUN_KEY: &str = "last_run";

fn default_db_path(repo: &Path) -> PathBuf {
    repo.join(".codegraph").join("graph.sqlite")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn save_last_run(indexer: &Indexer, stats: &RunStats) -> Result<()> {
    if let Some(db) = indexer.db() {
        db.set_meta(LAST_RUN_KEY, &serde_json::to_string(stats)?)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("codegraph=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    match args.command {
        cli::Command::Index {
            repo,
            db,
            clear,
            no_ignore,
            skip_enrichment,
            strategy,
        } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&repo));
            let mut options = IndexerOptions::default();
            options.scan.no_ignore = no_ignore;
            if let Some(strategy) = strategy {
                options.update_strategy = strategy;
            }
            let indexer = Indexer::new(repo, db_path)?.with_options(options);
            let stats = indexer.index_repository(&RepositoryOptions {
                clear_first: clear,
                run_enrichment: !skip_enrichment,
                create_embeddings: false,
            })?;
            save_last_run(&indexer, &stats)?;
            print_json(&stats)
        }
        cli::Command::IndexFile { repo, db, path } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&repo));
            let indexer = Indexer::new(repo, db_path)?;
            let stats = indexer.index_unit(&path)?;
            save_last_run(&indexer, &stats)?;
            print_json(&stats)
        }
        cli::Command::Extract { repo, path } => {
            let repo = std::fs::canonicalize(&repo).unwrap_or(repo);
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            };
            let rel_path = codegraph::util::normalize_rel_path(&repo, &path)?;
            let source = codegraph::util::read_to_string(&path)?;
            let unit = codegraph::indexer::extract_source(&rel_path, &source)?;
            print_json(&unit)
        }
        cli::Command::Stats { repo, db } => {
            let db = open_db(&repo, db)?;
            print_json(&db.graph_stats()?)
        }
        cli::Command::Show { repo, db, key } => {
            let db = open_db(&repo, db)?;
            let entity = db
                .find_by_key(&key)?
                .ok_or_else(|| anyhow!("no entity with key `{key}`"))?;
            let outgoing = db.edges_from(&key)?;
            let incoming = db.edges_to(&key)?;
            print_json(&json!({
                "entity": entity,
                "outgoing": outgoing,
                "incoming": incoming,
            }))
        }
        cli::Command::Status { repo, db } => {
            let db_path = db.unwrap_or_else(|| default_db_path(&repo));
            let db = Db::new(&db_path)?;
            let last_run: Value = match db.get_meta(LAST_RUN_KEY)? {
                Some(raw) => serde_json::from_str(&raw).context("parse last run report")?,
                None => Value::Null,
            };
            print_json(&json!({
                "db": db.db_path().display().to_string(),
                "schema_version": db.get_meta("schema_version")?,
                "files": db.list_files()?.len(),
                "last_run": last_run,
            }))
        }
        cli::Command::ClearCache { repo, db } => {
            let db = open_db(&repo, db)?;
            let removed = EnrichmentCache::clear(&db)?;
            print_json(&json!({ "removed": removed }))
        }
    }
}

fn open_db(repo: &Path, db: Option<PathBuf>) -> Result<Db> {
    let db_path = db.unwrap_or_else(|| default_db_path(repo));
    Db::new(&db_path)
}
