use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};

use higgstv_db::config::DEFAULT_DOCUMENT_PATH;
use higgstv_db::{DocumentStore, SqliteStore, Store, StoreConfig, StoreKind, StoreStats};
use higgstv_migrate::{MigrateError, MigrationEngine, exports};

/// Copy a HiggsTV document store into a fresh SQLite database.
#[derive(Parser, Debug)]
#[command(name = "higgstv-migrate", version)]
struct Args {
    /// Destination SQLite file.
    #[arg(default_value = "./data/migrated_higgstv.db")]
    dest: PathBuf,

    /// Source document store directory. Defaults to the configured store.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Load `<collection>.json` exports from this directory into the source first.
    #[arg(long)]
    import: Option<PathBuf>,

    /// Overwrite an existing destination without asking.
    #[arg(long, short = 'y')]
    yes: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "higgstv=info,higgstv_db=info,higgstv_migrate=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = StoreConfig::from_env().context("reading database configuration")?;
    let timeout = config.connect_timeout;

    let source_path = match (&args.source, config.kind) {
        (Some(path), _) => path.clone(),
        (None, StoreKind::Document) => config.path(),
        (None, kind) => {
            warn!("Configured store is {}, reading the source from {}", kind.as_str(), DEFAULT_DOCUMENT_PATH);
            PathBuf::from(DEFAULT_DOCUMENT_PATH)
        }
    };

    if args.dest.exists() {
        if !args.yes && !confirm(&format!("{} exists. Overwrite? (y/N) ", args.dest.display()))? {
            println!("Aborted.");
            return Ok(());
        }
        remove_database(&args.dest)?;
    }
    if let Some(parent) = args.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    info!("Source: {}", source_path.display());
    info!("Destination: {}", args.dest.display());

    let source = open_within(timeout, "source", {
        let path = source_path.clone();
        move || DocumentStore::open(&path)
    })
    .await?;
    let dest = open_within(timeout, "destination", {
        let path = args.dest.clone();
        move || SqliteStore::open(&path)
    })
    .await?;

    let (source, dest, report) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        if let Some(dir) = &args.import {
            exports::import_dir(&source, dir).with_context(|| format!("importing {}", dir.display()))?;
        }
        let stats = StoreStats::collect(&source)?;
        println!("Source contents:");
        for (name, count) in &stats.collections {
            println!("  {:<11} {:>6}", name, count);
        }
        println!("  {:<11} {:>6}", "programs", stats.programs);

        let report = MigrationEngine::new(&source, &dest).run();
        Ok((source, dest, report))
    })
    .await
    .context("migration task panicked")??;

    let report = match report {
        Ok(report) => report,
        Err(e @ MigrateError::Connection { .. }) => bail!(e),
        Err(e) => return Err(e).context("migration aborted"),
    };
    println!("{}", report);

    if let Err(e) = dest.close().and_then(|()| source.close()) {
        warn!("Closing stores: {}", e);
    }
    Ok(())
}

async fn open_within<T, F>(timeout: Duration, side: &'static str, open: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> higgstv_db::Result<T> + Send + 'static,
{
    let store = tokio::time::timeout(timeout, tokio::task::spawn_blocking(open))
        .await
        .map_err(|_| MigrateError::connection(side, format!("no response within {:?}", timeout)))?
        .with_context(|| format!("opening {} store", side))?
        .map_err(|e| MigrateError::connection(side, e.to_string()))?;
    Ok(store)
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Remove a SQLite file together with its WAL and shared-memory siblings.
fn remove_database(path: &Path) -> anyhow::Result<()> {
    std::fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
    for suffix in ["-wal", "-shm"] {
        let mut sibling = path.as_os_str().to_owned();
        sibling.push(suffix);
        let sibling = PathBuf::from(sibling);
        if sibling.exists() {
            std::fs::remove_file(&sibling).with_context(|| format!("removing {}", sibling.display()))?;
        }
    }
    Ok(())
}
