use tracing::info;

use higgstv_db::{Store, StoreConfig, StoreStats, open_store};

/// Connect to the configured store and print what it holds.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "higgstv=info,higgstv_db=info".into()),
        )
        .init();

    let config = StoreConfig::from_env()?;
    println!("Database type: {}", config.kind.as_str());
    println!("Database uri:  {}", config.uri);
    println!("Database name: {}", config.database);

    let timeout = config.connect_timeout;
    let opened = tokio::time::timeout(
        timeout,
        tokio::task::spawn_blocking(move || -> higgstv_db::Result<_> {
            let store = open_store(&config)?;
            store.ping()?;
            let stats = StoreStats::collect(store.as_ref())?;
            store.close()?;
            Ok(stats)
        }),
    )
    .await;

    let stats = match opened {
        Ok(joined) => joined??,
        Err(_) => anyhow::bail!("store did not respond within {:?}", timeout),
    };
    info!("Store reachable");

    println!("\nCollections:");
    for (name, count) in &stats.collections {
        println!("  {:<11} {:>8}", name, count);
    }
    println!("  {:<11} {:>8}", "programs", stats.programs);
    Ok(())
}
