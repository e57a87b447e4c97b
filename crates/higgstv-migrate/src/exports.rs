//! Seeding a document store from a directory of `mongoexport` files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::{info, warn};

use higgstv_db::DocumentStore;
use higgstv_db::document::import::ImportStats;
use higgstv_types::collections::{CHANNELS, COUNTERS, MIGRATIONS, USERS};

use crate::error::Result;

/// Collections looked for as `<name>.json`.
pub const EXPORTED: [&str; 4] = [USERS, CHANNELS, COUNTERS, MIGRATIONS];

/// Import every export present in `dir`. Missing files are skipped.
pub fn import_dir(store: &DocumentStore, dir: &Path) -> Result<Vec<(&'static str, ImportStats)>> {
    let mut imported = Vec::new();
    for name in EXPORTED {
        let path = dir.join(format!("{}.json", name));
        if !path.is_file() {
            warn!("No export for {} at {}", name, path.display());
            continue;
        }
        let stats = store.import_json(name, BufReader::new(File::open(&path)?))?;
        info!("Loaded {} from {}", name, path.display());
        imported.push((name, stats));
    }
    Ok(imported)
}
