//! Structural migrations, recorded in the `migrations` collection once
//! applied.

use chrono::Utc;
use tracing::{debug, info};

use higgstv_types::collections::MIGRATIONS;
use higgstv_types::models::MigrationRecord;

use crate::dsl::Filter;
use crate::error::Result;
use crate::indexes;
use crate::store::{CollectionExt, CollectionSource, Store};

pub struct Migration {
    pub id: &'static str,
    pub description: &'static str,
    pub up: fn(&dyn Store) -> Result<()>,
}

pub const REGISTRY: &[Migration] = &[Migration {
    id: "001_initial_schema",
    description: "Create user and channel indexes",
    up: indexes::ensure_indexes,
}];

/// Apply every registered migration not yet recorded. Returns the ids
/// applied by this call.
pub fn run_migrations(store: &dyn Store) -> Result<Vec<&'static str>> {
    run_registry(store, REGISTRY)
}

fn run_registry(store: &dyn Store, registry: &[Migration]) -> Result<Vec<&'static str>> {
    let mut applied = Vec::new();
    for migration in registry {
        let records = store.collection(MIGRATIONS)?;
        if records.find_optional(&Filter::by_id(migration.id))?.is_some() {
            debug!("Migration {} already applied", migration.id);
            continue;
        }

        (migration.up)(store)?;

        let record = MigrationRecord {
            id: migration.id.to_string(),
            description: migration.description.to_string(),
            executed_at: Utc::now(),
        };
        match records.insert_as(&record) {
            Ok(()) => {}
            // another process recorded it first
            Err(e) if e.is_duplicate_key() => debug!("Migration {} recorded concurrently", migration.id),
            Err(e) => return Err(e),
        }
        info!("Applied migration {}: {}", migration.id, migration.description);
        applied.push(migration.id);
    }
    Ok(applied)
}
