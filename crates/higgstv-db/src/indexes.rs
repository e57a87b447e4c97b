use tracing::info;

use higgstv_types::collections::{CHANNELS, USERS};

use crate::dsl::{IndexKeys, IndexOptions};
use crate::error::Result;
use crate::store::Store;

fn index(keys: IndexKeys, unique: bool, sparse: bool) -> (IndexKeys, IndexOptions) {
    let opts = IndexOptions {
        name: Some(keys.default_name()),
        unique,
        sparse,
    };
    (keys, opts)
}

fn wanted() -> Vec<(&'static str, (IndexKeys, IndexOptions))> {
    vec![
        (USERS, index(IndexKeys::asc("username"), true, false)),
        (USERS, index(IndexKeys::asc("email"), true, false)),
        (USERS, index(IndexKeys::asc("access_key"), false, true)),
        (CHANNELS, index(IndexKeys::asc("owners"), false, false)),
        (CHANNELS, index(IndexKeys::desc("last_modified"), false, false)),
        (CHANNELS, index(IndexKeys::asc("name"), false, false)),
        (CHANNELS, index(IndexKeys::asc("tags"), false, false)),
        (CHANNELS, index(IndexKeys::asc("contents._id"), false, false)),
    ]
}

/// Create the indexes the repositories rely on. Safe to call repeatedly.
/// The relational schema already carries them, so there this only logs.
pub fn ensure_indexes(store: &dyn Store) -> Result<()> {
    for (collection, (keys, opts)) in wanted() {
        store.collection(collection)?.create_index(&keys, &opts)?;
    }
    info!("Indexes ensured on {} store", store.kind().as_str());
    Ok(())
}
