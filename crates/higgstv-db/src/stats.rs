use serde::Serialize;
use serde_json::Value;

use higgstv_types::collections::{CHANNELS, COUNTERS, MIGRATIONS, USERS};

use crate::dsl::{Filter, FindOptions};
use crate::error::Result;
use crate::store::{CollectionSource, Store};

/// Document counts of a store, for diagnostics and migration checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub collections: Vec<(String, i64)>,
    /// Programs embedded across all channels.
    pub programs: i64,
}

impl StoreStats {
    pub fn collect(store: &dyn Store) -> Result<Self> {
        let mut collections = Vec::new();
        for name in [USERS, CHANNELS, COUNTERS, MIGRATIONS] {
            let count = store.collection(name)?.count_documents(&Filter::new())?;
            collections.push((name.to_string(), count));
        }
        Ok(Self {
            collections,
            programs: embedded_programs(store)?,
        })
    }

    pub fn count(&self, name: &str) -> i64 {
        self.collections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }
}

pub fn embedded_programs(store: &dyn Store) -> Result<i64> {
    let channels = store.collection(CHANNELS)?.find(&Filter::new(), &FindOptions::default())?;
    Ok(channels
        .iter()
        .map(|ch| ch.get("contents").and_then(Value::as_array).map_or(0, Vec::len) as i64)
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentStore;
    use serde_json::json;

    #[test]
    fn test_counts_embedded_programs() {
        let store = DocumentStore::temporary().unwrap();
        let channels = store.collection(CHANNELS).unwrap();
        for (id, n) in [("A", 2), ("B", 0), ("C", 3)] {
            let contents: Vec<Value> = (0..n).map(|i| json!({"_id": i})).collect();
            let doc = json!({"_id": id, "contents": contents});
            channels.insert_one(doc.as_object().unwrap().clone()).unwrap();
        }
        let stats = StoreStats::collect(&store).unwrap();
        assert_eq!(stats.programs, 5);
        assert_eq!(stats.count(CHANNELS), 3);
        assert_eq!(stats.count(USERS), 0);
    }
}
