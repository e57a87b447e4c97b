//! Loading `mongoexport` output into the document store.
//!
//! Both the line-per-document and `--jsonArray` layouts are accepted. Typed
//! extended-JSON wrappers for numbers and dates are unwrapped to plain JSON;
//! binary and object-id wrappers are kept so identifiers can be normalized
//! later.

use std::io::Read;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::DocumentStore;
use crate::error::{Result, StoreError};
use crate::store::CollectionSource;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub inserted: usize,
    pub duplicates: usize,
}

impl DocumentStore {
    pub fn import_json<R: Read>(&self, collection: &str, mut reader: R) -> Result<ImportStats> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| StoreError::Backend(format!("reading {} export: {}", collection, e)))?;

        let docs: Vec<Value> = if text.trim_start().starts_with('[') {
            serde_json::from_str(&text)?
        } else {
            text.lines()
                .filter(|line| !line.trim().is_empty())
                .map(serde_json::from_str)
                .collect::<std::result::Result<_, _>>()?
        };

        let coll = self.collection(collection)?;
        let mut stats = ImportStats::default();
        for value in docs {
            let Value::Object(doc) = relax(value) else {
                return Err(StoreError::InvalidQuery(format!("{} export holds a non-object entry", collection)));
            };
            match coll.insert_one(doc) {
                Ok(()) => stats.inserted += 1,
                Err(e) if e.is_duplicate_key() => {
                    debug!("Skipping duplicate document in {}: {}", collection, e);
                    stats.duplicates += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Imported {} documents into {} ({} duplicates skipped)",
            stats.inserted, collection, stats.duplicates
        );
        Ok(stats)
    }
}

/// Unwrap extended-JSON number and date wrappers, recursively.
pub fn relax(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((key, inner)) = map.iter().next() {
                    if let Some(plain) = unwrap_typed(key, inner) {
                        return plain;
                    }
                }
            }
            Value::Object(map.into_iter().map(|(k, v)| (k, relax(v))).collect::<Map<_, _>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(relax).collect()),
        other => other,
    }
}

fn unwrap_typed(key: &str, inner: &Value) -> Option<Value> {
    match key {
        "$numberInt" | "$numberLong" => inner.as_str()?.parse::<i64>().ok().map(Value::from),
        "$numberDouble" | "$numberDecimal" => {
            let f = inner.as_str()?.parse::<f64>().ok()?;
            serde_json::Number::from_f64(f).map(Value::Number)
        }
        "$date" => date_string(inner).map(Value::String),
        _ => None,
    }
}

fn date_string(inner: &Value) -> Option<String> {
    let millis = match inner {
        Value::String(s) => {
            return Some(match DateTime::parse_from_rfc3339(s) {
                Ok(dt) => format_timestamp(dt.with_timezone(&Utc)),
                Err(_) => s.clone(),
            });
        }
        Value::Number(n) => n.as_i64()?,
        Value::Object(map) => map.get("$numberLong")?.as_str()?.parse::<i64>().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single().map(format_timestamp)
}

pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
