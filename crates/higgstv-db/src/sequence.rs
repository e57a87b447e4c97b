//! Named monotonic counters, the only source of new program ids.

use serde_json::Value;
use tracing::debug;

use higgstv_types::collections::COUNTERS;

use crate::dsl::{Filter, FindOneAndUpdateOptions, Update};
use crate::error::{Result, StoreError};
use crate::store::{CollectionExt, CollectionSource};

/// Atomic counter operations over the `counters` collection.
///
/// On the relational store each call runs in the caller's transaction when
/// given one, so a rolled-back insert also rolls back its increment. On the
/// document store the increment is a compare-and-swap on the counter
/// document alone: it is linearizable, but a failed insert afterwards still
/// consumes the value. Gaps are tolerated either way.
pub struct SequenceService;

impl SequenceService {
    /// Increment `name` and return the new value, creating the counter at 1.
    pub fn next<S>(source: &S, name: &str) -> Result<i64>
    where
        S: CollectionSource + ?Sized,
    {
        let doc = source.collection(COUNTERS)?.find_one_and_update(
            &Filter::by_id(name),
            &Update::new().inc("seq", 1),
            FindOneAndUpdateOptions::default(),
        )?;
        let seq = seq_of(&doc.get("seq").cloned().unwrap_or(Value::Null), name)?;
        debug!("Counter {} advanced to {}", name, seq);
        Ok(seq)
    }

    /// Raise `name` to at least `floor`, never lowering it. Returns the
    /// resulting value.
    pub fn ensure_at_least<S>(source: &S, name: &str, floor: i64) -> Result<i64>
    where
        S: CollectionSource + ?Sized,
    {
        let doc = source.collection(COUNTERS)?.find_one_and_update(
            &Filter::by_id(name),
            &Update::new().max("seq", floor),
            FindOneAndUpdateOptions::default(),
        )?;
        seq_of(&doc.get("seq").cloned().unwrap_or(Value::Null), name)
    }

    /// Current value without incrementing; 0 when the counter is absent.
    pub fn current<S>(source: &S, name: &str) -> Result<i64>
    where
        S: CollectionSource + ?Sized,
    {
        match source.collection(COUNTERS)?.find_optional(&Filter::by_id(name))? {
            Some(doc) => seq_of(&doc.get("seq").cloned().unwrap_or(Value::Null), name),
            None => Ok(0),
        }
    }
}

fn seq_of(value: &Value, name: &str) -> Result<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(|| StoreError::Backend(format!("counter {} holds non-numeric seq {}", name, value)))
}
