use chrono::Utc;
use tracing::debug;

use higgstv_types::PROGRAM_ID_COUNTER;
use higgstv_types::collections::CHANNELS;
use higgstv_types::models::Program;

use super::{now, require_match};
use crate::dsl::{Document, Filter, Update};
use crate::error::{Result, StoreError};
use crate::sequence::SequenceService;
use crate::store::{CollectionSource, Store, to_document, with_transaction};

/// Programs live embedded in their channel; every write goes through the
/// channel document.
pub struct ProgramRepository<'a> {
    store: &'a dyn Store,
}

impl<'a> ProgramRepository<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    pub fn next_program_id(&self) -> Result<i64> {
        SequenceService::next(self.store, PROGRAM_ID_COUNTER)
    }

    /// Allocate an id for `program` and append it to the channel. On the
    /// relational store a missing channel also rolls back the allocation.
    pub fn add_program(&self, channel_id: &str, mut program: Program) -> Result<Program> {
        with_transaction(self.store, |tx| {
            program.id = SequenceService::next(tx, PROGRAM_ID_COUNTER)?;
            let stamp = Utc::now();
            program.created = stamp;
            program.last_modified = stamp;

            let update = Update::new()
                .push("contents", to_document(&program)?)
                .set("last_modified", now());
            let res = tx.collection(CHANNELS)?.update_one(&Filter::by_id(channel_id), &update)?;
            require_match(res, || format!("channel {}", channel_id))?;
            Ok(())
        })?;
        debug!("Added program {} to channel {}", program.id, channel_id);
        Ok(program)
    }

    /// Append a program keeping its existing id and timestamps.
    pub fn migrate_program(&self, channel_id: &str, program: &Program) -> Result<()> {
        let update = Update::new().push("contents", to_document(program)?);
        let res = self
            .store
            .collection(CHANNELS)?
            .update_one(&Filter::by_id(channel_id), &update)?;
        require_match(res, || format!("channel {}", channel_id))?;
        Ok(())
    }

    /// Set `fields` on one embedded program.
    pub fn update_program(&self, channel_id: &str, program_id: i64, fields: Document) -> Result<()> {
        let mut update = Update::new();
        for (field, value) in fields {
            if field == "_id" {
                return Err(StoreError::InvalidQuery("program ids are immutable".into()));
            }
            update = update.set(&format!("contents.$.{}", field), value);
        }
        let stamp = now();
        let update = update
            .set("contents.$.last_modified", stamp.clone())
            .set("last_modified", stamp);

        let filter = Filter::by_id(channel_id).eq("contents._id", program_id);
        let res = self.store.collection(CHANNELS)?.update_one(&filter, &update)?;
        require_match(res, || format!("program {} in channel {}", program_id, channel_id))?;
        Ok(())
    }

    /// Remove the listed programs and their places in the custom order.
    /// Fails with not-found when the channel holds none of them.
    pub fn delete_programs(&self, channel_id: &str, program_ids: &[i64]) -> Result<()> {
        let channels = self.store.collection(CHANNELS)?;
        let holding = Filter::by_id(channel_id).is_in("contents._id", program_ids.iter().copied());
        if program_ids.is_empty() || channels.count_documents(&holding)? == 0 {
            return Err(StoreError::not_found(format!("programs {:?} in channel {}", program_ids, channel_id)));
        }

        let ids: Vec<serde_json::Value> = program_ids.iter().copied().map(Into::into).collect();
        let update = Update::new()
            .pull_where_in("contents", "_id", ids.clone())
            .pull("contents_order", serde_json::json!({ "$in": ids }))
            .set("last_modified", now());
        channels.update_one(&Filter::by_id(channel_id), &update)?;
        Ok(())
    }

    pub fn set_order(&self, channel_id: &str, order: &[i64]) -> Result<()> {
        let update = Update::new()
            .set("contents_order", order.to_vec())
            .set("last_modified", now());
        let res = self
            .store
            .collection(CHANNELS)?
            .update_one(&Filter::by_id(channel_id), &update)?;
        require_match(res, || format!("channel {}", channel_id))?;
        Ok(())
    }
}
