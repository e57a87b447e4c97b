use chrono::Utc;
use tracing::{debug, warn};

use higgstv_types::collections::{CHANNELS, USERS};
use higgstv_types::ident;
use higgstv_types::models::{Channel, ChannelType};

use super::{now, require_match};
use crate::dsl::{Filter, FindOptions, Sort, Update};
use crate::error::{Result, StoreError};
use crate::store::{Collection, CollectionExt, CollectionSource, Store, Tx, from_document, with_transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelSort {
    /// Most recently modified first.
    #[default]
    LastModified,
    Name,
}

#[derive(Debug, Clone, Default)]
pub struct ListChannelsQuery {
    pub owner: Option<String>,
    /// Case-insensitive substring of the channel name.
    pub name_contains: Option<String>,
    pub exclude_types: Vec<ChannelType>,
    /// Only channels holding at least one program.
    pub has_contents: bool,
    pub sort: ChannelSort,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl ListChannelsQuery {
    pub fn owned_by(user_id: &str) -> Self {
        Self {
            owner: Some(user_id.to_string()),
            ..Self::default()
        }
    }

    fn filter(&self) -> Filter {
        let mut filter = Filter::new();
        if let Some(owner) = &self.owner {
            filter = filter.eq("owners", owner.as_str());
        }
        if let Some(name) = &self.name_contains {
            filter = filter.regex("name", &escape_literal(name), "i");
        }
        if !self.exclude_types.is_empty() {
            filter = filter.not_in("type", self.exclude_types.iter().map(ChannelType::as_str));
        }
        if self.has_contents {
            filter = filter.exists("contents.0", true);
        }
        filter
    }

    fn options(&self) -> FindOptions {
        let sort = match self.sort {
            ChannelSort::LastModified => Sort::default().desc("last_modified"),
            ChannelSort::Name => Sort::default().asc("name"),
        };
        FindOptions {
            sort,
            limit: self.limit,
            skip: self.skip,
        }
    }
}

fn escape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '^' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub struct ChannelRepository<'a> {
    store: &'a dyn Store,
}

impl<'a> ChannelRepository<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    fn channels(&self) -> Result<Box<dyn Collection + 'a>> {
        self.store.collection(CHANNELS)
    }

    pub fn find_by_id(&self, id: &str) -> Result<Channel> {
        self.channels()?.find_one_as(&Filter::by_id(id))
    }

    /// Insert a channel and register it with each of its owners.
    pub fn create(&self, mut channel: Channel) -> Result<Channel> {
        if channel.id.is_empty() {
            channel.id = ident::new_id();
        }
        let stamp = Utc::now();
        channel.created = stamp;
        channel.last_modified = stamp;

        with_transaction(self.store, |tx| {
            tx.collection(CHANNELS)?.insert_as(&channel)?;
            link_owners(tx, &channel.id, &channel.owners)
        })?;
        debug!("Created channel {} ({})", channel.name, channel.id);
        Ok(channel)
    }

    /// Apply `update` to the channel, bumping `last_modified`.
    pub fn update(&self, id: &str, update: Update) -> Result<()> {
        let update = update.set("last_modified", now());
        let res = self.channels()?.update_one(&Filter::by_id(id), &update)?;
        require_match(res, || format!("channel {}", id))?;
        Ok(())
    }

    pub fn list(&self, query: &ListChannelsQuery) -> Result<Vec<Channel>> {
        self.channels()?.find_as(&query.filter(), &query.options())
    }

    pub fn count(&self, query: &ListChannelsQuery) -> Result<i64> {
        self.channels()?.count_documents(&query.filter())
    }

    /// Owners are admins; so is anyone holding an admin permission record.
    pub fn is_admin(&self, channel_id: &str, user_id: &str) -> Result<bool> {
        let Some(doc) = self.channels()?.find_optional(&Filter::by_id(channel_id))? else {
            return Ok(false);
        };
        let channel: Channel = from_document(doc)?;
        Ok(channel.is_owner(user_id)
            || channel
                .permission
                .iter()
                .any(|p| p.user_id == user_id && p.admin))
    }

    pub fn add_owners(&self, channel_id: &str, user_ids: &[String]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        with_transaction(self.store, |tx| {
            let update = Update::new()
                .add_each_to_set("owners", user_ids.iter().cloned())
                .set("last_modified", now());
            let res = tx.collection(CHANNELS)?.update_one(&Filter::by_id(channel_id), &update)?;
            require_match(res, || format!("channel {}", channel_id))?;
            link_owners(tx, channel_id, user_ids)
        })
    }

    /// Remove the channel and drop it from every user's `own_channels`.
    pub fn delete(&self, id: &str) -> Result<()> {
        with_transaction(self.store, |tx| {
            if tx.collection(CHANNELS)?.delete_one(&Filter::by_id(id))? == 0 {
                return Err(StoreError::not_found(format!("channel {}", id)));
            }

            let users = tx.collection(USERS)?;
            let holders = users.find(&Filter::new().eq("own_channels", id), &FindOptions::default())?;
            let update = Update::new().pull("own_channels", id).set("last_modified", now());
            for holder in holders {
                if let Some(user_id) = holder.get("_id") {
                    users.update_one(&Filter::by_id(user_id.clone()), &update)?;
                }
            }
            Ok(())
        })
    }
}

fn link_owners(tx: &dyn Tx, channel_id: &str, owners: &[String]) -> Result<()> {
    let users = tx.collection(USERS)?;
    let update = Update::new().add_to_set("own_channels", channel_id).set("last_modified", now());
    for owner in owners {
        let res = users.update_one(&Filter::by_id(owner.as_str()), &update)?;
        if res.matched == 0 {
            warn!("Channel {} lists unknown owner {}", channel_id, owner);
        }
    }
    Ok(())
}
