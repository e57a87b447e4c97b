//! Copies a document store into the relational store, one entity kind at a
//! time. Re-running against the same destination is safe: rows already
//! present are counted as skipped.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use higgstv_db::repository::ProgramRepository;
use higgstv_db::{
    Collection, CollectionExt, CollectionSource, Document, Filter, FindOptions, SequenceService, SqliteStore, Store,
    StoreStats, Update, with_transaction,
};
use higgstv_types::PROGRAM_ID_COUNTER;
use higgstv_types::collections::{CHANNELS, COUNTERS, MIGRATIONS, PROGRAMS, USERS};
use higgstv_types::ident;
use higgstv_types::models::{
    Channel, ChannelCover, ChannelPermission, ChannelType, MigrationRecord, Program, ProgramType, User,
};

use crate::coerce;
use crate::error::{MigrateError, Result};
use crate::report::{MigrationReport, UnmappedReference, Verification};

pub struct MigrationEngine<'a> {
    source: &'a dyn Store,
    dest: &'a SqliteStore,
    /// Source user id (normalized) to destination user id.
    identities: HashMap<String, String>,
    report: MigrationReport,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(source: &'a dyn Store, dest: &'a SqliteStore) -> Self {
        Self {
            source,
            dest,
            identities: HashMap::new(),
            report: MigrationReport::default(),
        }
    }

    /// Run every stage. Only an unreachable store or a failed read of a
    /// whole collection aborts; row-level problems end up in the report.
    pub fn run(mut self) -> Result<MigrationReport> {
        self.connect()?;

        let dest = self.dest;
        {
            let _fk = dest.suspend_foreign_keys()?;
            info!("Foreign keys suspended for the load");
            self.migrate_users()?;
            self.migrate_channels()?;
            self.migrate_programs()?;
            self.migrate_counters()?;
            self.migrate_migration_records()?;
        }

        self.report.verification = Some(self.verify()?);
        Ok(self.report)
    }

    fn connect(&self) -> Result<()> {
        self.source
            .ping()
            .map_err(|e| MigrateError::connection("source", e.to_string()))?;
        self.dest
            .ping()
            .map_err(|e| MigrateError::connection("destination", e.to_string()))?;
        info!("Connected to {} source and relational destination", self.source.kind().as_str());
        Ok(())
    }

    // -- Users --

    fn migrate_users(&mut self) -> Result<()> {
        let dest = self.dest;
        let docs = all(self.source, USERS)?;
        info!("Migrating {} users", docs.len());
        self.report.users.total = docs.len();

        let users = dest.collection(USERS)?;
        for doc in &docs {
            let source_id = doc.get("_id").map(ident::normalize_id).unwrap_or_default();
            let user = user_from_source(doc, &source_id);

            match users.insert_as(&user) {
                Ok(()) => {
                    debug!("Migrated user {} ({})", user.username, user.id);
                    self.report.users.migrated += 1;
                    self.remember(&source_id, &user.id);
                }
                Err(e) if e.is_duplicate_key() => match existing_user(users.as_ref(), &user)? {
                    Some(existing) => {
                        warn!("User {} already present as {}, skipping", user.username, existing);
                        self.report.users.skipped += 1;
                        self.remember(&source_id, &existing);
                    }
                    None => {
                        error!("User {} collides with an unreadable row: {}", user.username, e);
                        self.report.users.failed += 1;
                        self.report.error(format!("user {}: {}", user.username, e));
                    }
                },
                Err(e) => {
                    error!("User {} failed: {}", user.username, e);
                    self.report.users.failed += 1;
                    self.report.error(format!("user {}: {}", user.username, e));
                }
            }
        }

        let s = self.report.users;
        info!("Users: {}/{} migrated, {} skipped, {} failed", s.migrated, s.total, s.skipped, s.failed);
        Ok(())
    }

    fn remember(&mut self, source_id: &str, dest_id: &str) {
        if !source_id.is_empty() {
            self.identities.insert(source_id.to_string(), dest_id.to_string());
        }
    }

    /// Destination id for a user referenced by a channel. Unmapped ids are
    /// kept in normalized form and reported.
    fn map_user(&mut self, channel_id: &str, raw: &Value, role: &'static str) -> Option<String> {
        let id = ident::normalize_id(raw);
        if id.is_empty() {
            return None;
        }
        if let Some(mapped) = self.identities.get(&id) {
            return Some(mapped.clone());
        }
        warn!("Channel {} has {} {} with no migrated user", channel_id, role, id);
        self.report.unmapped_references.push(UnmappedReference {
            channel_id: channel_id.to_string(),
            user_id: id.clone(),
            role,
        });
        Some(id)
    }

    // -- Channels --

    fn migrate_channels(&mut self) -> Result<()> {
        let dest = self.dest;
        let docs = all(self.source, CHANNELS)?;
        info!("Migrating {} channels", docs.len());
        self.report.channels.total = docs.len();
        let existing = dest.collection(CHANNELS)?;

        for doc in &docs {
            let channel = self.channel_from_source(doc);
            if existing.count_documents(&Filter::by_id(channel.id.as_str()))? > 0 {
                warn!("Channel {} already present, skipping", channel.id);
                self.report.channels.skipped += 1;
                continue;
            }

            let res = with_transaction(dest, |tx| {
                tx.collection(CHANNELS)?.insert_as(&channel)?;
                let users = tx.collection(USERS)?;
                let update = Update::new().add_to_set("own_channels", channel.id.as_str());
                for owner in &channel.owners {
                    users.update_one(&Filter::by_id(owner.as_str()), &update)?;
                }
                Ok(())
            });

            match res {
                Ok(()) => {
                    debug!("Migrated channel {} ({})", channel.name, channel.id);
                    self.report.channels.migrated += 1;
                }
                Err(e) => {
                    error!("Channel {} failed: {}", channel.id, e);
                    self.report.channels.failed += 1;
                    self.report.error(format!("channel {}: {}", channel.id, e));
                }
            }
        }

        let s = self.report.channels;
        info!("Channels: {}/{} migrated, {} skipped, {} failed", s.migrated, s.total, s.skipped, s.failed);
        Ok(())
    }

    /// The channel without its programs or custom order; those follow once
    /// every channel exists.
    fn channel_from_source(&mut self, doc: &Document) -> Channel {
        let id = match doc.get("_id").map(ident::normalize_id) {
            Some(id) if !id.is_empty() => id,
            _ => ident::new_id(),
        };

        let owners = array(doc, "owners")
            .iter()
            .filter_map(|raw| self.map_user(&id, raw, "owner"))
            .collect();
        let mut permission: Vec<ChannelPermission> = Vec::new();
        for entry in array(doc, "permission") {
            let Some(user_id) = entry.get("user_id").and_then(|raw| self.map_user(&id, raw, "permission")) else {
                continue;
            };
            let record = ChannelPermission {
                user_id,
                admin: coerce::flag(entry.get("admin")),
                read: coerce::flag(entry.get("read")),
                write: coerce::flag(entry.get("write")),
            };
            // Two source entries can name one user, e.g. after identity mapping
            match permission.iter_mut().find(|p| p.user_id == record.user_id) {
                Some(held) => {
                    warn!("Channel {} lists user {} twice in permission, merging flags", id, record.user_id);
                    held.admin |= record.admin;
                    held.read |= record.read;
                    held.write |= record.write;
                }
                None => permission.push(record),
            }
        }

        let kind = match doc.get("type").and_then(Value::as_str) {
            Some("unclassified") => ChannelType::Unclassified,
            _ => ChannelType::Default,
        };
        let cover = doc
            .get("cover")
            .and_then(|c| c.get("default"))
            .and_then(Value::as_str)
            .map(|d| ChannelCover {
                default: Some(d.to_string()),
            });

        Channel {
            id,
            kind,
            name: coerce::text(doc.get("name")),
            desc: coerce::text(doc.get("desc")),
            tags: coerce::integer_list(doc.get("tags").unwrap_or(&Value::Null)),
            cover,
            contents_seq: coerce::contents_seq(doc.get("contents_seq")),
            contents: Vec::new(),
            contents_order: Vec::new(),
            owners,
            permission,
            created: coerce::timestamp(doc.get("created")).unwrap_or_else(Utc::now),
            last_modified: coerce::timestamp(doc.get("last_modified")).unwrap_or_else(Utc::now),
        }
    }

    // -- Programs --

    fn migrate_programs(&mut self) -> Result<()> {
        let dest = self.dest;
        let docs = all(self.source, CHANNELS)?;

        let highest = docs
            .iter()
            .flat_map(|doc| array(doc, "contents"))
            .filter_map(|p| p.get("_id").and_then(coerce::integer))
            .max()
            .unwrap_or(0);
        if highest > 0 {
            let seq = SequenceService::ensure_at_least(dest, PROGRAM_ID_COUNTER, highest)?;
            info!("Program id counter at {} (highest source id {})", seq, highest);
        }

        let channels = dest.collection(CHANNELS)?;
        let programs = dest.collection(PROGRAMS)?;
        let repo = ProgramRepository::new(dest);

        for doc in &docs {
            let items = array(doc, "contents");
            let order = coerce::integer_list(doc.get("contents_order").unwrap_or(&Value::Null));
            if items.is_empty() && order.is_empty() {
                continue;
            }
            let channel_id = doc.get("_id").map(ident::normalize_id).unwrap_or_default();
            self.report.programs.total += items.len();

            if channels.find_optional(&Filter::by_id(channel_id.as_str()))?.is_none() {
                warn!("Channel {} is not in the destination, skipping its {} programs", channel_id, items.len());
                self.report.programs.skipped += items.len();
                self.report.error(format!(
                    "channel {} missing in destination: {} programs and the custom order skipped",
                    channel_id,
                    items.len()
                ));
                continue;
            }

            for item in items {
                self.migrate_program(&repo, programs.as_ref(), &channel_id, item);
            }

            // after the programs, so every ordered id has a row
            if !order.is_empty() {
                let update = Update::new().set("contents_order", order);
                if let Err(e) = channels.update_one(&Filter::by_id(channel_id.as_str()), &update) {
                    error!("Order of channel {} failed: {}", channel_id, e);
                    self.report.error(format!("order of channel {}: {}", channel_id, e));
                }
            }
        }

        let s = self.report.programs;
        info!("Programs: {}/{} migrated, {} skipped, {} failed", s.migrated, s.total, s.skipped, s.failed);
        Ok(())
    }

    fn migrate_program(
        &mut self,
        repo: &ProgramRepository<'_>,
        programs: &dyn Collection,
        channel_id: &str,
        item: &Value,
    ) {
        let Some(id) = item.get("_id").and_then(coerce::integer) else {
            self.report.programs.failed += 1;
            self.report.error(format!("program without a numeric id in channel {}", channel_id));
            return;
        };

        match programs.find_optional(&Filter::by_id(id)) {
            Ok(Some(existing)) => {
                let holder = existing.get("channel_id").and_then(Value::as_str).unwrap_or_default();
                if holder == channel_id {
                    debug!("Program {} already migrated", id);
                    self.report.programs.skipped += 1;
                } else {
                    warn!("Program {} of channel {} already belongs to channel {}", id, channel_id, holder);
                    self.report.programs.failed += 1;
                    self.report.error(format!(
                        "program {} (channel {}): id already used by channel {}",
                        id, channel_id, holder
                    ));
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                self.report.programs.failed += 1;
                self.report.error(format!("program {} (channel {}): {}", id, channel_id, e));
                return;
            }
        }

        match repo.migrate_program(channel_id, &program_from_source(item, id)) {
            Ok(()) => self.report.programs.migrated += 1,
            Err(e) => {
                error!("Program {} (channel {}) failed: {}", id, channel_id, e);
                self.report.programs.failed += 1;
                self.report.error(format!("program {} (channel {}): {}", id, channel_id, e));
            }
        }
    }

    // -- Counters and migration records --

    fn migrate_counters(&mut self) -> Result<()> {
        let dest = self.dest;
        let docs = all(self.source, COUNTERS)?;
        self.report.counters.total = docs.len();

        for doc in &docs {
            let name = match doc.get("_id") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => ident::normalize_id(other),
                None => String::new(),
            };
            if name.is_empty() {
                self.report.counters.failed += 1;
                self.report.error("counter without an id");
                continue;
            }
            let seq = doc.get("seq").and_then(coerce::integer).unwrap_or(0);

            let outcome = SequenceService::current(dest, &name)
                .and_then(|before| SequenceService::ensure_at_least(dest, &name, seq).map(|after| (before, after)));
            match outcome {
                Ok((before, after)) if before < seq => {
                    info!("Counter {} = {}", name, after);
                    self.report.counters.migrated += 1;
                }
                Ok((_, after)) => {
                    debug!("Counter {} already at {} (source {})", name, after, seq);
                    self.report.counters.skipped += 1;
                }
                Err(e) => {
                    self.report.counters.failed += 1;
                    self.report.error(format!("counter {}: {}", name, e));
                }
            }
        }
        Ok(())
    }

    fn migrate_migration_records(&mut self) -> Result<()> {
        let dest = self.dest;
        let docs = all(self.source, MIGRATIONS)?;
        self.report.migrations.total = docs.len();

        let records = dest.collection(MIGRATIONS)?;
        for doc in &docs {
            let record = MigrationRecord {
                id: doc.get("_id").map(ident::normalize_id).unwrap_or_default(),
                description: coerce::text(doc.get("description")),
                executed_at: coerce::timestamp(doc.get("executed_at")).unwrap_or_else(Utc::now),
            };
            match records.insert_as(&record) {
                Ok(()) => self.report.migrations.migrated += 1,
                Err(e) if e.is_duplicate_key() => self.report.migrations.skipped += 1,
                Err(e) => {
                    self.report.migrations.failed += 1;
                    self.report.error(format!("migration record {}: {}", record.id, e));
                }
            }
        }
        Ok(())
    }

    // -- Verification --

    fn verify(&self) -> Result<Verification> {
        let source = StoreStats::collect(self.source)?;
        let count = |name: &str| -> Result<i64> {
            Ok(self.dest.collection(name)?.count_documents(&Filter::new())?)
        };

        let mut v = Verification {
            source_users: source.count(USERS),
            dest_users: count(USERS)?,
            source_channels: source.count(CHANNELS),
            dest_channels: count(CHANNELS)?,
            source_programs: source.programs,
            dest_programs: count(PROGRAMS)?,
            mismatches: Vec::new(),
            foreign_key_violations: self.dest.foreign_key_violations()?,
        };
        for (label, src, dst) in [
            ("users", v.source_users, v.dest_users),
            ("channels", v.source_channels, v.dest_channels),
            ("programs", v.source_programs, v.dest_programs),
        ] {
            if src != dst {
                v.mismatches.push(format!("{}: {} source, {} destination", label, src, dst));
            }
        }

        if v.passed() {
            info!("Verification passed");
        } else {
            warn!(
                "Verification found {} count mismatches and {} foreign key violations",
                v.mismatches.len(),
                v.foreign_key_violations.len()
            );
        }
        Ok(v)
    }
}

fn all(store: &dyn Store, name: &str) -> Result<Vec<Document>> {
    Ok(store.collection(name)?.find(&Filter::new(), &FindOptions::default())?)
}

fn array<'d>(doc: &'d Document, key: &str) -> &'d [Value] {
    doc.get(key).and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

fn user_from_source(doc: &Document, source_id: &str) -> User {
    let id = if source_id.is_empty() {
        ident::new_id()
    } else {
        source_id.to_string()
    };
    User {
        id,
        username: coerce::text(doc.get("username")),
        email: coerce::text(doc.get("email")),
        password: coerce::text(doc.get("password")),
        own_channels: array(doc, "own_channels")
            .iter()
            .map(ident::normalize_id)
            .filter(|c| !c.is_empty())
            .collect(),
        unclassified_channel: doc
            .get("unclassified_channel")
            .map(ident::normalize_id)
            .filter(|c| !c.is_empty()),
        access_key: doc.get("access_key").and_then(Value::as_str).map(str::to_string),
        created: coerce::timestamp(doc.get("created")).unwrap_or_else(Utc::now),
        last_modified: coerce::timestamp(doc.get("last_modified")).unwrap_or_else(Utc::now),
    }
}

/// The destination user a duplicate collided with: same username, else
/// same email.
fn existing_user(users: &dyn Collection, user: &User) -> Result<Option<String>> {
    for filter in [
        Filter::new().eq("username", user.username.as_str()),
        Filter::new().eq("email", user.email.as_str()),
        Filter::by_id(user.id.as_str()),
    ] {
        if let Some(doc) = users.find_optional(&filter)? {
            return Ok(doc.get("_id").and_then(Value::as_str).map(str::to_string));
        }
    }
    Ok(None)
}

fn program_from_source(item: &Value, id: i64) -> Program {
    Program {
        id,
        name: coerce::text(item.get("name")),
        desc: coerce::text(item.get("desc")),
        duration: item.get("duration").map_or(0, coerce::duration),
        kind: ProgramType::Youtube,
        youtube_id: coerce::text(item.get("youtube_id")),
        tags: coerce::integer_list(item.get("tags").unwrap_or(&Value::Null)),
        created: coerce::timestamp(item.get("created")).unwrap_or_else(Utc::now),
        last_modified: coerce::timestamp(item.get("last_modified")).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_user_from_source_normalizes_references() {
        let source = doc(json!({
            "_id": {"$binary": {"base64": "EjRWeJq83vAP7cuph2VDIQ==", "subType": "04"}},
            "username": "alice",
            "email": "alice@example.com",
            "password": "hash",
            "own_channels": ["12345678-9abc-def0-0fed-cba987654321", null],
            "created": "2023-01-02T03:04:05Z",
        }));
        let id = ident::normalize_id(&source["_id"]);
        let user = user_from_source(&source, &id);
        assert_eq!(user.id, "123456789ABCDEF00FEDCBA987654321");
        assert_eq!(user.own_channels, vec!["123456789ABCDEF00FEDCBA987654321"]);
        assert_eq!(user.created.timestamp(), 1_672_628_645);
        assert_eq!(user.access_key, None);
    }

    #[test]
    fn test_program_from_source_coerces() {
        let item = json!({"_id": 7, "name": "clip", "duration": "90秒", "tags": ["1", "x", 2]});
        let program = program_from_source(&item, 7);
        assert_eq!(program.duration, 90);
        assert_eq!(program.tags, vec![1, 2]);
        assert_eq!(program.kind, ProgramType::Youtube);
    }

    #[test]
    fn test_unmapped_owner_is_kept_and_reported() {
        let source = higgstv_db::DocumentStore::temporary().unwrap();
        let dest = SqliteStore::open_in_memory().unwrap();
        let mut engine = MigrationEngine::new(&source, &dest);
        engine.identities.insert("AA".into(), "BB".into());

        let channel = engine.channel_from_source(&doc(json!({
            "_id": "c-1",
            "name": "mixed",
            "owners": ["AA", "ZZ"],
            "permission": [{"user_id": "ZZ", "read": 1}],
            "contents_seq": 4,
        })));
        assert_eq!(channel.owners, vec!["BB", "ZZ"]);
        assert_eq!(channel.permission[0].user_id, "ZZ");
        assert!(channel.permission[0].read);
        assert_eq!(channel.contents_seq, "4");
        assert_eq!(engine.report.unmapped_references.len(), 2);
        assert_eq!(engine.report.unmapped_references[0].role, "owner");
    }

    #[test]
    fn test_duplicate_permission_users_merge() {
        let source = higgstv_db::DocumentStore::temporary().unwrap();
        let dest = SqliteStore::open_in_memory().unwrap();
        let mut engine = MigrationEngine::new(&source, &dest);
        engine.identities.insert("OLD".into(), "U1".into());

        let channel = engine.channel_from_source(&doc(json!({
            "_id": "c-1",
            "name": "shared",
            "permission": [
                {"user_id": "OLD", "read": true},
                {"user_id": "U1", "admin": 1},
                {"user_id": "U2", "write": true},
            ],
        })));
        assert_eq!(channel.permission.len(), 2);
        let merged = &channel.permission[0];
        assert_eq!(merged.user_id, "U1");
        assert!(merged.read && merged.admin && !merged.write);
        assert_eq!(channel.permission[1].user_id, "U2");
    }

    #[test]
    fn test_only_present_channels_count_as_skipped() {
        let source = higgstv_db::DocumentStore::temporary().unwrap();
        let channels = source.collection(CHANNELS).unwrap();
        channels
            .insert_one(doc(json!({"_id": "AA", "name": "kept", "created": "2021-01-01T00:00:00Z"})))
            .unwrap();
        channels
            .insert_one(doc(json!({"_id": "BB", "name": "orphan", "owners": ["NOBODY"]})))
            .unwrap();
        let dest = SqliteStore::open_in_memory().unwrap();

        let mut first = MigrationEngine::new(&source, &dest);
        first.migrate_channels().unwrap();
        assert_eq!(first.report.channels.migrated, 1);
        // foreign keys are on outside a full run, so the orphan fails
        assert_eq!(first.report.channels.failed, 1);

        let mut second = MigrationEngine::new(&source, &dest);
        second.migrate_channels().unwrap();
        assert_eq!(second.report.channels.skipped, 1);
        assert_eq!(second.report.channels.failed, 1);
        assert!(second.report.errors.iter().any(|e| e.starts_with("channel BB")));
    }

    #[test]
    fn test_programs_of_missing_channel_are_skipped() {
        let source = higgstv_db::DocumentStore::temporary().unwrap();
        let doc = doc(json!({
            "_id": "gone",
            "name": "gone",
            "contents": [{"_id": 4, "name": "a"}, {"_id": 6, "name": "b"}],
            "contents_order": [6, 4],
        }));
        source.collection(CHANNELS).unwrap().insert_one(doc).unwrap();
        let dest = SqliteStore::open_in_memory().unwrap();

        let mut engine = MigrationEngine::new(&source, &dest);
        engine.migrate_programs().unwrap();
        assert_eq!(engine.report.programs.total, 2);
        assert_eq!(engine.report.programs.skipped, 2);
        assert_eq!(engine.report.programs.migrated, 0);
        assert!(engine.report.errors[0].contains("channel gone missing"));
        // the counter still covers the skipped ids
        assert_eq!(SequenceService::current(&dest, PROGRAM_ID_COUNTER).unwrap(), 6);
    }
}
