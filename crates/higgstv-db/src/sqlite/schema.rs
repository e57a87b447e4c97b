use rusqlite::Connection;
use tracing::info;

use crate::dsl::IndexInfo;
use crate::error::Result;

/// Create every table and index if missing. Safe to run on each open.
pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                   TEXT PRIMARY KEY,
            username             TEXT UNIQUE NOT NULL,
            email                TEXT UNIQUE NOT NULL,
            password             TEXT NOT NULL,
            access_key           TEXT,
            unclassified_channel TEXT,
            created              DATETIME NOT NULL,
            last_modified        DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_channels (
            user_id    TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            PRIMARY KEY (user_id, channel_id),
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS channels (
            id            TEXT PRIMARY KEY,
            type          TEXT NOT NULL,
            name          TEXT NOT NULL,
            \"desc\"        TEXT,
            contents_seq  TEXT,
            cover_default TEXT,
            created       DATETIME NOT NULL,
            last_modified DATETIME NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channel_tags (
            channel_id TEXT NOT NULL,
            tag        INTEGER NOT NULL,
            PRIMARY KEY (channel_id, tag),
            FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS channel_owners (
            channel_id TEXT NOT NULL,
            user_id    TEXT NOT NULL,
            PRIMARY KEY (channel_id, user_id),
            FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS channel_permissions (
            channel_id TEXT NOT NULL,
            user_id    TEXT NOT NULL,
            admin      INTEGER NOT NULL DEFAULT 0,
            read       INTEGER NOT NULL DEFAULT 0,
            write      INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (channel_id, user_id),
            FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS programs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id    TEXT NOT NULL,
            name          TEXT NOT NULL,
            \"desc\"        TEXT,
            duration      INTEGER,
            type          TEXT NOT NULL,
            youtube_id    TEXT,
            created       DATETIME NOT NULL,
            last_modified DATETIME NOT NULL,
            FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS program_tags (
            program_id INTEGER NOT NULL,
            tag        INTEGER NOT NULL,
            PRIMARY KEY (program_id, tag),
            FOREIGN KEY (program_id) REFERENCES programs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS channel_program_order (
            channel_id  TEXT NOT NULL,
            program_id  INTEGER NOT NULL,
            order_index INTEGER NOT NULL,
            PRIMARY KEY (channel_id, program_id),
            FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE,
            FOREIGN KEY (program_id) REFERENCES programs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS counters (
            id  TEXT PRIMARY KEY,
            seq INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS migrations (
            id          TEXT PRIMARY KEY,
            description TEXT,
            executed_at DATETIME NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);
        CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);
        CREATE INDEX IF NOT EXISTS idx_users_access_key ON users(access_key) WHERE access_key IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_channels_owners ON channel_owners(channel_id, user_id);
        CREATE INDEX IF NOT EXISTS idx_channels_last_modified ON channels(last_modified DESC);
        CREATE INDEX IF NOT EXISTS idx_channels_name ON channels(name);
        CREATE INDEX IF NOT EXISTS idx_programs_channel_id ON programs(channel_id);
        CREATE INDEX IF NOT EXISTS idx_program_tags_program_id ON program_tags(program_id);
        ",
    )?;

    info!("SQLite schema ready");
    Ok(())
}

/// Indexes SQLite reports for `table`, including the automatic ones behind
/// PRIMARY KEY and UNIQUE constraints.
pub fn list_indexes(conn: &Connection, table: &str) -> Result<Vec<IndexInfo>> {
    let mut stmt = conn.prepare(
        "SELECT il.name, il.\"unique\", il.partial, ii.name, ii.\"desc\"
         FROM pragma_index_list(?1) AS il
         JOIN pragma_index_xinfo(il.name) AS ii
         WHERE ii.key = 1
         ORDER BY il.name, ii.seqno",
    )?;

    let rows = stmt
        .query_map([table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out: Vec<IndexInfo> = Vec::new();
    for (name, unique, partial, column, descending) in rows {
        let key = (column.unwrap_or_default(), if descending { -1 } else { 1 });
        match out.last_mut() {
            Some(info) if info.name == name => info.keys.push(key),
            _ => out.push(IndexInfo {
                name,
                keys: vec![key],
                unique,
                sparse: partial,
            }),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();
        bootstrap(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 11);
    }

    #[test]
    fn test_list_indexes_reports_named_and_automatic() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();

        let users = list_indexes(&conn, "users").unwrap();
        let access = users.iter().find(|i| i.name == "idx_users_access_key").unwrap();
        assert!(access.sparse);
        assert_eq!(access.keys, vec![("access_key".to_string(), 1)]);
        assert!(users.iter().any(|i| i.unique && i.keys[0].0 == "username"));

        let channels = list_indexes(&conn, "channels").unwrap();
        let recent = channels.iter().find(|i| i.name == "idx_channels_last_modified").unwrap();
        assert_eq!(recent.keys, vec![("last_modified".to_string(), -1)]);
    }
}
