//! Ordered schema steps. The applied version lives in `sync_state` under
//! `schema_version`; each step commits together with its version bump.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::info;

use crate::db::schema;

const SCHEMA_VERSION_KEY: &str = "schema_version";

struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "messages table",
        apply: schema::create_messages_table,
    },
    Migration {
        version: 2,
        name: "message indexes",
        apply: schema::create_message_indexes,
    },
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )
    .context("create sync_state table")?;

    let current = schema_version(conn)?;
    if current > latest_version() {
        bail!(
            "database schema version {current} is newer than this build understands ({})",
            latest_version()
        );
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn
            .unchecked_transaction()
            .context("begin migration transaction")?;
        (migration.apply)(&tx)
            .with_context(|| format!("apply migration v{} ({})", migration.version, migration.name))?;
        record_version(&tx, migration.version)?;
        tx.commit()
            .with_context(|| format!("commit migration v{}", migration.version))?;
        info!(version = migration.version, name = migration.name, "applied schema migration");
    }

    Ok(())
}

pub(crate) fn schema_version(conn: &Connection) -> Result<u32> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read schema version")?;

    stored.map_or(Ok(0), |raw| {
        raw.parse()
            .with_context(|| format!("schema version {raw:?} is not a number"))
    })
}

fn record_version(tx: &Transaction<'_>, version: u32) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO sync_state (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
        "#,
        params![SCHEMA_VERSION_KEY, version.to_string()],
    )
    .with_context(|| format!("record schema version {version}"))?;
    Ok(())
}
