use anyhow::{bail, Context, Result};
use rusqlite::{Connection, Transaction};

/// Schema scripts in version order; entry `i` migrates to version `i + 1`.
const MIGRATIONS: &[(&str, &str)] = &[
    ("schema_v1.sql", include_str!("schemas/schema_v1.sql")),
    ("schema_v2.sql", include_str!("schemas/schema_v2.sql")),
];

const CURRENT_SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// Brings the schema up to date in one transaction, tracking progress in
/// `user_version`.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database schema v{version} is newer than this build supports (v{CURRENT_SCHEMA_VERSION})"
        );
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;

    let pending = usize::try_from(version.max(0)).unwrap_or(0);
    for (name, sql) in &MIGRATIONS[pending..] {
        apply_script(&tx, name, sql)?;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    Ok(())
}

fn apply_script(tx: &Transaction<'_>, name: &str, sql: &str) -> Result<()> {
    tx.execute_batch(sql)
        .with_context(|| format!("failed to execute {name}"))
}
