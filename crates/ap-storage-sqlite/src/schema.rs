//! Schema bootstrap: table creation, pragma tuning, and the `Reset`/`Clean`
//! primitives the `Repository` lifecycle surface (§6) builds on.

use crate::error::Result;
use rusqlite::Connection;

/// The nine tables named in §4.2/§4.9.
pub const TABLES: &[&str] = &[
    "actors",
    "activities",
    "objects",
    "collections",
    "clients",
    "authorize",
    "access",
    "refresh",
];

/// Apply the pragma tuning §4.2 calls for: WAL journaling, an in-memory
/// temp store, a ~64MiB page cache, a 5s busy timeout, strict typing where
/// supported, and disabled auto-checkpointing (the engine is a single
/// embedded process, not a long-running WAL-heavy server).
pub fn apply_pragmas(db: &Connection) -> Result<()> {
    db.pragma_update(None, "journal_mode", "WAL")?;
    db.pragma_update(None, "temp_store", "MEMORY")?;
    db.pragma_update(None, "cache_size", -64 * 1024)?;
    db.busy_timeout(std::time::Duration::from_millis(5000))?;
    db.pragma_update(None, "wal_autocheckpoint", 0)?;
    Ok(())
}

/// Create the nine tables (idempotent via `CREATE TABLE IF NOT EXISTS`) and
/// apply pragma tuning.
pub fn create_schema(db: &Connection) -> Result<()> {
    apply_pragmas(db)?;
    db.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}

/// `Reset()`: `DELETE FROM` every table, keeping the schema intact.
pub fn reset(db: &Connection) -> Result<()> {
    for table in TABLES {
        db.execute(&format!("DELETE FROM {table}"), [])?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_schema_is_idempotent() {
        let db = Connection::open_in_memory().unwrap();
        create_schema(&db).unwrap();
        create_schema(&db).unwrap();
    }

    #[test]
    fn reset_keeps_schema_but_empties_tables() {
        let db = Connection::open_in_memory().unwrap();
        create_schema(&db).unwrap();
        db.execute(
            "INSERT INTO actors (raw) VALUES ('{\"id\":\"https://e.com/a\",\"type\":\"Person\"}')",
            [],
        )
        .unwrap();
        reset(&db).unwrap();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM actors", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
