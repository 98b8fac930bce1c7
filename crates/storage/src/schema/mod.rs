#![forbid(unsafe_code)]

mod sql;

use crate::StoreError;
use rusqlite::{Connection, OptionalExtension, params};

pub(crate) const SCHEMA_VERSION: i64 = 1;

pub(crate) fn migrate_sqlite_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(&sql::full_schema_sql())?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key=?1",
            params!["schema_version"],
            |row| row.get(0),
        )
        .optional()?;
    match stored.as_deref().map(str::parse::<i64>) {
        None => {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES (?1, ?2)",
                params!["schema_version", SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(Ok(version)) if version <= SCHEMA_VERSION => {}
        Some(_) => return Err(StoreError::InvalidInput("store was written by a newer schema")),
    }
    Ok(())
}
