// Merge checkpoint - "timestamp of last successful merge"
//
// A single row in the local store's config table. Read once when a merge
// session starts, written once at the end of the import pass inside the same
// transaction, so a crashed merge never advances it.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::MergeError;

pub const LAST_MERGE_KEY: &str = "last_merge";

/// Seed value for freshly initialized stores: everything ever edited counts
/// as "since last sync" until the first merge completes.
pub const EPOCH: &str = "1970-01-01 00:00:00";

/// Timestamp format shared by `signs.modified_at` and the checkpoint. The
/// lexicographic order of these strings is their chronological order, which
/// is what lets the merge SQL compare them directly.
pub const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_stamp() -> String {
    Utc::now().format(STAMP_FORMAT).to_string()
}

pub fn last_merge(conn: &Connection) -> Result<String, MergeError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            [LAST_MERGE_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or_else(|| EPOCH.to_string()))
}

pub fn advance(conn: &Connection, stamp: &str) -> Result<(), MergeError> {
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![LAST_MERGE_KEY, stamp],
    )?;
    Ok(())
}
