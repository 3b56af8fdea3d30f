use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::checkpoint;
use crate::error::MergeError;

// ============================================================================
// ENTRY / FLAG / ATTACHMENT MODELS
// ============================================================================

/// One lexicon entry (sign record).
///
/// `number` is the natural key shared by every replica; `modified_at` is a
/// `YYYY-MM-DD HH:MM:SS` UTC string and the only signal the merge engine
/// uses for conflict and freshness decisions. It must only move forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sign {
    pub number: String,
    pub gloss: String,
    pub notation: String,
    pub modified_at: String,
    pub modified_by: String,
}

/// A categorical flag. The id is replica-local; identity across replicas is
/// the (icon, name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub id: i64,
    pub icon: String,
    pub name: String,
}

/// Free-text attachment owned by exactly one sign. `kind` currently only
/// takes the value "definition".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub sign: String,
    pub kind: String,
    pub content: String,
}

// ============================================================================
// STORE SETUP
// ============================================================================

/// Open a local store with referential integrity active.
pub fn open_store(path: &Path) -> Result<Connection, MergeError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Create the signario schema if absent and seed the merge checkpoint.
pub fn setup_database(conn: &Connection) -> Result<(), MergeError> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS signs (
            number      TEXT PRIMARY KEY,
            gloss       TEXT NOT NULL DEFAULT '',
            notation    TEXT NOT NULL DEFAULT '',
            modified_at TEXT NOT NULL,
            modified_by TEXT NOT NULL DEFAULT 'anon'
        );

        CREATE TABLE IF NOT EXISTS flags (
            id   INTEGER PRIMARY KEY AUTOINCREMENT,
            icon TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE (icon, name)
        );

        CREATE TABLE IF NOT EXISTS sign_flags (
            sign TEXT NOT NULL REFERENCES signs(number) ON DELETE CASCADE,
            flag INTEGER NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
            PRIMARY KEY (sign, flag)
        );

        CREATE TABLE IF NOT EXISTS attachments (
            id      INTEGER PRIMARY KEY,
            sign    TEXT NOT NULL REFERENCES signs(number) ON DELETE CASCADE,
            kind    TEXT NOT NULL DEFAULT 'definition',
            content TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_signs_modified_at ON signs(modified_at);
        CREATE INDEX IF NOT EXISTS idx_attachments_sign ON attachments(sign);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)",
        params![checkpoint::LAST_MERGE_KEY, checkpoint::EPOCH],
    )?;

    Ok(())
}

// ============================================================================
// ENTRY ACCESS
// ============================================================================

/// Insert or replace a full entry row. The caller owns the timestamp; this
/// is also what the editor back-end calls on every debounced save.
pub fn upsert_sign(conn: &Connection, sign: &Sign) -> Result<(), MergeError> {
    conn.execute(
        "INSERT INTO signs (number, gloss, notation, modified_at, modified_by)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(number) DO UPDATE SET
             gloss = excluded.gloss,
             notation = excluded.notation,
             modified_at = excluded.modified_at,
             modified_by = excluded.modified_by",
        params![
            sign.number,
            sign.gloss,
            sign.notation,
            sign.modified_at,
            sign.modified_by,
        ],
    )?;
    Ok(())
}

pub fn get_sign(conn: &Connection, number: &str) -> Result<Option<Sign>, MergeError> {
    let sign = conn
        .query_row(
            "SELECT number, gloss, notation, modified_at, modified_by
             FROM signs WHERE number = ?1",
            [number],
            |row| {
                Ok(Sign {
                    number: row.get(0)?,
                    gloss: row.get(1)?,
                    notation: row.get(2)?,
                    modified_at: row.get(3)?,
                    modified_by: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(sign)
}

pub fn sign_count(conn: &Connection) -> Result<i64, MergeError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM signs", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// FLAGS
// ============================================================================

/// Ensure a flag with this (icon, name) identity exists and assign it to the
/// sign. Returns the local flag id.
pub fn set_flag(
    conn: &Connection,
    number: &str,
    icon: &str,
    name: &str,
) -> Result<i64, MergeError> {
    conn.execute(
        "INSERT OR IGNORE INTO flags (icon, name) VALUES (?1, ?2)",
        params![icon, name],
    )?;
    let flag_id: i64 = conn.query_row(
        "SELECT id FROM flags WHERE icon = ?1 AND name = ?2",
        params![icon, name],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO sign_flags (sign, flag) VALUES (?1, ?2)",
        params![number, flag_id],
    )?;
    Ok(flag_id)
}

pub fn flags_for_sign(conn: &Connection, number: &str) -> Result<Vec<Flag>, MergeError> {
    let mut stmt = conn.prepare(
        "SELECT f.id, f.icon, f.name
         FROM flags f JOIN sign_flags sf ON sf.flag = f.id
         WHERE sf.sign = ?1
         ORDER BY f.icon, f.name",
    )?;
    let flags = stmt
        .query_map([number], |row| {
            Ok(Flag {
                id: row.get(0)?,
                icon: row.get(1)?,
                name: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(flags)
}

pub fn flag_count(conn: &Connection) -> Result<i64, MergeError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM flags", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// ATTACHMENTS
// ============================================================================

pub fn add_attachment(
    conn: &Connection,
    number: &str,
    kind: &str,
    content: &str,
) -> Result<i64, MergeError> {
    conn.execute(
        "INSERT INTO attachments (sign, kind, content) VALUES (?1, ?2, ?3)",
        params![number, kind, content],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn attachments_for_sign(
    conn: &Connection,
    number: &str,
) -> Result<Vec<Attachment>, MergeError> {
    let mut stmt = conn.prepare(
        "SELECT id, sign, kind, content FROM attachments
         WHERE sign = ?1 ORDER BY id",
    )?;
    let attachments = stmt
        .query_map([number], |row| {
            Ok(Attachment {
                id: row.get(0)?,
                sign: row.get(1)?,
                kind: row.get(2)?,
                content: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(attachments)
}
