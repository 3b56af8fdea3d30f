// Conflict detection
//
// A candidate conflicts iff the entry was edited on BOTH replicas after the
// checkpoint. One-sided edits are not conflicts: the modified side wins
// (subject to the importer's strictly-newer re-check). Candidates without a
// local counterpart can never conflict.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::MergeError;

/// One side of a conflicting entry, as it stood at detection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSide {
    pub gloss: String,
    pub modified_at: String,
    pub modified_by: String,
}

/// An entry edited on both replicas since the last merge. `ours` is the
/// version that is kept; `external` the one that is suppressed and reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub number: String,
    pub ours: ConflictSide,
    pub external: ConflictSide,
}

/// Partition the materialized candidate set: rows returned here are the
/// conflict set, everything else in `import_candidates` stays importable.
/// Reads only the snapshot temp table, never `ext_db` again.
pub fn detect(conn: &Connection, last_merge: &str) -> Result<Vec<Conflict>, MergeError> {
    let mut stmt = conn.prepare(
        "SELECT c.number,
                our.gloss, our.modified_at, our.modified_by,
                c.gloss, c.modified_at, c.modified_by
         FROM import_candidates AS c
         JOIN main.signs AS our USING (number)
         WHERE our.modified_at > ?1 AND c.modified_at > ?1
         ORDER BY c.number",
    )?;

    let conflicts = stmt
        .query_map([last_merge], |row| {
            Ok(Conflict {
                number: row.get(0)?,
                ours: ConflictSide {
                    gloss: row.get(1)?,
                    modified_at: row.get(2)?,
                    modified_by: row.get(3)?,
                },
                external: ConflictSide {
                    gloss: row.get(4)?,
                    modified_at: row.get(5)?,
                    modified_by: row.get(6)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(conflicts)
}
