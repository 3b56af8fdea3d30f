// Merge error taxonomy
//
// ReplicaUnreadable and ConstraintViolation are the two outcomes the operator
// can act on; everything else passes through. Conflicts are NOT errors - they
// are a reported result with a defined resolution (local wins).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    /// The external replica file is missing, unreadable, or does not carry
    /// the expected signario schema. Raised before any local mutation.
    #[error("external replica unreadable: {0}")]
    ReplicaUnreadable(String),

    /// Referential integrity failed while applying the importable set, e.g.
    /// an attachment referencing an entry the category mask excluded. The
    /// whole merge transaction rolls back.
    #[error("referential integrity violated during import: {0}")]
    ConstraintViolation(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Surface sqlite constraint failures under their own variant so the caller
/// can tell a broken import apart from a broken database.
pub fn classify_sqlite(err: rusqlite::Error) -> MergeError {
    match err {
        rusqlite::Error::SqliteFailure(code, ref msg)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            MergeError::ConstraintViolation(
                msg.clone().unwrap_or_else(|| code.to_string()),
            )
        }
        other => MergeError::Sqlite(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_constraint_failures() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE a (id INTEGER PRIMARY KEY);
             CREATE TABLE b (a_id INTEGER NOT NULL REFERENCES a(id));",
        )
        .unwrap();

        let err = conn
            .execute("INSERT INTO b (a_id) VALUES (99)", [])
            .unwrap_err();

        assert!(matches!(
            classify_sqlite(err),
            MergeError::ConstraintViolation(_)
        ));
    }

    #[test]
    fn classify_passes_other_errors_through() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn.execute("SELECT * FROM missing", []).unwrap_err();
        assert!(matches!(classify_sqlite(err), MergeError::Sqlite(_)));
    }
}
