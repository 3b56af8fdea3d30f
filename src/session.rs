// Replica access - the scoped resource a merge runs inside
//
// A session owns three things at once: the open local connection, an
// ephemeral working copy of the external replica file, and the `ext_db`
// attachment of that copy. Teardown of all three is unconditional: it lives
// in Drop, so success, error return, and panic all release the same way.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db;
use crate::error::MergeError;

/// Symbolic name the external replica is visible under inside merge SQL.
pub const EXT_SCHEMA: &str = "ext_db";

const REPLICA_TABLES: [&str; 4] = ["signs", "flags", "sign_flags", "attachments"];

#[derive(Debug)]
pub struct MergeSession {
    conn: Connection,
    work_copy: PathBuf,
}

impl MergeSession {
    /// Open the local store and attach a read-only working copy of the
    /// external replica under [`EXT_SCHEMA`]. Referential integrity is on
    /// for the whole session.
    pub fn open(local_db: &Path, external_file: &Path) -> Result<Self, MergeError> {
        let conn = db::open_store(local_db)?;
        db::setup_database(&conn)?;

        let work_copy = work_copy_path(local_db);
        fs::copy(external_file, &work_copy).map_err(|e| {
            MergeError::ReplicaUnreadable(format!(
                "cannot copy {}: {e}",
                external_file.display()
            ))
        })?;

        // From here on Drop owns the cleanup, error paths included.
        let session = MergeSession { conn, work_copy };
        session.attach()?;
        session.check_replica_schema()?;
        Ok(session)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn attach(&self) -> Result<(), MergeError> {
        self.conn
            .execute(
                &format!("ATTACH DATABASE ?1 AS {EXT_SCHEMA}"),
                [self.work_copy.to_string_lossy().into_owned()],
            )
            .map_err(|e| {
                MergeError::ReplicaUnreadable(format!("cannot attach working copy: {e}"))
            })?;
        Ok(())
    }

    /// The external file must already carry the signario schema; anything
    /// else (foreign database, corrupt file) aborts before any mutation.
    fn check_replica_schema(&self) -> Result<(), MergeError> {
        let found: i64 = self
            .conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {EXT_SCHEMA}.sqlite_master
                     WHERE type = 'table'
                       AND name IN ('signs', 'flags', 'sign_flags', 'attachments')"
                ),
                [],
                |row| row.get(0),
            )
            .map_err(|e| {
                MergeError::ReplicaUnreadable(format!("not a signario replica: {e}"))
            })?;

        if found != REPLICA_TABLES.len() as i64 {
            return Err(MergeError::ReplicaUnreadable(format!(
                "replica schema incomplete: {found}/{} expected tables",
                REPLICA_TABLES.len()
            )));
        }
        Ok(())
    }
}

impl Drop for MergeSession {
    fn drop(&mut self) {
        // DETACH fails when attach never happened; that path is fine.
        if let Err(e) = self.conn.execute(&format!("DETACH DATABASE {EXT_SCHEMA}"), []) {
            warn!(error = %e, "failed to detach external replica");
        }
        if let Err(e) = fs::remove_file(&self.work_copy) {
            warn!(
                path = %self.work_copy.display(),
                error = %e,
                "failed to remove working copy of external replica"
            );
        }
    }
}

/// `lexicon.db` merges through the sibling working copy `lexicon.db.ext`.
fn work_copy_path(local_db: &Path) -> PathBuf {
    let mut path = local_db.as_os_str().to_owned();
    path.push(".ext");
    PathBuf::from(path)
}
