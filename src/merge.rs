// Merge pipeline - reconcile an external replica into the local store
//
// One shared algorithm drives both the full merge and the partial import:
// materialize candidates -> detect conflicts -> apply importable set ->
// advance checkpoint, all inside a single transaction so a mid-merge
// failure leaves the store exactly as it was. The conflict report is the
// only side effect outside that transaction.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::checkpoint;
use crate::conflict::{self, Conflict};
use crate::error::{classify_sqlite, MergeError};
use crate::report;
use crate::session::MergeSession;

// ============================================================================
// OPTIONS
// ============================================================================

/// Which external entries become candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryFilter {
    /// Every entry in the external replica.
    #[default]
    All,
    /// Entries the external side modified since the last merge.
    NewerInExternal,
    /// Entries whose number does not exist locally.
    NotInOurs,
}

/// Data categories a partial merge may apply independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Categories {
    /// Gloss + notation + bookkeeping columns of the entry row itself.
    pub gloss: bool,
    pub flags: bool,
    pub attachments: bool,
}

impl Default for Categories {
    fn default() -> Self {
        Categories {
            gloss: true,
            flags: true,
            attachments: true,
        }
    }
}

/// Mirrors the option payload of the partial-import dialog, so a caller can
/// deserialize it straight from JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MergeOptions {
    #[serde(default)]
    pub data: Categories,
    #[serde(default)]
    pub entries: EntryFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Entries suppressed because both sides edited them since the checkpoint.
    pub conflicts: usize,
    /// Entries of the importable set that were applied.
    pub imported: usize,
    /// Where the conflict report lives (written only when conflicts > 0).
    pub report_path: PathBuf,
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Full merge: every external entry, every data category.
pub fn merge(local_db: &Path, external_file: &Path) -> Result<MergeOutcome, MergeError> {
    partial_merge(local_db, external_file, &MergeOptions::default())
}

/// Scoped merge. Shares the whole pipeline with [`merge`]; only the
/// candidate policy and the category mask differ.
pub fn partial_merge(
    local_db: &Path,
    external_file: &Path,
    options: &MergeOptions,
) -> Result<MergeOutcome, MergeError> {
    let session = MergeSession::open(local_db, external_file)?;
    let (conflicts, imported) = run_pipeline(session.conn(), options)?;
    drop(session);

    let report_path = report::report_path(local_db);
    if !conflicts.is_empty() {
        // Report writing is best-effort: the merge itself already committed.
        if let Err(e) = report::write_report(&report_path, &conflicts) {
            warn!(path = %report_path.display(), error = %e, "could not write conflict report");
        }
    }

    info!(
        conflicts = conflicts.len(),
        imported,
        entries = ?options.entries,
        "merge finished"
    );

    Ok(MergeOutcome {
        conflicts: conflicts.len(),
        imported,
        report_path,
    })
}

// ============================================================================
// PIPELINE
// ============================================================================

fn run_pipeline(
    conn: &Connection,
    options: &MergeOptions,
) -> Result<(Vec<Conflict>, usize), MergeError> {
    let last_merge = checkpoint::last_merge(conn)?;

    let tx = conn.unchecked_transaction()?;

    materialize_candidates(&tx, options.entries, &last_merge)?;
    let conflicts = conflict::detect(&tx, &last_merge)?;
    let imported = apply_import(&tx, &last_merge, options.data)?;

    // A no-op merge still advances the checkpoint: re-merging the same
    // unchanged file must report nothing the second time.
    checkpoint::advance(&tx, &checkpoint::now_stamp())?;
    tx.commit()?;

    Ok((conflicts, imported))
}

/// Materialize the candidate set once; detector and importer both read this
/// snapshot instead of re-querying `ext_db`.
fn materialize_candidates(
    conn: &Connection,
    filter: EntryFilter,
    last_merge: &str,
) -> Result<(), MergeError> {
    match filter {
        EntryFilter::All => {
            conn.execute(
                "CREATE TEMP TABLE import_candidates AS SELECT * FROM ext_db.signs",
                [],
            )?;
        }
        EntryFilter::NewerInExternal => {
            conn.execute(
                "CREATE TEMP TABLE import_candidates AS
                 SELECT * FROM ext_db.signs WHERE modified_at > ?1",
                [last_merge],
            )?;
        }
        EntryFilter::NotInOurs => {
            conn.execute(
                "CREATE TEMP TABLE import_candidates AS
                 SELECT ext.* FROM ext_db.signs AS ext
                 WHERE NOT EXISTS (SELECT 1 FROM main.signs WHERE number = ext.number)",
                [],
            )?;
        }
    }
    Ok(())
}

/// Build the importable set and apply the requested categories.
///
/// An entry is applied only when it is not a conflict AND the external
/// version is strictly newer than ours (or there is no local version). This
/// re-check makes the import last-writer-wins even under `EntryFilter::All`.
fn apply_import(
    conn: &Connection,
    last_merge: &str,
    categories: Categories,
) -> Result<usize, MergeError> {
    conn.execute(
        "CREATE TEMP TABLE to_import AS
         SELECT c.* FROM import_candidates AS c
         LEFT JOIN main.signs AS our USING (number)
         WHERE (our.number IS NULL OR c.modified_at > our.modified_at)
           AND NOT (our.number IS NOT NULL
                    AND our.modified_at > ?1 AND c.modified_at > ?1)",
        [last_merge],
    )?;

    let imported: i64 =
        conn.query_row("SELECT COUNT(*) FROM to_import", [], |row| row.get(0))?;
    if imported == 0 {
        return Ok(0);
    }

    if categories.gloss {
        import_gloss(conn)?;
    }
    if categories.flags {
        import_flags(conn)?;
    }
    if categories.attachments {
        import_attachments(conn)?;
    }

    Ok(imported as usize)
}

fn import_gloss(conn: &Connection) -> Result<(), MergeError> {
    // Upsert, not INSERT OR REPLACE: REPLACE deletes the old row first and
    // would cascade away flag assignments and attachments of categories the
    // caller asked us to leave alone.
    conn.execute(
        "INSERT INTO main.signs (number, gloss, notation, modified_at, modified_by)
         SELECT number, gloss, notation, modified_at, modified_by FROM to_import
         WHERE true
         ON CONFLICT(number) DO UPDATE SET
             gloss = excluded.gloss,
             notation = excluded.notation,
             modified_at = excluded.modified_at,
             modified_by = excluded.modified_by",
        [],
    )
    .map_err(classify_sqlite)?;
    Ok(())
}

/// Whole-set replacement of flag assignments, translated into local id
/// space. Flag ids never cross replicas: equivalence is (icon, name).
fn import_flags(conn: &Connection) -> Result<(), MergeError> {
    // Create local definitions for external flags an imported entry uses
    // and no local flag matches.
    conn.execute(
        "INSERT INTO main.flags (icon, name)
         SELECT DISTINCT ef.icon, ef.name
         FROM ext_db.flags AS ef
         LEFT JOIN main.flags AS mf ON mf.icon = ef.icon AND mf.name = ef.name
         WHERE mf.id IS NULL
           AND EXISTS (SELECT 1 FROM ext_db.sign_flags AS sf
                       JOIN to_import AS t ON t.number = sf.sign
                       WHERE sf.flag = ef.id)",
        [],
    )
    .map_err(classify_sqlite)?;

    // Explicit equivalence map, built before any assignment write.
    conn.execute(
        "CREATE TEMP TABLE import_flag_map AS
         SELECT ef.id AS ext_flag, mf.id AS our_flag
         FROM ext_db.flags AS ef
         JOIN main.flags AS mf ON mf.icon = ef.icon AND mf.name = ef.name",
        [],
    )?;

    conn.execute(
        "DELETE FROM main.sign_flags WHERE sign IN (SELECT number FROM to_import)",
        [],
    )
    .map_err(classify_sqlite)?;

    conn.execute(
        "INSERT OR IGNORE INTO main.sign_flags (sign, flag)
         SELECT esf.sign, m.our_flag
         FROM ext_db.sign_flags AS esf
         JOIN import_flag_map AS m ON m.ext_flag = esf.flag
         JOIN to_import AS t ON t.number = esf.sign",
        [],
    )
    .map_err(classify_sqlite)?;

    Ok(())
}

/// Replace-or-insert by the attachment's own id; rows removed on the
/// external side are left alone locally (the merge augments, never prunes).
fn import_attachments(conn: &Connection) -> Result<(), MergeError> {
    conn.execute(
        "INSERT OR REPLACE INTO main.attachments (id, sign, kind, content)
         SELECT ea.id, ea.sign, ea.kind, ea.content
         FROM ext_db.attachments AS ea
         JOIN to_import AS t ON t.number = ea.sign",
        [],
    )
    .map_err(classify_sqlite)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        add_attachment, attachments_for_sign, flag_count, flags_for_sign, get_sign, open_store,
        set_flag, setup_database, sign_count, upsert_sign, Sign,
    };
    use std::fs;
    use tempfile::{tempdir, TempDir};

    const T0: &str = "2024-01-10 00:00:00";
    const T1: &str = "2024-01-11 09:00:00";
    const T2: &str = "2024-01-12 10:30:00";
    const OLD: &str = "2024-01-05 08:00:00";

    fn sign(number: &str, gloss: &str, modified_at: &str, by: &str) -> Sign {
        Sign {
            number: number.to_string(),
            gloss: gloss.to_string(),
            notation: format!("notation-{gloss}"),
            modified_at: modified_at.to_string(),
            modified_by: by.to_string(),
        }
    }

    /// Two initialized replica files, local checkpoint already at T0.
    fn two_stores() -> (TempDir, PathBuf, PathBuf) {
        let dir = tempdir().unwrap();
        let local = dir.path().join("local.db");
        let external = dir.path().join("external.db");
        for path in [&local, &external] {
            let conn = open_store(path).unwrap();
            setup_database(&conn).unwrap();
        }
        let conn = open_store(&local).unwrap();
        checkpoint::advance(&conn, T0).unwrap();
        (dir, local, external)
    }

    fn with_store<T>(path: &Path, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = open_store(path).unwrap();
        f(&conn)
    }

    #[test]
    fn newer_external_entry_is_imported() {
        let (_dir, local, external) = two_stores();
        with_store(&local, |c| upsert_sign(c, &sign("00001", "HOUSE", OLD, "ana")).unwrap());
        with_store(&external, |c| {
            upsert_sign(c, &sign("00001", "CASA", T1, "luis")).unwrap()
        });

        let outcome = merge(&local, &external).unwrap();
        assert_eq!(outcome.conflicts, 0);
        assert_eq!(outcome.imported, 1);

        let merged = with_store(&local, |c| get_sign(c, "00001").unwrap()).unwrap();
        assert_eq!(merged, sign("00001", "CASA", T1, "luis"));
        assert!(!outcome.report_path.exists());
    }

    #[test]
    fn both_sides_edited_keeps_local_and_reports_once() {
        let (_dir, local, external) = two_stores();
        let ours = sign("00001", "HOUSE", T1, "ana");
        with_store(&local, |c| upsert_sign(c, &ours).unwrap());
        with_store(&external, |c| {
            upsert_sign(c, &sign("00001", "CASA", T2, "luis")).unwrap()
        });

        let outcome = merge(&local, &external).unwrap();
        assert_eq!(outcome.conflicts, 1);
        assert_eq!(outcome.imported, 0);

        // local wins
        assert_eq!(with_store(&local, |c| get_sign(c, "00001").unwrap()), Some(ours));

        let text = fs::read_to_string(&outcome.report_path).unwrap();
        assert_eq!(text.matches("Sign 00001").count(), 1);
        assert!(text.contains("\"HOUSE\""));
        assert!(text.contains("\"CASA\""));
        assert!(text.contains("luis"));
    }

    #[test]
    fn entry_absent_locally_is_imported_never_conflicting() {
        for entries in [EntryFilter::All, EntryFilter::NotInOurs] {
            let (_dir, local, external) = two_stores();
            with_store(&external, |c| {
                upsert_sign(c, &sign("00009", "NUEVO", T1, "luis")).unwrap()
            });

            let options = MergeOptions {
                entries,
                ..Default::default()
            };
            let outcome = partial_merge(&local, &external, &options).unwrap();
            assert_eq!(outcome.conflicts, 0, "{entries:?}");
            assert_eq!(outcome.imported, 1, "{entries:?}");
            assert!(with_store(&local, |c| get_sign(c, "00009").unwrap()).is_some());
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let (_dir, local, external) = two_stores();
        with_store(&external, |c| {
            let s = sign("00001", "CASA", T1, "luis");
            upsert_sign(c, &s).unwrap();
            set_flag(c, "00001", "📌", "revisar").unwrap();
            add_attachment(c, "00001", "definition", "vivienda").unwrap();
        });

        let first = merge(&local, &external).unwrap();
        assert_eq!((first.conflicts, first.imported), (0, 1));

        let second = merge(&local, &external).unwrap();
        assert_eq!((second.conflicts, second.imported), (0, 0));
        assert_eq!(with_store(&local, |c| sign_count(c).unwrap()), 1);
    }

    #[test]
    fn noop_merge_still_advances_checkpoint() {
        let (_dir, local, external) = two_stores();

        merge(&local, &external).unwrap();
        let after_first = with_store(&local, |c| checkpoint::last_merge(c).unwrap());
        assert!(after_first.as_str() > T0);
    }

    #[test]
    fn stale_external_version_is_not_imported() {
        let (_dir, local, external) = two_stores();
        let ours = sign("00001", "HOUSE", T1, "ana");
        with_store(&local, |c| upsert_sign(c, &ours).unwrap());
        // external copy predates the checkpoint: no conflict, no import
        with_store(&external, |c| {
            upsert_sign(c, &sign("00001", "CASA", OLD, "luis")).unwrap()
        });

        let outcome = merge(&local, &external).unwrap();
        assert_eq!((outcome.conflicts, outcome.imported), (0, 0));
        assert_eq!(with_store(&local, |c| get_sign(c, "00001").unwrap()), Some(ours));
    }

    #[test]
    fn selector_not_in_ours_skips_existing_numbers() {
        let (_dir, local, external) = two_stores();
        with_store(&local, |c| upsert_sign(c, &sign("00001", "HOUSE", T1, "ana")).unwrap());
        with_store(&external, |c| {
            // would be both a conflict and an import under All
            upsert_sign(c, &sign("00001", "CASA", T2, "luis")).unwrap();
            upsert_sign(c, &sign("00002", "PERRO", T1, "luis")).unwrap();
        });

        let outcome = partial_merge(
            &local,
            &external,
            &MergeOptions {
                entries: EntryFilter::NotInOurs,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!((outcome.conflicts, outcome.imported), (0, 1));
        assert_eq!(
            with_store(&local, |c| get_sign(c, "00001").unwrap()).unwrap().gloss,
            "HOUSE"
        );
        assert!(with_store(&local, |c| get_sign(c, "00002").unwrap()).is_some());
    }

    #[test]
    fn selector_newer_in_external_ignores_entries_at_or_before_checkpoint() {
        let (_dir, local, external) = two_stores();
        with_store(&external, |c| {
            upsert_sign(c, &sign("00001", "VIEJO", OLD, "luis")).unwrap();
            upsert_sign(c, &sign("00002", "LIMITE", T0, "luis")).unwrap();
            upsert_sign(c, &sign("00003", "NUEVO", T1, "luis")).unwrap();
        });

        let outcome = partial_merge(
            &local,
            &external,
            &MergeOptions {
                entries: EntryFilter::NewerInExternal,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!((outcome.conflicts, outcome.imported), (0, 1));
        assert!(with_store(&local, |c| get_sign(c, "00001").unwrap()).is_none());
        assert!(with_store(&local, |c| get_sign(c, "00002").unwrap()).is_none());
        assert!(with_store(&local, |c| get_sign(c, "00003").unwrap()).is_some());
    }

    #[test]
    fn disabled_category_leaves_local_data_untouched() {
        let (_dir, local, external) = two_stores();
        with_store(&local, |c| {
            upsert_sign(c, &sign("00001", "HOUSE", OLD, "ana")).unwrap();
            set_flag(c, "00001", "🏠", "local-only").unwrap();
            add_attachment(c, "00001", "definition", "our definition").unwrap();
        });
        with_store(&external, |c| {
            upsert_sign(c, &sign("00001", "CASA", T1, "luis")).unwrap();
            set_flag(c, "00001", "📌", "external").unwrap();
            add_attachment(c, "00001", "definition", "their definition").unwrap();
        });

        let outcome = partial_merge(
            &local,
            &external,
            &MergeOptions {
                data: Categories {
                    gloss: true,
                    flags: false,
                    attachments: false,
                },
                entries: EntryFilter::All,
            },
        )
        .unwrap();
        assert_eq!((outcome.conflicts, outcome.imported), (0, 1));

        with_store(&local, |c| {
            assert_eq!(get_sign(c, "00001").unwrap().unwrap().gloss, "CASA");
            let flags = flags_for_sign(c, "00001").unwrap();
            assert_eq!(flags.len(), 1);
            assert_eq!(flags[0].name, "local-only");
            let attachments = attachments_for_sign(c, "00001").unwrap();
            assert_eq!(attachments.len(), 1);
            assert_eq!(attachments[0].content, "our definition");
        });
    }

    #[test]
    fn flag_identity_maps_to_local_ids() {
        let (_dir, local, external) = two_stores();
        with_store(&local, |c| {
            // pad local flag ids so they differ from the external ones
            upsert_sign(c, &sign("00000", "PAD", OLD, "ana")).unwrap();
            set_flag(c, "00000", "🔔", "padding-a").unwrap();
            set_flag(c, "00000", "🔕", "padding-b").unwrap();
            set_flag(c, "00000", "📌", "revisar").unwrap();
        });
        with_store(&external, |c| {
            upsert_sign(c, &sign("00001", "CASA", T1, "luis")).unwrap();
            let ext_id = set_flag(c, "00001", "📌", "revisar").unwrap();
            assert_eq!(ext_id, 1);
        });

        let outcome = merge(&local, &external).unwrap();
        assert_eq!(outcome.imported, 1);

        with_store(&local, |c| {
            // no duplicate definition was created for the shared identity
            assert_eq!(flag_count(c).unwrap(), 3);
            let flags = flags_for_sign(c, "00001").unwrap();
            assert_eq!(flags.len(), 1);
            assert_eq!((flags[0].icon.as_str(), flags[0].name.as_str()), ("📌", "revisar"));
            assert_eq!(flags[0].id, 3, "must be the local id, not the external 1");
        });
    }

    #[test]
    fn imported_flag_set_mirrors_external_exactly() {
        let (_dir, local, external) = two_stores();
        with_store(&local, |c| {
            upsert_sign(c, &sign("00001", "HOUSE", OLD, "ana")).unwrap();
            set_flag(c, "00001", "🏠", "old-flag").unwrap();
        });
        with_store(&external, |c| {
            upsert_sign(c, &sign("00001", "CASA", T1, "luis")).unwrap();
            set_flag(c, "00001", "📌", "new-flag").unwrap();
        });

        merge(&local, &external).unwrap();

        with_store(&local, |c| {
            let flags = flags_for_sign(c, "00001").unwrap();
            // whole-set replacement: old assignment gone, external set mirrored
            assert_eq!(flags.len(), 1);
            assert_eq!(flags[0].name, "new-flag");
        });
    }

    #[test]
    fn attachments_are_augmented_not_pruned() {
        let (_dir, local, external) = two_stores();
        with_store(&local, |c| {
            upsert_sign(c, &sign("00001", "HOUSE", OLD, "ana")).unwrap();
            add_attachment(c, "00001", "definition", "shares id with external").unwrap();
            add_attachment(c, "00001", "definition", "only exists locally").unwrap();
        });
        with_store(&external, |c| {
            upsert_sign(c, &sign("00001", "CASA", T1, "luis")).unwrap();
            // same id as the first local row, so it replaces that one only
            add_attachment(c, "00001", "definition", "external text").unwrap();
        });

        merge(&local, &external).unwrap();

        with_store(&local, |c| {
            let attachments = attachments_for_sign(c, "00001").unwrap();
            assert_eq!(attachments.len(), 2);
            assert_eq!(attachments[0].content, "external text");
            // the row the external side does not have is left untouched
            assert_eq!(attachments[1].content, "only exists locally");
        });
    }

    #[test]
    fn category_mask_excluding_entries_rolls_back_whole_merge() {
        let (_dir, local, external) = two_stores();
        with_store(&external, |c| {
            upsert_sign(c, &sign("00009", "NUEVO", T1, "luis")).unwrap();
            add_attachment(c, "00009", "definition", "orphan-to-be").unwrap();
        });

        // importing attachments for an entry the mask refuses to create
        // violates the FK and must abort atomically
        let err = partial_merge(
            &local,
            &external,
            &MergeOptions {
                data: Categories {
                    gloss: false,
                    flags: false,
                    attachments: true,
                },
                entries: EntryFilter::All,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::ConstraintViolation(_)));

        with_store(&local, |c| {
            assert_eq!(sign_count(c).unwrap(), 0);
            // rollback covers the checkpoint too
            assert_eq!(checkpoint::last_merge(c).unwrap(), T0);
        });
    }

    #[test]
    fn working_copy_is_gone_after_success_and_failure() {
        let (dir, local, external) = two_stores();

        merge(&local, &external).unwrap();
        assert!(!dir.path().join("local.db.ext").exists());

        let garbage = dir.path().join("garbage.db");
        fs::write(&garbage, "not a database").unwrap();
        assert!(merge(&local, &garbage).is_err());
        assert!(!dir.path().join("local.db.ext").exists());
    }

    #[test]
    fn options_deserialize_from_dialog_payload() {
        let options: MergeOptions = serde_json::from_str(
            r#"{ "data": { "gloss": true, "flags": false, "attachments": true },
                 "entries": "newer_in_external" }"#,
        )
        .unwrap();
        assert!(options.data.gloss);
        assert!(!options.data.flags);
        assert_eq!(options.entries, EntryFilter::NewerInExternal);

        let defaults: MergeOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, MergeOptions::default());
    }
}
