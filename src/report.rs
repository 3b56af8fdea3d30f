// Conflict report - the operator-facing account of suppressed entries
//
// Plain UTF-8 text at a fixed path beside the local store file. Overwritten
// on every merge that finds conflicts; a clean merge leaves it alone so a
// stale report never looks current by accident of timing.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::conflict::Conflict;

pub const REPORT_FILE_NAME: &str = "merge_conflicts.txt";

/// The report lives next to the store file, outside the database itself.
pub fn report_path(local_db: &Path) -> PathBuf {
    local_db
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(REPORT_FILE_NAME)
}

pub fn render(conflicts: &[Conflict]) -> String {
    let mut out = String::from(
        "MERGE CONFLICTS\n\n\
         The local version was kept for the following entries:\n\n",
    );
    for c in conflicts {
        let _ = writeln!(
            out,
            "Sign {}: \"{}\" (local: {} by {}) vs \"{}\" (external: {} by {})",
            c.number,
            c.ours.gloss,
            c.ours.modified_at,
            c.ours.modified_by,
            c.external.gloss,
            c.external.modified_at,
            c.external.modified_by,
        );
    }
    out
}

pub fn write_report(path: &Path, conflicts: &[Conflict]) -> io::Result<()> {
    fs::write(path, render(conflicts))
}
