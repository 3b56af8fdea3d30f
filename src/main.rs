use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::path::Path;

use signario_sync::{
    attachments_for_sign, flags_for_sign, get_sign, merge, open_store, partial_merge,
    setup_database, sign_count, MergeOptions,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).map(String::as_str);

    match cmd {
        Some("init") if args.len() == 3 => run_init(Path::new(&args[2])),
        Some("merge") if args.len() == 4 => {
            run_merge(Path::new(&args[2]), Path::new(&args[3]), None)
        }
        Some("partial-merge") if args.len() == 4 || args.len() == 5 => run_merge(
            Path::new(&args[2]),
            Path::new(&args[3]),
            Some(args.get(4).map(String::as_str).unwrap_or("{}")),
        ),
        Some("show") if args.len() == 4 => run_show(Path::new(&args[2]), &args[3]),
        Some("export") if args.len() == 4 => {
            run_export(Path::new(&args[2]), Path::new(&args[3]))
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("signario-sync v{}", signario_sync::VERSION);
    println!();
    println!("Usage:");
    println!("  signario-sync init <db>");
    println!("  signario-sync merge <db> <external-db>");
    println!("  signario-sync partial-merge <db> <external-db> [options-json]");
    println!("  signario-sync show <db> <number>");
    println!("  signario-sync export <db> <dest>");
    println!();
    println!("partial-merge options mirror the import dialog payload, e.g.:");
    println!(
        "  '{{\"data\":{{\"gloss\":true,\"flags\":false,\"attachments\":true}},\
         \"entries\":\"newer_in_external\"}}'"
    );
}

fn run_init(db_path: &Path) -> Result<()> {
    let conn = open_store(db_path)?;
    setup_database(&conn)?;
    println!("✓ Store ready at {}", db_path.display());
    Ok(())
}

/// `options` is None for a full merge, Some(json) for a partial one. The
/// JSON payload is exactly what the import dialog hands over.
fn run_merge(db_path: &Path, external: &Path, options: Option<&str>) -> Result<()> {
    let outcome = match options {
        None => merge(db_path, external)?,
        Some(json) => {
            let options: MergeOptions =
                serde_json::from_str(json).context("invalid merge options")?;
            partial_merge(db_path, external, &options)?
        }
    };

    println!("✓ Imported {} entries", outcome.imported);
    if outcome.conflicts > 0 {
        println!(
            "⚠ {} conflicts (local version kept). Full report: {}",
            outcome.conflicts,
            outcome.report_path.display()
        );
    } else {
        println!("✓ No conflicts");
    }
    Ok(())
}

fn run_show(db_path: &Path, number: &str) -> Result<()> {
    let conn = open_store(db_path)?;
    let Some(sign) = get_sign(&conn, number)? else {
        bail!("no entry {number} in {}", db_path.display());
    };
    let flags = flags_for_sign(&conn, number)?;
    let attachments = attachments_for_sign(&conn, number)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "sign": sign,
            "flags": flags,
            "attachments": attachments,
        }))?
    );
    Ok(())
}

/// Hand-off copy of the whole store; publishing it anywhere is the caller's
/// problem, not ours.
fn run_export(db_path: &Path, dest: &Path) -> Result<()> {
    let conn = open_store(db_path)?;
    let entries = sign_count(&conn)?;
    drop(conn);

    fs::copy(db_path, dest)
        .with_context(|| format!("cannot export {} to {}", db_path.display(), dest.display()))?;
    println!("✓ Exported {} entries to {}", entries, dest.display());
    Ok(())
}
