// Signario Sync - replica merge engine for the signario lexicon
// Exposes the store API and the merge pipeline for the editor shell and CLI

pub mod checkpoint;
pub mod conflict;
pub mod db;
pub mod error;
pub mod merge;
pub mod report;
pub mod session;

// Re-export commonly used types
pub use conflict::{Conflict, ConflictSide};
pub use db::{
    add_attachment, attachments_for_sign, flags_for_sign, get_sign, open_store, set_flag,
    setup_database, sign_count, upsert_sign, Attachment, Flag, Sign,
};
pub use error::MergeError;
pub use merge::{merge, partial_merge, Categories, EntryFilter, MergeOptions, MergeOutcome};
pub use session::MergeSession;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
