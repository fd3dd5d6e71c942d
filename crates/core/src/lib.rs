//! # glassdb-core
//!
//! Revision and changeset layer of a copy-on-write, multi-table search index.
//!
//! Each commit flushes every table, records where each table's new root lives
//! in a checksummed version blob, and publishes that blob atomically. A commit
//! can also emit a changeset, which lets a replica catch up one revision at a
//! time without copying the database. Per-document termlists are stored
//! front-coded and read back with [`termlist::TermListDecoder`].
//!
//! The crate is synchronous; all I/O happens on the calling thread except the
//! table flushes of a commit, which run on the rayon pool.

/// On-disk constants, per-database settings and commit flags.
pub mod config;
/// Error taxonomy: corrupt data, protocol violations, I/O failures.
pub mod error;
/// Variable-length integer and string codec used by every record.
pub mod pack;
/// Tables, version files, changesets and the database that drives them.
pub mod storage;
/// Front-coded per-document termlists and their decoder.
pub mod termlist;

pub use error::{GlassError, Result};

/// Revision number of a database. Increases by one per commit.
pub type Revision = u64;
/// Document id. Never reused within a database.
pub type DocId = u32;
/// Count of term occurrences (wdf, document length).
pub type TermCount = u32;
/// Count of documents.
pub type DocCount = u32;
/// Sum of document lengths across a database.
pub type TotalLength = u64;
/// Block number inside a table file.
pub type BlockNumber = u32;
/// Number of entries in a table.
pub type TableSize = u64;
