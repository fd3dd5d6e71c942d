//! Storage layer: revisions, changesets, and the tables they describe.
//!
//! A [`GlassDatabase`] owns one [`Table`] per [`TableKind`], a [`VersionFile`]
//! recording which root of each table is current, and a [`ChangesetWriter`]
//! recording what every commit changed. Version blobs carry a CRC32 footer
//! and are published atomically (temp file + rename, or a pointer slot in
//! single-file mode).

/// Changeset files: writer, reader, and offline validation.
pub mod changes;
/// Commit and replay driver over tables, version file and changesets.
pub mod database;
/// Per-table root descriptor.
pub mod root_info;
/// Aggregate document statistics.
pub mod stats;
/// Table capability trait and the in-memory reference table.
pub mod table;
/// Version file: commit protocol in directory and single-file layouts.
pub mod version;

pub use changes::{
    changeset_path, check_changeset, list_changesets, Changeset, ChangesetHeader,
    ChangesetReader, ChangesetWriter,
};
pub use database::{GlassDatabase, SnapshotHandle};
pub use root_info::RootInfo;
pub use stats::DatabaseStats;
pub use table::{MemoryTable, Table, TableChange, TableKind, TABLE_COUNT};
pub use version::{PendingVersion, VersionFile, VersionLocation, VersionSnapshot, VersionState};

use crate::config::SyncMode;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Flush `file` as hard as `mode` asks.
pub(crate) fn sync_file(file: &File, mode: SyncMode) -> io::Result<()> {
    match mode {
        SyncMode::Normal => file.sync_data(),
        SyncMode::Full => file.sync_all(),
        SyncMode::None => Ok(()),
    }
}

#[cfg(test)]
thread_local! {
    static FAIL_DIR_SYNC: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Make every [`sync_dir`] on this thread fail until switched off.
#[cfg(test)]
pub(crate) fn fail_dir_sync(fail: bool) {
    FAIL_DIR_SYNC.with(|flag| flag.set(fail));
}

/// Persist a rename inside `dir`.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(test)]
    {
        if FAIL_DIR_SYNC.with(|flag| flag.get()) {
            return Err(io::Error::other(format!("directory sync of {:?} failed", dir)));
        }
    }
    sync_dir_handle(dir)
}

#[cfg(unix)]
fn sync_dir_handle(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir_handle(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Read-write options for files holding database state (owner-only on unix).
pub(crate) fn open_options_rw() -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts
}
