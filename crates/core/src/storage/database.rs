//! Commit and replay driver.
//!
//! [`GlassDatabase`] ties a set of tables to their [`VersionFile`] and
//! [`ChangesetWriter`]. A commit flushes every table (in parallel), stages the
//! resulting roots, records the changeset, and publishes the new version.
//! Readers hold a [`SnapshotHandle`] and only ever see published revisions.

use crate::config::{CommitFlags, DatabaseConfig, SINGLE_FILE_NAME};
use crate::error::{GlassError, Result};
use crate::storage::changes::{ChangesetReader, ChangesetWriter};
use crate::storage::root_info::RootInfo;
use crate::storage::stats::DatabaseStats;
use crate::storage::table::{MemoryTable, Table, TableKind, TABLE_COUNT};
use crate::storage::version::{VersionFile, VersionLocation, VersionSnapshot, VersionState};
use crate::termlist::{
    encode_termlist, termlist_key, PostingSource, TermListDecoder, TermListTable,
};
use crate::{DocCount, DocId, Revision, TermCount};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cloneable reader view of the latest published revision.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    current: Arc<RwLock<Arc<VersionSnapshot>>>,
}

impl SnapshotHandle {
    fn new(snapshot: VersionSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// The latest published revision. Stays valid after later commits.
    pub fn current(&self) -> Arc<VersionSnapshot> {
        self.current.read().clone()
    }

    pub fn revision(&self) -> Revision {
        self.current.read().revision
    }

    fn publish(&self, snapshot: VersionSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}

/// A database directory: tables, version file and changesets.
pub struct GlassDatabase<T: Table = MemoryTable> {
    dir: PathBuf,
    version: VersionFile,
    changes: ChangesetWriter,
    tables: [T; TABLE_COUNT],
    snapshot: SnapshotHandle,
}

fn check_table_order<T: Table>(tables: &[T; TABLE_COUNT]) -> Result<()> {
    for (table, kind) in tables.iter().zip(TableKind::ALL) {
        if table.kind() != kind {
            return Err(GlassError::Consistency(format!(
                "{} table supplied in the {} slot",
                table.kind(),
                kind
            )));
        }
    }
    Ok(())
}

impl<T: Table> GlassDatabase<T> {
    /// Create a new database in `dir` at revision 0.
    pub fn create_with(
        dir: impl Into<PathBuf>,
        config: &DatabaseConfig,
        tables: [T; TABLE_COUNT],
    ) -> Result<Self> {
        config.validate()?;
        check_table_order(&tables)?;
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let location = if config.single_file {
            VersionLocation::single_file(dir.join(SINGLE_FILE_NAME), 0)
        } else {
            VersionLocation::directory(&dir)
        };
        let version = VersionFile::create(location, config)?;
        let changes = ChangesetWriter::new(&dir, config.max_changesets)?;
        Ok(Self::assemble(dir, version, changes, tables))
    }

    /// Open the latest revision of the database in `dir`. The layout is
    /// detected; only `max_changesets` is taken from `config`.
    pub fn open_with(
        dir: impl Into<PathBuf>,
        config: &DatabaseConfig,
        tables: [T; TABLE_COUNT],
    ) -> Result<Self> {
        check_table_order(&tables)?;
        let dir = dir.into();
        let version = VersionFile::read(VersionLocation::detect(&dir)?)?;
        let changes = ChangesetWriter::new(&dir, config.max_changesets)?;
        Ok(Self::assemble(dir, version, changes, tables))
    }

    fn assemble(
        dir: PathBuf,
        version: VersionFile,
        changes: ChangesetWriter,
        tables: [T; TABLE_COUNT],
    ) -> Self {
        let snapshot = SnapshotHandle::new(version.snapshot());
        Self {
            dir,
            version,
            changes,
            tables,
            snapshot,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn revision(&self) -> Revision {
        self.version.revision()
    }

    pub fn version(&self) -> &VersionFile {
        &self.version
    }

    /// Direct access to the version file, for stats updates.
    pub fn version_mut(&mut self) -> &mut VersionFile {
        &mut self.version
    }

    pub fn stats(&self) -> &DatabaseStats {
        self.version.stats()
    }

    pub fn changes(&self) -> &ChangesetWriter {
        &self.changes
    }

    pub fn table(&self, kind: TableKind) -> &T {
        &self.tables[kind.index()]
    }

    pub fn table_mut(&mut self, kind: TableKind) -> &mut T {
        &mut self.tables[kind.index()]
    }

    /// A handle readers can keep across commits.
    pub fn reader(&self) -> SnapshotHandle {
        self.snapshot.clone()
    }

    /// Commit all pending table and stats changes as the next revision.
    ///
    /// On failure the whole transaction is rolled back and durable state is
    /// left as it was. A changeset which cannot be finalised after the
    /// revision is published is only logged, since the revision itself is
    /// already durable.
    pub fn commit(&mut self, flags: CommitFlags) -> Result<Revision> {
        let old_rev = self.version.revision();
        let new_rev = old_rev
            .checked_add(1)
            .ok_or_else(|| GlassError::Consistency("revision counter exhausted".into()))?;

        // Every flush finishes before anything is written.
        let version = &self.version;
        let flushed: Vec<Result<RootInfo>> = self.tables[..]
            .par_iter_mut()
            .map(|table| table.flush(version.root(table.kind())))
            .collect();
        let roots = match flushed.into_iter().collect::<Result<Vec<_>>>() {
            Ok(roots) => roots,
            Err(e) => {
                self.cancel();
                return Err(e);
            }
        };

        match self.write_revision(old_rev, new_rev, roots, flags) {
            Ok(true) => {}
            Ok(false) => {
                self.cancel();
                return Err(GlassError::Io(io::Error::other(format!(
                    "failed to publish revision {}",
                    new_rev
                ))));
            }
            Err(e) => {
                self.cancel();
                return Err(e);
            }
        }

        if let Err(e) = self.changes.commit(new_rev, flags) {
            tracing::warn!(
                "Revision {} is durable but its changeset was not kept: {}",
                new_rev,
                e
            );
        }
        self.snapshot.publish(self.version.snapshot());
        tracing::info!(
            "Committed revision {} ({} documents)",
            new_rev,
            self.version.stats().doc_count
        );
        Ok(new_rev)
    }

    fn write_revision(
        &mut self,
        old_rev: Revision,
        new_rev: Revision,
        roots: Vec<RootInfo>,
        flags: CommitFlags,
    ) -> Result<bool> {
        for (kind, root) in TableKind::ALL.into_iter().zip(roots) {
            *self.version.root_to_set(kind)? = root;
        }

        self.changes.start(old_rev, new_rev, flags)?;
        if self.changes.is_active() {
            for table in &self.tables {
                let kind = table.kind();
                let block = table.diff(self.version.root(kind), self.version.staged_root(kind))?;
                self.changes.write_block(&block)?;
            }
        }

        let pending = self.version.write(new_rev)?;
        self.changes.write_block(pending.blob())?;
        self.version.sync(pending, new_rev, flags)
    }

    /// Abandon everything since the last commit: buffered table writes,
    /// staged roots and stats, and any pending version or changeset.
    pub fn cancel(&mut self) {
        self.changes.abort();
        self.version.cancel();
        for table in self.tables.iter_mut() {
            table.cancel(self.version.root(table.kind()));
        }
    }

    /// Bring this replica forward by one revision using a changeset file.
    ///
    /// The changeset must start at this database's revision, belong to this
    /// database, and not come from a dangerous commit. Framing, checksums and
    /// every table block are verified before any table changes, and the
    /// tables are rolled back if installing the new version fails.
    pub fn apply_changeset(&mut self, path: &Path, flags: CommitFlags) -> Result<Revision> {
        if self.version.state() != VersionState::Clean {
            return Err(GlassError::Consistency(
                "cannot apply a changeset over uncommitted changes".into(),
            ));
        }
        let changeset = ChangesetReader::open(path)?.read_changeset()?;
        let header = changeset.header;
        if header.old_revision != self.version.revision() {
            return Err(GlassError::Consistency(format!(
                "changeset {:?} starts at revision {}, database is at {}",
                path,
                header.old_revision,
                self.version.revision()
            )));
        }
        if header.dangerous {
            return Err(GlassError::Consistency(format!(
                "changeset {:?} came from a dangerous commit and cannot be applied live",
                path
            )));
        }
        let target = VersionSnapshot::decode(&changeset.version_blob)?;
        if target.revision != header.new_revision {
            return Err(GlassError::format(
                "changeset",
                format!(
                    "version block is revision {}, header says {}",
                    target.revision, header.new_revision
                ),
            ));
        }
        if target.uuid != *self.version.uuid() {
            return Err(GlassError::Consistency(format!(
                "changeset belongs to database {}, not {}",
                target.uuid,
                self.version.uuid()
            )));
        }

        for (table, block) in self.tables.iter().zip(&changeset.table_blocks) {
            table.check_changes(block)?;
        }
        let replayed = self.replay_tables(
            &changeset.table_blocks,
            &target,
            &changeset.version_blob,
            flags,
        );
        if let Err(e) = replayed {
            for table in self.tables.iter_mut() {
                table.cancel(self.version.root(table.kind()));
            }
            tracing::warn!("Rolled back tables after failed replay of {:?}: {}", path, e);
            return Err(e);
        }

        let durable = VersionFile::read(self.version.location().clone())?.snapshot();
        if durable != target {
            return Err(GlassError::format(
                "version file",
                format!("re-read of revision {} does not match", target.revision),
            ));
        }
        self.snapshot.publish(durable);
        tracing::info!("Replayed changeset {:?} to revision {}", path, target.revision);
        Ok(target.revision)
    }

    /// Apply every table block, then install the version they lead to.
    fn replay_tables(
        &mut self,
        blocks: &[Vec<u8>],
        target: &VersionSnapshot,
        version_blob: &[u8],
        flags: CommitFlags,
    ) -> Result<()> {
        for (table, block) in self.tables.iter_mut().zip(blocks) {
            let kind = table.kind();
            table.apply_changes(block, target.root(kind))?;
        }
        self.version.install(version_blob, flags)
    }
}

/// Postlist entries map each term to the number of documents indexing it.
fn adjust_term_frequency(postlist: &mut MemoryTable, term: &[u8], delta: i64) -> Result<()> {
    let current = i64::from(postlist.term_frequency(term)?);
    let updated = current + delta;
    match DocCount::try_from(updated) {
        Ok(0) => postlist.delete(term.to_vec()),
        Ok(freq) => postlist.put(term.to_vec(), freq.to_be_bytes().to_vec()),
        Err(_) => {
            return Err(GlassError::Consistency(format!(
                "term frequency of {:?} would become {}",
                String::from_utf8_lossy(term),
                updated
            )))
        }
    }
    Ok(())
}

impl GlassDatabase<MemoryTable> {
    /// Create a database backed by in-memory tables.
    pub fn create(dir: impl Into<PathBuf>, config: &DatabaseConfig) -> Result<Self> {
        Self::create_with(dir, config, TableKind::ALL.map(MemoryTable::new))
    }

    /// Open a database with empty in-memory tables. Table contents are not
    /// persisted by [`MemoryTable`]; replaying changesets refills them.
    pub fn open(dir: impl Into<PathBuf>, config: &DatabaseConfig) -> Result<Self> {
        Self::open_with(dir, config, TableKind::ALL.map(MemoryTable::new))
    }

    /// Index a document from its `(term, wdf)` pairs, in any order.
    ///
    /// Writes the termlist, bumps postlist term frequencies and updates the
    /// statistics. Nothing is durable until [`commit`](Self::commit).
    pub fn add_document<S: AsRef<[u8]>>(&mut self, terms: &[(S, TermCount)]) -> Result<DocId> {
        let mut entries: Vec<(&[u8], TermCount)> =
            terms.iter().map(|(t, wdf)| (t.as_ref(), *wdf)).collect();
        entries.sort_unstable();
        let doc_length = entries
            .iter()
            .try_fold(0 as TermCount, |total, (_, wdf)| total.checked_add(*wdf))
            .ok_or_else(|| GlassError::Consistency("document length overflow".into()))?;
        let encoded = encode_termlist(doc_length, &entries)?;

        let did = self.version.next_docid()?;
        self.version.add_document(doc_length)?;
        for (term, wdf) in &entries {
            self.version.check_wdf(*wdf)?;
            adjust_term_frequency(self.table_mut(TableKind::Postlist), term, 1)?;
        }
        self.table_mut(TableKind::Termlist).set_termlist(did, encoded);
        Ok(did)
    }

    /// Remove a document, undoing what [`add_document`](Self::add_document) did.
    pub fn delete_document(&mut self, did: DocId) -> Result<()> {
        let (doc_length, terms) = {
            let mut termlist = self.termlist(did, true)?;
            let mut terms = Vec::with_capacity(termlist.unique_terms() as usize);
            termlist.next()?;
            while let Some(term) = termlist.term() {
                terms.push(term.to_vec());
                termlist.next()?;
            }
            (termlist.doc_length(), terms)
        };

        self.version.delete_document(doc_length)?;
        for term in &terms {
            adjust_term_frequency(self.table_mut(TableKind::Postlist), term, -1)?;
        }
        self.table_mut(TableKind::Termlist)
            .delete(termlist_key(did).to_vec());
        Ok(())
    }

    /// Decoder over the termlist of `did`, including uncommitted changes.
    pub fn termlist(
        &self,
        did: DocId,
        throw_if_not_present: bool,
    ) -> Result<TermListDecoder<'_, MemoryTable>> {
        TermListDecoder::open(
            self.table(TableKind::Termlist),
            self.table(TableKind::Postlist),
            did,
            throw_if_not_present,
        )
    }

    /// Whether `did` currently has a termlist.
    pub fn has_document(&self, did: DocId) -> Result<bool> {
        Ok(self.table(TableKind::Termlist).termlist(did)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VERSION_FILE_NAME, VERSION_TMP_FILE_NAME};
    use crate::storage::{changeset_path, fail_dir_sync};
    use tempfile::TempDir;

    fn replica_of(primary: &Path, replica: &Path) -> GlassDatabase {
        fs::copy(
            primary.join(VERSION_FILE_NAME),
            replica.join(VERSION_FILE_NAME),
        )
        .unwrap();
        GlassDatabase::open(replica, &DatabaseConfig::default()).unwrap()
    }

    fn changes_config(max_changesets: u64) -> DatabaseConfig {
        DatabaseConfig {
            max_changesets,
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn test_commit_advances_revision_and_reader() {
        let dir = TempDir::new().unwrap();
        let mut db = GlassDatabase::create(dir.path(), &DatabaseConfig::default()).unwrap();
        let reader = db.reader();
        let before = reader.current();
        assert_eq!(before.revision, 0);

        db.add_document(&[("hello", 1), ("world", 2)]).unwrap();
        assert_eq!(reader.revision(), 0, "readers don't see staged changes");
        let rev = db.commit(CommitFlags::default()).unwrap();

        assert_eq!(rev, 1);
        assert_eq!(reader.revision(), 1);
        assert_eq!(reader.current().stats.doc_count, 1);
        assert_eq!(before.revision, 0, "old snapshot is unchanged");
        assert!(!reader.current().root(TableKind::Termlist).root_is_fake());
    }

    #[test]
    fn test_termlist_and_frequencies() {
        let dir = TempDir::new().unwrap();
        let mut db = GlassDatabase::create(dir.path(), &DatabaseConfig::default()).unwrap();
        let first = db.add_document(&[("banana", 1), ("apple", 2)]).unwrap();
        db.add_document(&[("apple", 1)]).unwrap();
        db.commit(CommitFlags::default()).unwrap();

        let mut termlist = db.termlist(first, true).unwrap();
        assert_eq!(termlist.doc_length(), 3);
        termlist.next().unwrap();
        assert_eq!(termlist.term(), Some(&b"apple"[..]));
        assert_eq!(termlist.wdf(), Some(2));
        assert_eq!(termlist.termfreq().unwrap(), 2);
        termlist.next().unwrap();
        assert_eq!(termlist.term(), Some(&b"banana"[..]));
        assert_eq!(termlist.termfreq().unwrap(), 1);
    }

    #[test]
    fn test_delete_document_restores_stats() {
        let dir = TempDir::new().unwrap();
        let mut db = GlassDatabase::create(dir.path(), &DatabaseConfig::default()).unwrap();
        let did = db.add_document(&[("a", 2), ("b", 3)]).unwrap();
        db.commit(CommitFlags::default()).unwrap();
        let before = db.stats().clone();

        let other = db.add_document(&[("c", 4)]).unwrap();
        db.delete_document(other).unwrap();
        assert_eq!(db.stats().doc_count, before.doc_count);
        assert_eq!(db.stats().total_doc_length, before.total_doc_length);
        assert!(db.stats().wdf_upper_bound >= before.wdf_upper_bound);

        db.delete_document(did).unwrap();
        assert!(!db.has_document(did).unwrap());
        assert!(matches!(
            db.delete_document(did),
            Err(GlassError::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_cancel_discards_transaction() {
        let dir = TempDir::new().unwrap();
        let mut db = GlassDatabase::create(dir.path(), &DatabaseConfig::default()).unwrap();
        let did = db.add_document(&[("x", 1)]).unwrap();
        db.cancel();
        assert_eq!(db.stats().doc_count, 0);
        assert!(!db.has_document(did).unwrap());
        assert_eq!(db.version().state(), VersionState::Clean);
        assert_eq!(db.commit(CommitFlags::default()).unwrap(), 1);
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let dir = TempDir::new().unwrap();
        let mut db = GlassDatabase::create(dir.path(), &changes_config(2)).unwrap();
        // Break the stats invariant so writing the version fails.
        db.version_mut().add_document(1).unwrap();
        db.table_mut(TableKind::Docdata).put(b"k".to_vec(), b"v".to_vec());

        let result = db.commit(CommitFlags::default());
        assert!(matches!(result, Err(GlassError::Consistency(_))));
        assert_eq!(db.revision(), 0);
        assert_eq!(db.stats().doc_count, 0);
        assert!(db.table(TableKind::Docdata).is_empty());
        assert!(!db.changes().is_active());
        assert!(crate::storage::list_changesets(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_commit_survives_unsynced_directory() {
        let dir = TempDir::new().unwrap();
        let mut db = GlassDatabase::create(dir.path(), &DatabaseConfig::default()).unwrap();
        let did = db.add_document(&[("kept", 1)]).unwrap();

        fail_dir_sync(true);
        let result = db.commit(CommitFlags::default());
        fail_dir_sync(false);

        assert_eq!(result.unwrap(), 1);
        assert!(db.has_document(did).unwrap());
        assert_eq!(db.reader().revision(), 1);
        let durable = VersionFile::read(VersionLocation::directory(dir.path())).unwrap();
        assert_eq!(durable.snapshot(), *db.reader().current());
    }

    #[test]
    fn test_undecodable_table_block_changes_nothing() {
        let primary_dir = TempDir::new().unwrap();
        let replica_dir = TempDir::new().unwrap();
        let forged_dir = TempDir::new().unwrap();
        let mut primary = GlassDatabase::create(primary_dir.path(), &changes_config(5)).unwrap();
        let mut replica = replica_of(primary_dir.path(), replica_dir.path());
        primary.add_document(&[("x", 1)]).unwrap();
        primary.commit(CommitFlags::default()).unwrap();

        let genuine = changeset_path(primary_dir.path(), 1);
        let changeset = ChangesetReader::open(&genuine)
            .unwrap()
            .read_changeset()
            .unwrap();
        assert!(!changeset.table_blocks[TableKind::Postlist.index()].is_empty());

        // Same changeset, but the termlist block is well framed garbage.
        let mut writer = ChangesetWriter::new(forged_dir.path(), 5).unwrap();
        writer.start(0, 1, CommitFlags::default()).unwrap();
        for (kind, block) in TableKind::ALL.into_iter().zip(&changeset.table_blocks) {
            if kind == TableKind::Termlist {
                writer.write_block(&[0xff; 3]).unwrap();
            } else {
                writer.write_block(block).unwrap();
            }
        }
        writer.write_block(&changeset.version_blob).unwrap();
        writer.commit(1, CommitFlags::default()).unwrap();

        let result = replica.apply_changeset(
            &changeset_path(forged_dir.path(), 1),
            CommitFlags::default(),
        );
        assert!(matches!(result, Err(GlassError::Format { .. })));
        assert_eq!(replica.revision(), 0);
        assert!(replica.table(TableKind::Postlist).is_empty());
        assert!(replica.table(TableKind::Termlist).is_empty());

        replica
            .apply_changeset(&genuine, CommitFlags::default())
            .unwrap();
        assert_eq!(replica.table(TableKind::Postlist).len(), 1);
    }

    #[test]
    fn test_failed_install_rolls_back_tables() {
        let primary_dir = TempDir::new().unwrap();
        let replica_dir = TempDir::new().unwrap();
        let mut primary = GlassDatabase::create(primary_dir.path(), &changes_config(5)).unwrap();
        let mut replica = replica_of(primary_dir.path(), replica_dir.path());
        let did = primary.add_document(&[("x", 1), ("y", 2)]).unwrap();
        primary.commit(CommitFlags::default()).unwrap();

        // A directory in the way of the staging file makes the install fail
        // after every table block was applied.
        let blocker = replica_dir.path().join(VERSION_TMP_FILE_NAME);
        fs::create_dir(&blocker).unwrap();
        let path = changeset_path(primary_dir.path(), 1);
        assert!(replica
            .apply_changeset(&path, CommitFlags::default())
            .is_err());
        assert_eq!(replica.revision(), 0);
        assert_eq!(replica.reader().revision(), 0);
        assert!(replica.table(TableKind::Postlist).is_empty());
        assert!(!replica.has_document(did).unwrap());

        fs::remove_dir(&blocker).unwrap();
        assert_eq!(
            replica
                .apply_changeset(&path, CommitFlags::default())
                .unwrap(),
            1
        );
        assert!(replica.has_document(did).unwrap());
        assert_eq!(replica.table(TableKind::Postlist).len(), 2);
    }

    #[test]
    fn test_wrong_table_order_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut tables = TableKind::ALL.map(MemoryTable::new);
        tables.swap(0, 1);
        let result = GlassDatabase::create_with(dir.path(), &DatabaseConfig::default(), tables);
        assert!(matches!(result, Err(GlassError::Consistency(_))));
    }

    #[test]
    fn test_open_detects_single_file_layout() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            single_file: true,
            ..DatabaseConfig::default()
        };
        let mut db = GlassDatabase::create(dir.path(), &config).unwrap();
        db.add_document(&[("solo", 1)]).unwrap();
        db.commit(CommitFlags::default()).unwrap();
        drop(db);

        assert!(dir.path().join(SINGLE_FILE_NAME).exists());
        let db = GlassDatabase::open(dir.path(), &config).unwrap();
        assert!(db.version().single_file());
        assert_eq!(db.revision(), 1);
        assert_eq!(db.stats().doc_count, 1);
    }
}
