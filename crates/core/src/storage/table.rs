//! Table capability seam and a reference in-memory table.
//!
//! The block-level B-tree is outside this crate. The commit path only needs
//! each table to flush itself into a new [`RootInfo`], describe what changed
//! between two roots, and replay such a description on a replica.

use crate::error::{GlassError, Result};
use crate::storage::root_info::RootInfo;
use crate::termlist::{termlist_key, PostingSource, TermListTable};
use crate::{BlockNumber, DocCount, DocId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of tables in a database.
pub const TABLE_COUNT: usize = 6;

/// The tables of a database, in the fixed order used by version files and
/// changesets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Postlist,
    Docdata,
    Termlist,
    Position,
    Spelling,
    Synonym,
}

impl TableKind {
    /// Every table kind in on-disk order.
    pub const ALL: [TableKind; TABLE_COUNT] = [
        TableKind::Postlist,
        TableKind::Docdata,
        TableKind::Termlist,
        TableKind::Position,
        TableKind::Spelling,
        TableKind::Synonym,
    ];

    /// Position of this table in version files and changesets.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TableKind::Postlist => "postlist",
            TableKind::Docdata => "docdata",
            TableKind::Termlist => "termlist",
            TableKind::Position => "position",
            TableKind::Spelling => "spelling",
            TableKind::Synonym => "synonym",
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What the revision layer needs from a table.
///
/// Flushes of different tables may run concurrently, so implementations must
/// be `Send`.
pub trait Table: Send {
    fn kind(&self) -> TableKind;

    /// Write out all buffered modifications and return the root describing
    /// the result. `current` is the root of the last committed revision.
    fn flush(&mut self, current: &RootInfo) -> Result<RootInfo>;

    /// Encode the difference between two roots of this table, for inclusion
    /// in a changeset. An empty vector means "no change".
    fn diff(&self, old_root: &RootInfo, new_root: &RootInfo) -> Result<Vec<u8>>;

    /// Check that a block produced by [`Table::diff`] can be replayed,
    /// without changing the table.
    fn check_changes(&self, block: &[u8]) -> Result<()>;

    /// Replay a block produced by [`Table::diff`] on a replica, leaving the
    /// table at `new_root`. Until the next flush, [`Table::cancel`] with the
    /// previous root undoes the replay.
    fn apply_changes(&mut self, block: &[u8], new_root: &RootInfo) -> Result<()>;

    /// Throw away anything flushed or buffered since the table was at
    /// `committed`.
    fn cancel(&mut self, committed: &RootInfo);
}

/// One modification recorded in a [`MemoryTable`] changeset block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableChange {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl TableChange {
    pub fn key(&self) -> &[u8] {
        match self {
            TableChange::Put { key, .. } | TableChange::Delete { key } => key,
        }
    }
}

/// State captured by the last flush, kept until the next one so the commit
/// path can diff it or cancel it.
#[derive(Debug)]
struct FlushRecord {
    /// Root the flush started from; `None` for a replayed changeset.
    base_block: Option<BlockNumber>,
    root_block: BlockNumber,
    changes: Vec<TableChange>,
    /// Previous values of every key touched, for rolling the flush back.
    undo: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

/// An ordered in-memory key/value table.
///
/// Writes are buffered until [`Table::flush`]. Every flush that changes
/// something is given a fresh root block number, so roots of different
/// revisions never compare equal.
#[derive(Debug)]
pub struct MemoryTable {
    kind: TableKind,
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    buffered: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    next_block: BlockNumber,
    last_flush: Option<FlushRecord>,
}

impl MemoryTable {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            committed: BTreeMap::new(),
            buffered: BTreeMap::new(),
            next_block: 1,
            last_flush: None,
        }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.buffered.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.buffered.insert(key.into(), None);
    }

    /// Current value of `key`, including buffered writes.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        match self.buffered.get(key) {
            Some(Some(value)) => Some(value.as_slice()),
            Some(None) => None,
            None => self.committed.get(key).map(Vec::as_slice),
        }
    }

    /// Number of flushed entries.
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Store a document's encoded termlist.
    pub fn set_termlist(&mut self, did: DocId, encoded: Vec<u8>) {
        self.put(termlist_key(did).to_vec(), encoded);
    }

    fn apply(&mut self, change: &TableChange) -> Option<Vec<u8>> {
        match change {
            TableChange::Put { key, value } => self.committed.insert(key.clone(), value.clone()),
            TableChange::Delete { key } => self.committed.remove(key),
        }
    }

    fn decode_changes(&self, block: &[u8]) -> Result<Vec<TableChange>> {
        if block.is_empty() {
            return Ok(Vec::new());
        }
        bincode::deserialize(block).map_err(|e| {
            GlassError::format("table changeset block", format!("{} table: {}", self.kind, e))
        })
    }

    fn describe_root(
        &self,
        current: &RootInfo,
        root_block: BlockNumber,
        sequential: bool,
    ) -> RootInfo {
        let mut root = current.clone();
        let entries = self.committed.len() as u64;
        root.set_root_block(root_block);
        root.set_num_entries(entries);
        root.set_root_is_fake(entries == 0);
        root.set_sequential(sequential);
        root.set_level(tree_level(entries, current.blocksize()));
        root
    }
}

/// Height a B-tree of `entries` items would need with roughly 64-byte items.
fn tree_level(entries: u64, blocksize: u32) -> u32 {
    let fanout = u64::from((blocksize / 64).max(2));
    let mut level = 0;
    let mut capacity = fanout;
    while capacity < entries {
        capacity = capacity.saturating_mul(fanout);
        level += 1;
    }
    level
}

impl Table for MemoryTable {
    fn kind(&self) -> TableKind {
        self.kind
    }

    fn flush(&mut self, current: &RootInfo) -> Result<RootInfo> {
        if self.buffered.is_empty() {
            self.last_flush = None;
            return Ok(current.clone());
        }

        let mut sequential = current.sequential();
        let mut changes = Vec::with_capacity(self.buffered.len());
        let mut undo = Vec::with_capacity(self.buffered.len());
        let buffered = std::mem::take(&mut self.buffered);
        for (key, value) in buffered {
            let change = match value {
                Some(value) => {
                    if let Some((last, _)) = self.committed.last_key_value() {
                        sequential &= key > *last;
                    }
                    TableChange::Put { key, value }
                }
                None => TableChange::Delete { key },
            };
            let previous = self.apply(&change);
            undo.push((change.key().to_vec(), previous));
            changes.push(change);
        }

        let root_block = self.next_block.max(current.root_block().saturating_add(1));
        self.next_block = root_block.saturating_add(1);
        self.last_flush = Some(FlushRecord {
            base_block: Some(current.root_block()),
            root_block,
            changes,
            undo,
        });
        Ok(self.describe_root(current, root_block, sequential))
    }

    fn diff(&self, old_root: &RootInfo, new_root: &RootInfo) -> Result<Vec<u8>> {
        if old_root.root_block() == new_root.root_block() {
            return Ok(Vec::new());
        }
        match &self.last_flush {
            Some(flush)
                if flush.base_block == Some(old_root.root_block())
                    && flush.root_block == new_root.root_block() =>
            {
                bincode::serialize(&flush.changes).map_err(|e| {
                    GlassError::Consistency(format!("encoding {} changes: {}", self.kind, e))
                })
            }
            _ => Err(GlassError::Consistency(format!(
                "{} table cannot diff root {} against {}",
                self.kind,
                old_root.root_block(),
                new_root.root_block()
            ))),
        }
    }

    fn check_changes(&self, block: &[u8]) -> Result<()> {
        self.decode_changes(block).map(|_| ())
    }

    fn apply_changes(&mut self, block: &[u8], new_root: &RootInfo) -> Result<()> {
        let changes = self.decode_changes(block)?;
        self.buffered.clear();
        let undo = changes
            .iter()
            .map(|change| (change.key().to_vec(), self.apply(change)))
            .collect();
        self.next_block = self.next_block.max(new_root.root_block().saturating_add(1));
        tracing::debug!(
            "Applied {} {} changes, {} entries at root {}",
            changes.len(),
            self.kind,
            self.committed.len(),
            new_root.root_block()
        );
        self.last_flush = Some(FlushRecord {
            base_block: None,
            root_block: new_root.root_block(),
            changes,
            undo,
        });
        Ok(())
    }

    fn cancel(&mut self, committed: &RootInfo) {
        self.buffered.clear();
        if let Some(flush) = self.last_flush.take() {
            if flush.root_block != committed.root_block() {
                for (key, previous) in flush.undo.into_iter().rev() {
                    match previous {
                        Some(value) => self.committed.insert(key, value),
                        None => self.committed.remove(&key),
                    };
                }
            }
        }
    }
}

impl TermListTable for MemoryTable {
    fn termlist(&self, did: DocId) -> Result<Option<Vec<u8>>> {
        Ok(self.get(&termlist_key(did)).map(<[u8]>::to_vec))
    }
}

/// Term frequencies kept in a postlist table as `term -> u32 BE`.
impl PostingSource for MemoryTable {
    fn term_frequency(&self, term: &[u8]) -> Result<DocCount> {
        match self.get(term) {
            None => Ok(0),
            Some(raw) => raw
                .try_into()
                .map(DocCount::from_be_bytes)
                .map_err(|_| GlassError::format("postlist entry", format!("{} bytes", raw.len()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BLOCKSIZE;

    fn empty_root() -> RootInfo {
        RootInfo::new(DEFAULT_BLOCKSIZE, 4).unwrap()
    }

    #[test]
    fn test_table_order_is_fixed() {
        for (i, kind) in TableKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(TableKind::Termlist.to_string(), "termlist");
    }

    #[test]
    fn test_flush_without_changes_keeps_root() {
        let mut table = MemoryTable::new(TableKind::Docdata);
        let root = empty_root();
        assert_eq!(table.flush(&root).unwrap(), root);
    }

    #[test]
    fn test_flush_describes_contents() {
        let mut table = MemoryTable::new(TableKind::Docdata);
        table.put(b"a".to_vec(), b"1".to_vec());
        table.put(b"b".to_vec(), b"2".to_vec());
        let root = table.flush(&empty_root()).unwrap();
        assert_eq!(root.num_entries(), 2);
        assert!(!root.root_is_fake());
        assert!(root.sequential());
        assert_ne!(root.root_block(), 0);
        assert_eq!(table.get(b"a"), Some(&b"1"[..]));
    }

    #[test]
    fn test_out_of_order_insert_clears_sequential() {
        let mut table = MemoryTable::new(TableKind::Docdata);
        table.put(b"m".to_vec(), b"1".to_vec());
        let first = table.flush(&empty_root()).unwrap();
        table.put(b"c".to_vec(), b"2".to_vec());
        let second = table.flush(&first).unwrap();
        assert!(!second.sequential());
    }

    #[test]
    fn test_diff_and_apply_reproduce_contents() {
        let mut primary = MemoryTable::new(TableKind::Postlist);
        let base = empty_root();
        primary.put(b"k1".to_vec(), b"v1".to_vec());
        primary.put(b"k2".to_vec(), b"v2".to_vec());
        let new_root = primary.flush(&base).unwrap();
        let block = primary.diff(&base, &new_root).unwrap();
        assert!(!block.is_empty());

        let mut replica = MemoryTable::new(TableKind::Postlist);
        replica.apply_changes(&block, &new_root).unwrap();
        assert_eq!(replica.get(b"k1"), Some(&b"v1"[..]));
        assert_eq!(replica.get(b"k2"), Some(&b"v2"[..]));
        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn test_diff_of_unrelated_roots_fails() {
        let mut table = MemoryTable::new(TableKind::Postlist);
        table.put(b"k".to_vec(), b"v".to_vec());
        let flushed = table.flush(&empty_root()).unwrap();
        let mut other = flushed.clone();
        other.set_root_block(flushed.root_block() + 10);
        assert!(table.diff(&empty_root(), &other).is_err());
    }

    #[test]
    fn test_apply_garbage_is_format_error() {
        let mut table = MemoryTable::new(TableKind::Postlist);
        let result = table.apply_changes(&[0xff, 0xff, 0xff], &empty_root());
        assert!(matches!(result, Err(GlassError::Format { .. })));
    }

    #[test]
    fn test_check_changes_leaves_table_alone() {
        let mut primary = MemoryTable::new(TableKind::Postlist);
        primary.put(b"k".to_vec(), b"v".to_vec());
        let new_root = primary.flush(&empty_root()).unwrap();
        let block = primary.diff(&empty_root(), &new_root).unwrap();

        let replica = MemoryTable::new(TableKind::Postlist);
        replica.check_changes(&block).unwrap();
        replica.check_changes(&[]).unwrap();
        assert!(replica.is_empty());
        assert!(matches!(
            replica.check_changes(&[0xff; 3]),
            Err(GlassError::Format { .. })
        ));
    }

    #[test]
    fn test_cancel_undoes_replayed_changes() {
        let base = empty_root();
        let mut primary = MemoryTable::new(TableKind::Termlist);
        primary.put(b"a".to_vec(), b"1".to_vec());
        let first = primary.flush(&base).unwrap();
        let mut replica = MemoryTable::new(TableKind::Termlist);
        replica
            .apply_changes(&primary.diff(&base, &first).unwrap(), &first)
            .unwrap();

        primary.put(b"a".to_vec(), b"2".to_vec());
        primary.put(b"b".to_vec(), b"3".to_vec());
        let second = primary.flush(&first).unwrap();
        replica
            .apply_changes(&primary.diff(&first, &second).unwrap(), &second)
            .unwrap();
        assert_eq!(replica.len(), 2);

        replica.cancel(&first);
        assert_eq!(replica.get(b"a"), Some(&b"1"[..]));
        assert_eq!(replica.get(b"b"), None);

        // Once the replayed root is the committed one, cancel keeps it.
        replica
            .apply_changes(&primary.diff(&first, &second).unwrap(), &second)
            .unwrap();
        replica.cancel(&second);
        assert_eq!(replica.get(b"a"), Some(&b"2"[..]));
    }

    #[test]
    fn test_cancel_rolls_back_uncommitted_flush() {
        let mut table = MemoryTable::new(TableKind::Docdata);
        let base = empty_root();
        table.put(b"keep".to_vec(), b"1".to_vec());
        let committed = table.flush(&base).unwrap();

        table.put(b"keep".to_vec(), b"2".to_vec());
        table.delete(b"gone".to_vec());
        table.put(b"new".to_vec(), b"3".to_vec());
        table.flush(&committed).unwrap();
        table.cancel(&committed);

        assert_eq!(table.get(b"keep"), Some(&b"1"[..]));
        assert_eq!(table.get(b"new"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cancel_after_commit_keeps_data() {
        let mut table = MemoryTable::new(TableKind::Docdata);
        table.put(b"k".to_vec(), b"v".to_vec());
        let committed = table.flush(&empty_root()).unwrap();
        table.put(b"pending".to_vec(), b"x".to_vec());
        table.cancel(&committed);
        assert_eq!(table.get(b"k"), Some(&b"v"[..]));
        assert_eq!(table.get(b"pending"), None);
    }

    #[test]
    fn test_tree_level_grows_with_entries() {
        assert_eq!(tree_level(0, DEFAULT_BLOCKSIZE), 0);
        assert_eq!(tree_level(100, DEFAULT_BLOCKSIZE), 0);
        assert_eq!(tree_level(200, DEFAULT_BLOCKSIZE), 1);
        assert_eq!(tree_level(20_000_000, DEFAULT_BLOCKSIZE), 3);
    }

    #[test]
    fn test_postlist_term_frequency() {
        let mut table = MemoryTable::new(TableKind::Postlist);
        table.put(b"apple".to_vec(), 3u32.to_be_bytes().to_vec());
        table.put(b"broken".to_vec(), vec![1, 2]);
        assert_eq!(table.term_frequency(b"apple").unwrap(), 3);
        assert_eq!(table.term_frequency(b"absent").unwrap(), 0);
        assert!(table.term_frequency(b"broken").is_err());
    }
}
