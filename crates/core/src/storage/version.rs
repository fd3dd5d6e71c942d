//! The version file: which revision is current, where every table's root
//! lives in it, and the database-wide statistics.
//!
//! A commit stages new roots and stats in memory, [`write`](VersionFile::write)s
//! them to a side location, and then [`sync`](VersionFile::sync)s, which makes
//! the new blob durable and atomically publishes it. Nothing in memory that
//! describes the committed state changes until the publish succeeds.
//!
//! Two storage layouts are supported:
//!
//! - **Directory**: the blob is written to `v.tmp`, fsynced, and renamed over
//!   `iamglass`.
//! - **Single file**: blobs are stored in a file which starts (at a caller
//!   chosen offset) with two pointer slots. Revision `n` is published by
//!   rewriting slot `n % 2`, so the previous revision's slot is never touched
//!   by the commit which supersedes it. A new record may overwrite the one
//!   from two revisions back, which keeps the file from growing.
//!
//! Every blob is `[magic][format u16 BE][uuid][rev][6 x RootInfo][stats]`
//! followed by a `[magic "GCR1"][u32 CRC32 BE]` footer.

use crate::config::{
    CommitFlags, DatabaseConfig, SyncMode, MAX_VERSION_BLOB_BYTES, SINGLE_FILE_NAME, SLOT_MAGIC,
    VERSION_CRC_MAGIC, VERSION_FILE_NAME, VERSION_FORMAT, VERSION_MAGIC, VERSION_TMP_FILE_NAME,
};
use crate::error::{GlassError, Result};
use crate::pack::{pack_uint, take_bytes, unpack_uint};
use crate::storage::root_info::RootInfo;
use crate::storage::stats::DatabaseStats;
use crate::storage::{open_options_rw, sync_dir, sync_file};
use crate::storage::table::{TableKind, TABLE_COUNT};
use crate::{DocId, Revision, TermCount};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Bytes in one single-file pointer slot:
/// `[magic 4][rev u64 LE][record offset u64 LE][record len u32 LE][crc u32 LE]`.
const SLOT_LEN: u64 = 28;

/// Both pointer slots.
const SLOT_HEADER_LEN: u64 = 2 * SLOT_LEN;

/// Magic + format + uuid.
const BLOB_PREFIX_LEN: usize = VERSION_MAGIC.len() + 2 + 16;

/// CRC footer: magic + u32.
const BLOB_FOOTER_LEN: usize = VERSION_CRC_MAGIC.len() + 4;

/// Where version blobs are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionLocation {
    /// `iamglass` inside a database directory.
    Directory(PathBuf),
    /// Records inside one file, with the pointer slots at `offset`.
    SingleFile { path: PathBuf, offset: u64 },
}

/// Progress of the commit in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionState {
    /// In-memory state matches the durable version.
    Clean,
    /// Roots or stats changed in memory, nothing written.
    Staged,
    /// A new version blob is written but not yet published.
    Written,
}

/// Immutable view of one durable revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub uuid: Uuid,
    pub revision: Revision,
    pub roots: [RootInfo; TABLE_COUNT],
    pub stats: DatabaseStats,
}

impl VersionSnapshot {
    pub fn root(&self, kind: TableKind) -> &RootInfo {
        &self.roots[kind.index()]
    }

    /// Serialize to a version blob, CRC footer included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_blob(&self.uuid, self.revision, &self.roots, &self.stats)
    }

    /// Parse and verify a version blob.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let bad = |detail: &str| GlassError::format("version file", detail);
        if raw.len() < BLOB_PREFIX_LEN + BLOB_FOOTER_LEN {
            return Err(bad("too short"));
        }
        let (payload, footer) = raw.split_at(raw.len() - BLOB_FOOTER_LEN);
        if &footer[..VERSION_CRC_MAGIC.len()] != VERSION_CRC_MAGIC {
            return Err(bad("missing CRC footer"));
        }
        let stored_crc = u32::from_be_bytes([footer[4], footer[5], footer[6], footer[7]]);
        let computed_crc = crc32fast::hash(payload);
        if stored_crc != computed_crc {
            return Err(bad(&format!(
                "CRC32 mismatch: expected {:#010x}, got {:#010x}",
                stored_crc, computed_crc
            )));
        }

        let mut cursor = payload;
        let magic = take_bytes(&mut cursor, VERSION_MAGIC.len()).ok_or_else(|| bad("short"))?;
        if magic != VERSION_MAGIC {
            return Err(bad("bad magic"));
        }
        let format = take_bytes(&mut cursor, 2).ok_or_else(|| bad("short"))?;
        let format = u16::from_be_bytes([format[0], format[1]]);
        if format != VERSION_FORMAT {
            return Err(bad(&format!("unsupported format {}", format)));
        }
        let uuid_bytes = take_bytes(&mut cursor, 16).ok_or_else(|| bad("short uuid"))?;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(uuid_bytes);

        let revision = unpack_uint(&mut cursor).ok_or_else(|| bad("bad revision"))?;
        let mut roots = Vec::with_capacity(TABLE_COUNT);
        for kind in TableKind::ALL {
            let root = RootInfo::unserialize(&mut cursor)
                .ok_or_else(|| bad(&format!("bad root info for {} table", kind)))?;
            roots.push(root);
        }
        let roots: [RootInfo; TABLE_COUNT] = roots
            .try_into()
            .map_err(|_| bad("wrong number of root infos"))?;
        let stats = DatabaseStats::unserialize(&mut cursor).ok_or_else(|| bad("bad stats"))?;
        if stats.last_docid < stats.doc_count {
            return Err(bad("last_docid below doc_count"));
        }

        Ok(Self {
            uuid: Uuid::from_bytes(uuid),
            revision,
            roots,
            stats,
        })
    }
}

fn encode_blob(
    uuid: &Uuid,
    revision: Revision,
    roots: &[RootInfo; TABLE_COUNT],
    stats: &DatabaseStats,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(VERSION_MAGIC);
    buf.extend_from_slice(&VERSION_FORMAT.to_be_bytes());
    buf.extend_from_slice(uuid.as_bytes());
    pack_uint(&mut buf, revision);
    for root in roots {
        root.serialize(&mut buf);
    }
    buf.extend_from_slice(&stats.serialize()?);

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(VERSION_CRC_MAGIC);
    buf.extend_from_slice(&crc.to_be_bytes());
    Ok(buf)
}

/// Handle for a written but unpublished version, returned by
/// [`VersionFile::write`] and consumed by [`VersionFile::sync`].
#[derive(Debug)]
pub struct PendingVersion {
    revision: Revision,
    blob: Vec<u8>,
}

impl PendingVersion {
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// The encoded version blob. Changesets carry it as their final block.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    revision: Revision,
    record_offset: u64,
    record_len: u32,
}

impl Slot {
    fn encode(&self) -> [u8; SLOT_LEN as usize] {
        let mut raw = [0u8; SLOT_LEN as usize];
        raw[..4].copy_from_slice(SLOT_MAGIC);
        raw[4..12].copy_from_slice(&self.revision.to_le_bytes());
        raw[12..20].copy_from_slice(&self.record_offset.to_le_bytes());
        raw[20..24].copy_from_slice(&self.record_len.to_le_bytes());
        let crc = crc32fast::hash(&raw[..24]);
        raw[24..].copy_from_slice(&crc.to_le_bytes());
        raw
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != SLOT_LEN as usize || &raw[..4] != SLOT_MAGIC {
            return None;
        }
        let crc = u32::from_le_bytes(raw[24..28].try_into().ok()?);
        if crc != crc32fast::hash(&raw[..24]) {
            return None;
        }
        Some(Self {
            revision: u64::from_le_bytes(raw[4..12].try_into().ok()?),
            record_offset: u64::from_le_bytes(raw[12..20].try_into().ok()?),
            record_len: u32::from_le_bytes(raw[20..24].try_into().ok()?),
        })
    }
}

#[derive(Debug)]
enum PendingTarget {
    Directory { tmp_path: PathBuf },
    SingleFile { slot: Slot, prior_len: u64 },
}

#[derive(Debug)]
struct PendingWrite {
    revision: Revision,
    file: File,
    target: PendingTarget,
}

impl VersionLocation {
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self::Directory(dir.into())
    }

    pub fn single_file(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self::SingleFile {
            path: path.into(),
            offset,
        }
    }

    /// Work out which layout the database in `dir` uses.
    pub fn detect(dir: &Path) -> Result<Self> {
        if dir.join(VERSION_FILE_NAME).exists() {
            return Ok(Self::directory(dir));
        }
        let single = dir.join(SINGLE_FILE_NAME);
        if single.exists() {
            return Ok(Self::single_file(single, 0));
        }
        Err(GlassError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no glass database in {:?}", dir),
        )))
    }

    /// Write `blob` somewhere it does not yet affect `load`.
    fn stage(&self, revision: Revision, blob: &[u8]) -> io::Result<PendingWrite> {
        match self {
            Self::Directory(dir) => {
                let tmp_path = dir.join(VERSION_TMP_FILE_NAME);
                let mut file = open_options_rw()
                    .create(true)
                    .truncate(true)
                    .open(&tmp_path)?;
                if let Err(e) = file.write_all(blob) {
                    let _ = fs::remove_file(&tmp_path);
                    return Err(e);
                }
                Ok(PendingWrite {
                    revision,
                    file,
                    target: PendingTarget::Directory { tmp_path },
                })
            }
            Self::SingleFile { path, offset } => {
                let record_len = u32::try_from(blob.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "version too large"))?;
                let mut file = open_options_rw().open(path)?;
                let prior_len = file.metadata()?.len();
                let record_offset =
                    free_record_offset(&mut file, *offset, revision, blob.len() as u64, prior_len)?;
                let written = file
                    .seek(SeekFrom::Start(record_offset))
                    .and_then(|_| file.write_all(blob));
                if let Err(e) = written {
                    let _ = file.set_len(prior_len);
                    return Err(e);
                }
                Ok(PendingWrite {
                    revision,
                    file,
                    target: PendingTarget::SingleFile {
                        slot: Slot {
                            revision,
                            record_offset,
                            record_len,
                        },
                        prior_len,
                    },
                })
            }
        }
    }

    /// Make a staged blob durable and current.
    fn publish(&self, write: &mut PendingWrite, mode: SyncMode) -> io::Result<()> {
        sync_file(&write.file, mode)?;
        match (self, &write.target) {
            // Once the rename or slot write lands, readers see the new
            // revision; a failed sync after that only weakens durability.
            (Self::Directory(dir), PendingTarget::Directory { tmp_path }) => {
                fs::rename(tmp_path, dir.join(VERSION_FILE_NAME))?;
                if mode != SyncMode::None {
                    if let Err(e) = sync_dir(dir) {
                        tracing::warn!(
                            "Revision {} is published but {:?} was not synced: {}",
                            write.revision,
                            dir,
                            e
                        );
                    }
                }
            }
            (Self::SingleFile { offset, .. }, PendingTarget::SingleFile { slot, .. }) => {
                let slot_offset = offset + (write.revision % 2) * SLOT_LEN;
                write.file.seek(SeekFrom::Start(slot_offset))?;
                write.file.write_all(&slot.encode())?;
                if let Err(e) = sync_file(&write.file, mode) {
                    tracing::warn!(
                        "Revision {} is published but its slot was not synced: {}",
                        write.revision,
                        e
                    );
                }
            }
            _ => {
                return Err(io::Error::other(
                    "pending version does not belong to this location",
                ))
            }
        }
        Ok(())
    }

    /// Throw away a staged blob. Failures only leave garbage which `load`
    /// ignores, so they are logged rather than returned.
    fn discard(&self, write: PendingWrite) {
        match write.target {
            PendingTarget::Directory { tmp_path } => {
                drop(write.file);
                match fs::remove_file(&tmp_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!("Failed to remove {:?}: {}", tmp_path, e),
                }
            }
            PendingTarget::SingleFile { prior_len, .. } => {
                if let Err(e) = write.file.set_len(prior_len) {
                    tracing::warn!(
                        "Failed to truncate abandoned version {} record: {}",
                        write.revision,
                        e
                    );
                }
            }
        }
    }

    /// Read the latest valid revision.
    fn load(&self) -> Result<VersionSnapshot> {
        match self {
            Self::Directory(dir) => {
                let path = dir.join(VERSION_FILE_NAME);
                let size = fs::metadata(&path)?.len();
                if size > MAX_VERSION_BLOB_BYTES {
                    return Err(GlassError::format(
                        "version file",
                        format!("{:?} is {} bytes", path, size),
                    ));
                }
                if dir.join(VERSION_TMP_FILE_NAME).exists() {
                    tracing::warn!("Ignoring abandoned {} in {:?}", VERSION_TMP_FILE_NAME, dir);
                }
                VersionSnapshot::decode(&fs::read(&path)?)
            }
            Self::SingleFile { path, offset } => {
                let mut file = File::open(path)?;
                let mut header = [0u8; SLOT_HEADER_LEN as usize];
                file.seek(SeekFrom::Start(*offset))?;
                file.read_exact(&mut header).map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => {
                        GlassError::format("version file", "missing pointer slots")
                    }
                    _ => GlassError::Io(e),
                })?;

                let mut slots: Vec<Slot> = header
                    .chunks_exact(SLOT_LEN as usize)
                    .filter_map(Slot::decode)
                    .collect();
                slots.sort_by(|a, b| b.revision.cmp(&a.revision));

                for slot in slots {
                    match read_record(&mut file, &slot) {
                        Ok(snapshot) if snapshot.revision == slot.revision => return Ok(snapshot),
                        Ok(snapshot) => tracing::warn!(
                            "Slot for revision {} points at revision {}, skipping",
                            slot.revision,
                            snapshot.revision
                        ),
                        Err(e) => tracing::warn!(
                            "Skipping unreadable revision {} in {:?}: {}",
                            slot.revision,
                            path,
                            e
                        ),
                    }
                }
                Err(GlassError::format(
                    "version file",
                    format!("no valid version record in {:?}", path),
                ))
            }
        }
    }
}

/// Offset for the single-file record of `revision`.
///
/// Only the record of `revision - 1` must survive until the new slot is
/// published; the record of `revision - 2` is superseded and its space is
/// reused. The container therefore holds at most about three records. When
/// the previous slot cannot be read the record is appended.
fn free_record_offset(
    file: &mut File,
    offset: u64,
    revision: Revision,
    len: u64,
    file_len: u64,
) -> io::Result<u64> {
    let records_start = offset + SLOT_HEADER_LEN;
    let append = file_len.max(records_start);
    let Some(previous) = revision.checked_sub(1) else {
        return Ok(append);
    };
    let mut raw = [0u8; SLOT_LEN as usize];
    file.seek(SeekFrom::Start(offset + (previous % 2) * SLOT_LEN))?;
    if file.read_exact(&mut raw).is_err() {
        return Ok(append);
    }
    let live = match Slot::decode(&raw) {
        Some(slot) if slot.revision == previous => slot,
        _ => return Ok(append),
    };
    if records_start + len <= live.record_offset {
        Ok(records_start)
    } else {
        Ok(live.record_offset + u64::from(live.record_len))
    }
}

fn read_record(file: &mut File, slot: &Slot) -> Result<VersionSnapshot> {
    if u64::from(slot.record_len) > MAX_VERSION_BLOB_BYTES {
        return Err(GlassError::format("version file", "record too large"));
    }
    let mut raw = vec![0u8; slot.record_len as usize];
    file.seek(SeekFrom::Start(slot.record_offset))?;
    file.read_exact(&mut raw)?;
    VersionSnapshot::decode(&raw)
}

/// The current revision of a database and the commit in flight.
#[derive(Debug)]
pub struct VersionFile {
    location: VersionLocation,
    uuid: Uuid,
    revision: Revision,
    /// Roots of the durable revision.
    root: [RootInfo; TABLE_COUNT],
    /// Roots of the revision before that.
    old_root: [RootInfo; TABLE_COUNT],
    /// Roots for the next revision.
    staged: [RootInfo; TABLE_COUNT],
    stats: DatabaseStats,
    committed_stats: DatabaseStats,
    pending: Option<PendingWrite>,
    state: VersionState,
}

impl VersionFile {
    /// Create a new database version at revision 0 and publish it.
    ///
    /// Refuses to overwrite an existing version.
    pub fn create(location: VersionLocation, config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let empty = RootInfo::new(config.blocksize, config.compress_min)?;
        let snapshot = VersionSnapshot {
            uuid: Uuid::new_v4(),
            revision: 0,
            roots: std::array::from_fn(|_| empty.clone()),
            stats: DatabaseStats::default(),
        };

        match &location {
            VersionLocation::Directory(dir) => {
                fs::create_dir_all(dir)?;
                let path = dir.join(VERSION_FILE_NAME);
                if path.exists() {
                    return Err(already_exists(&path));
                }
            }
            VersionLocation::SingleFile { path, offset } => {
                let mut file = open_options_rw().create(true).truncate(false).open(path)?;
                if location.load().is_ok() {
                    return Err(already_exists(path));
                }
                // Fresh, zeroed slots.
                file.seek(SeekFrom::Start(*offset))?;
                file.write_all(&[0u8; SLOT_HEADER_LEN as usize])?;
            }
        }

        let blob = snapshot.encode()?;
        let mut write = location.stage(0, &blob)?;
        if let Err(e) = location.publish(&mut write, SyncMode::Full) {
            location.discard(write);
            return Err(e.into());
        }
        tracing::info!(
            "Created database {} at revision 0 ({:?})",
            snapshot.uuid,
            location
        );
        Ok(Self::from_snapshot(location, snapshot))
    }

    /// Open the latest valid revision stored at `location`.
    pub fn read(location: VersionLocation) -> Result<Self> {
        let snapshot = location.load()?;
        tracing::info!(
            "Opened database {} at revision {}",
            snapshot.uuid,
            snapshot.revision
        );
        Ok(Self::from_snapshot(location, snapshot))
    }

    fn from_snapshot(location: VersionLocation, snapshot: VersionSnapshot) -> Self {
        Self {
            location,
            uuid: snapshot.uuid,
            revision: snapshot.revision,
            root: snapshot.roots.clone(),
            old_root: snapshot.roots.clone(),
            staged: snapshot.roots,
            committed_stats: snapshot.stats.clone(),
            stats: snapshot.stats,
            pending: None,
            state: VersionState::Clean,
        }
    }

    pub fn location(&self) -> &VersionLocation {
        &self.location
    }

    pub fn single_file(&self) -> bool {
        matches!(self.location, VersionLocation::SingleFile { .. })
    }

    /// Offset of the pointer slots within a single-file database; 0 otherwise.
    pub fn offset(&self) -> u64 {
        match self.location {
            VersionLocation::SingleFile { offset, .. } => offset,
            VersionLocation::Directory(_) => 0,
        }
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn uuid_string(&self) -> String {
        self.uuid.hyphenated().to_string()
    }

    /// The durable revision.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn state(&self) -> VersionState {
        self.state
    }

    pub fn root(&self, kind: TableKind) -> &RootInfo {
        &self.root[kind.index()]
    }

    pub fn old_root(&self, kind: TableKind) -> &RootInfo {
        &self.old_root[kind.index()]
    }

    /// The root the next revision will record for `kind`.
    pub fn staged_root(&self, kind: TableKind) -> &RootInfo {
        &self.staged[kind.index()]
    }

    /// Mutable access to the staged root of `kind`.
    pub fn root_to_set(&mut self, kind: TableKind) -> Result<&mut RootInfo> {
        self.begin_change()?;
        Ok(&mut self.staged[kind.index()])
    }

    /// Live statistics, including uncommitted changes.
    pub fn stats(&self) -> &DatabaseStats {
        &self.stats
    }

    pub fn add_document(&mut self, doclen: TermCount) -> Result<()> {
        self.begin_change()?;
        self.stats.add_document(doclen)
    }

    pub fn delete_document(&mut self, doclen: TermCount) -> Result<()> {
        self.begin_change()?;
        self.stats.delete_document(doclen)
    }

    pub fn check_wdf(&mut self, wdf: TermCount) -> Result<()> {
        self.begin_change()?;
        self.stats.check_wdf(wdf);
        Ok(())
    }

    pub fn next_docid(&mut self) -> Result<DocId> {
        self.begin_change()?;
        self.stats.next_docid()
    }

    pub fn set_spelling_wordfreq_upper_bound(&mut self, bound: TermCount) -> Result<()> {
        self.begin_change()?;
        self.stats.spelling_wordfreq_upper_bound = bound;
        Ok(())
    }

    /// Fold in another database's statistics, as when compacting.
    pub fn merge_stats(&mut self, other: &DatabaseStats) -> Result<()> {
        self.begin_change()?;
        self.stats.merge(other)
    }

    fn begin_change(&mut self) -> Result<()> {
        if self.state == VersionState::Written {
            return Err(GlassError::Consistency(
                "version modified while a write is pending".into(),
            ));
        }
        self.state = VersionState::Staged;
        Ok(())
    }

    /// The durable revision as an immutable value.
    pub fn snapshot(&self) -> VersionSnapshot {
        VersionSnapshot {
            uuid: self.uuid,
            revision: self.revision,
            roots: self.root.clone(),
            stats: self.committed_stats.clone(),
        }
    }

    /// Serialize the staged roots and stats as revision `new_rev` and write
    /// them to the side location.
    ///
    /// `new_rev` must be exactly one more than the current revision.
    pub fn write(&mut self, new_rev: Revision) -> Result<PendingVersion> {
        if self.state == VersionState::Written {
            return Err(GlassError::Consistency(format!(
                "revision {} is already written and pending",
                new_rev
            )));
        }
        if self.revision.checked_add(1) != Some(new_rev) {
            return Err(GlassError::Consistency(format!(
                "cannot write revision {} on top of revision {}",
                new_rev, self.revision
            )));
        }

        let blob = encode_blob(&self.uuid, new_rev, &self.staged, &self.stats)?;
        let write = self.location.stage(new_rev, &blob)?;
        tracing::debug!(
            "Wrote version {} ({} bytes, pending publish)",
            new_rev,
            blob.len()
        );
        self.pending = Some(write);
        self.state = VersionState::Written;
        Ok(PendingVersion {
            revision: new_rev,
            blob,
        })
    }

    /// Make the pending write durable and current.
    ///
    /// Returns `Ok(false)` if the durable swap failed. The pending write is
    /// discarded, the committed revision is unchanged and the staged state is
    /// kept, so the caller can write again or cancel.
    pub fn sync(
        &mut self,
        pending: PendingVersion,
        new_rev: Revision,
        flags: CommitFlags,
    ) -> Result<bool> {
        let mut write = self.pending.take().ok_or_else(|| {
            GlassError::Consistency(format!("sync of revision {} with nothing written", new_rev))
        })?;
        if pending.revision != new_rev || write.revision != new_rev {
            let written = write.revision;
            self.pending = Some(write);
            return Err(GlassError::Consistency(format!(
                "sync of revision {} does not match pending revision {}",
                new_rev, written
            )));
        }

        if let Err(e) = self.location.publish(&mut write, flags.sync) {
            tracing::error!("Failed to publish revision {}: {}", new_rev, e);
            self.location.discard(write);
            self.state = VersionState::Staged;
            return Ok(false);
        }

        self.old_root = std::mem::replace(&mut self.root, self.staged.clone());
        self.committed_stats = self.stats.clone();
        self.revision = new_rev;
        self.state = VersionState::Clean;
        tracing::info!(
            "Published revision {} ({} bytes, CRC32={:#010x})",
            new_rev,
            pending.blob.len(),
            crc32fast::hash(&pending.blob)
        );
        Ok(true)
    }

    /// Drop all uncommitted changes, including a pending write.
    pub fn cancel(&mut self) {
        if let Some(write) = self.pending.take() {
            tracing::warn!("Abandoning pending revision {}", write.revision);
            self.location.discard(write);
        }
        self.staged = self.root.clone();
        self.stats = self.committed_stats.clone();
        self.state = VersionState::Clean;
    }

    /// Durably install a version blob produced by another copy of this
    /// database, as the next revision.
    pub fn install(&mut self, blob: &[u8], flags: CommitFlags) -> Result<()> {
        if self.state != VersionState::Clean {
            return Err(GlassError::Consistency(
                "cannot install a version over uncommitted changes".into(),
            ));
        }
        let snapshot = VersionSnapshot::decode(blob)?;
        if snapshot.uuid != self.uuid {
            return Err(GlassError::Consistency(format!(
                "version belongs to database {}, not {}",
                snapshot.uuid, self.uuid
            )));
        }
        if self.revision.checked_add(1) != Some(snapshot.revision) {
            return Err(GlassError::Consistency(format!(
                "cannot install revision {} on top of revision {}",
                snapshot.revision, self.revision
            )));
        }

        let mut write = self.location.stage(snapshot.revision, blob)?;
        if let Err(e) = self.location.publish(&mut write, flags.sync) {
            self.location.discard(write);
            return Err(e.into());
        }

        self.old_root = std::mem::replace(&mut self.root, snapshot.roots.clone());
        self.staged = snapshot.roots;
        self.committed_stats = snapshot.stats.clone();
        self.stats = snapshot.stats;
        self.revision = snapshot.revision;
        tracing::info!("Installed revision {}", self.revision);
        Ok(())
    }
}

fn already_exists(path: &Path) -> GlassError {
    GlassError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{:?} already holds a database version", path),
    ))
}
