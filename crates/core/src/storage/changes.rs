//! Changesets: the per-revision delta files a replica replays to catch up.
//!
//! `changes.N` holds everything needed to move from revision `N - 1` to `N`:
//!
//! ```text
//! "GlassChanges" | format u8 | old_rev varint | new_rev varint | flags u8
//! block * (TABLE_COUNT + 1)
//! ```
//!
//! Each block is framed `[u32 len BE][u32 CRC32 BE][payload]`. The first
//! `TABLE_COUNT` blocks are the table diffs in [`TableKind::ALL`] order, the
//! last is the new version blob. There is no end marker; the file ends after
//! the final block.
//!
//! [`TableKind::ALL`]: crate::storage::table::TableKind::ALL

use crate::config::{
    CommitFlags, SyncMode, CHANGES_FORMAT, CHANGES_MAGIC, CHANGES_STEM,
    MAX_CHANGESET_BLOCK_BYTES,
};
use crate::error::{GlassError, Result};
use crate::pack::{pack_uint, unpack_uint};
use crate::storage::table::TABLE_COUNT;
use crate::storage::version::VersionSnapshot;
use crate::storage::{open_options_rw, sync_dir, sync_file};
use crate::Revision;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const FLAG_DANGEROUS: u8 = 0x01;

/// Blocks in a complete changeset: one per table plus the version blob.
pub const CHANGESET_BLOCKS: usize = TABLE_COUNT + 1;

/// Path of the changeset which produces revision `revision`.
pub fn changeset_path(dir: &Path, revision: Revision) -> PathBuf {
    dir.join(format!("{}.{}", CHANGES_STEM, revision))
}

fn staging_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.tmp", CHANGES_STEM))
}

/// Revisions of all changesets present in `dir`, ascending.
pub fn list_changesets(dir: &Path) -> Result<Vec<Revision>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut revisions = Vec::new();
    for entry in entries {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name
            .strip_prefix(CHANGES_STEM)
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(revision) = suffix.parse::<Revision>() {
                revisions.push(revision);
            }
        }
    }
    revisions.sort_unstable();
    Ok(revisions)
}

/// Fixed header at the start of every changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetHeader {
    pub old_revision: Revision,
    pub new_revision: Revision,
    /// Produced by a commit which modified tables in place.
    pub dangerous: bool,
}

impl ChangesetHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHANGES_MAGIC.len() + 22);
        buf.extend_from_slice(CHANGES_MAGIC);
        buf.push(CHANGES_FORMAT);
        pack_uint(&mut buf, self.old_revision);
        pack_uint(&mut buf, self.new_revision);
        buf.push(if self.dangerous { FLAG_DANGEROUS } else { 0 });
        buf
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let bad = |detail: &str| GlassError::format("changeset header", detail);
        let mut magic = [0u8; CHANGES_MAGIC.len()];
        read_exact_or(reader, &mut magic, "short header")?;
        if &magic != CHANGES_MAGIC {
            return Err(bad("bad magic"));
        }
        let mut byte = [0u8; 1];
        read_exact_or(reader, &mut byte, "missing format")?;
        if byte[0] != CHANGES_FORMAT {
            return Err(bad(&format!("unsupported format {}", byte[0])));
        }
        let old_revision = read_varint(reader)?;
        let new_revision = read_varint(reader)?;
        read_exact_or(reader, &mut byte, "missing flags")?;
        if old_revision.checked_add(1) != Some(new_revision) {
            return Err(bad(&format!(
                "revision {} does not follow revision {}",
                new_revision, old_revision
            )));
        }
        Ok(Self {
            old_revision,
            new_revision,
            dangerous: byte[0] & FLAG_DANGEROUS != 0,
        })
    }
}

fn read_exact_or<R: Read>(reader: &mut R, buf: &mut [u8], detail: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => GlassError::format("changeset header", detail),
        _ => GlassError::Io(e),
    })
}

/// Read one varint from a stream, a byte at a time.
fn read_varint<R: Read>(reader: &mut R) -> Result<Revision> {
    let mut raw = Vec::with_capacity(10);
    let mut byte = [0u8; 1];
    loop {
        read_exact_or(reader, &mut byte, "truncated revision")?;
        raw.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            break;
        }
        if raw.len() >= 10 {
            return Err(GlassError::format("changeset header", "overlong revision"));
        }
    }
    unpack_uint(&mut raw.as_slice())
        .ok_or_else(|| GlassError::format("changeset header", "bad revision"))
}

/// Frame a block as `[u32 len BE][u32 crc32 BE][payload]`.
fn frame_block(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_CHANGESET_BLOCK_BYTES)
        .ok_or_else(|| {
            GlassError::Consistency(format!(
                "changeset block of {} bytes exceeds {} byte limit",
                payload.len(),
                MAX_CHANGESET_BLOCK_BYTES
            ))
        })?;
    let crc = crc32fast::hash(payload);
    let mut framed = Vec::with_capacity(8 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&crc.to_be_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

#[derive(Debug)]
struct ActiveChangeset {
    header: ChangesetHeader,
    writer: BufWriter<File>,
    blocks: usize,
}

/// Records the changeset of each commit and prunes old ones.
///
/// Owned by the single writer of a database. With `max_changesets == 0`
/// every call is a no-op.
#[derive(Debug)]
pub struct ChangesetWriter {
    dir: PathBuf,
    max_changesets: u64,
    oldest_changeset: Option<Revision>,
    active: Option<ActiveChangeset>,
}

impl ChangesetWriter {
    /// Scans `dir` once to find the oldest retained changeset.
    pub fn new(dir: impl Into<PathBuf>, max_changesets: u64) -> Result<Self> {
        let dir = dir.into();
        let oldest_changeset = list_changesets(&dir)?.first().copied();
        if fs::remove_file(staging_path(&dir)).is_ok() {
            tracing::warn!("Removed abandoned changeset staging file in {:?}", dir);
        }
        Ok(Self {
            dir,
            max_changesets,
            oldest_changeset,
            active: None,
        })
    }

    pub fn max_changesets(&self) -> u64 {
        self.max_changesets
    }

    pub fn enabled(&self) -> bool {
        self.max_changesets > 0
    }

    /// Smallest changeset revision still present, if any.
    pub fn oldest_changeset(&self) -> Option<Revision> {
        self.oldest_changeset
    }

    pub fn set_oldest_changeset(&mut self, revision: Option<Revision>) {
        self.oldest_changeset = revision;
    }

    /// Whether a changeset is being recorded.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Begin recording the changeset for `old_rev -> new_rev`.
    ///
    /// Returns `false` without touching the disk when changesets are
    /// disabled.
    pub fn start(
        &mut self,
        old_rev: Revision,
        new_rev: Revision,
        flags: CommitFlags,
    ) -> Result<bool> {
        if !self.enabled() {
            return Ok(false);
        }
        if self.active.is_some() {
            return Err(GlassError::Consistency(
                "changeset started while another is being recorded".into(),
            ));
        }
        if old_rev.checked_add(1) != Some(new_rev) {
            return Err(GlassError::Consistency(format!(
                "changeset for revision {} cannot start from revision {}",
                new_rev, old_rev
            )));
        }

        let header = ChangesetHeader {
            old_revision: old_rev,
            new_revision: new_rev,
            dangerous: flags.dangerous,
        };
        let path = staging_path(&self.dir);
        let file = open_options_rw().create(true).truncate(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if let Err(e) = writer.write_all(&header.encode()) {
            drop(writer);
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        self.active = Some(ActiveChangeset {
            header,
            writer,
            blocks: 0,
        });
        tracing::debug!("Recording changeset {} -> {}", old_rev, new_rev);
        Ok(true)
    }

    /// Append the next block. Ignored when nothing is being recorded.
    pub fn write_block(&mut self, block: &[u8]) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if active.blocks == CHANGESET_BLOCKS {
            return Err(GlassError::Consistency(format!(
                "changeset already has {} blocks",
                CHANGESET_BLOCKS
            )));
        }
        active.writer.write_all(&frame_block(block)?)?;
        active.blocks += 1;
        Ok(())
    }

    /// Make the recorded changeset durable under its final name, then prune
    /// changesets beyond the retention limit.
    ///
    /// On error before the rename the staging file is removed. A failed
    /// directory sync after it is still reported, with the changeset kept
    /// and retention already applied.
    pub fn commit(&mut self, new_rev: Revision, flags: CommitFlags) -> Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        if active.header.new_revision != new_rev || active.blocks != CHANGESET_BLOCKS {
            let detail = format!(
                "changeset for revision {} with {} blocks committed as revision {}",
                active.header.new_revision, active.blocks, new_rev
            );
            self.discard(active);
            return Err(GlassError::Consistency(detail));
        }

        let finished = active
            .writer
            .flush()
            .and_then(|_| sync_file(active.writer.get_ref(), flags.sync));
        if let Err(e) = finished {
            self.discard(active);
            return Err(e.into());
        }
        drop(active.writer);
        let path = changeset_path(&self.dir, new_rev);
        if let Err(e) = fs::rename(staging_path(&self.dir), &path) {
            let _ = fs::remove_file(staging_path(&self.dir));
            return Err(e.into());
        }
        tracing::info!("Committed changeset {:?}", path);

        // The file exists from here on, so retention must account for it
        // even if the directory sync below fails.
        if self.oldest_changeset.is_none() {
            self.oldest_changeset = Some(new_rev);
        }
        self.prune(new_rev);
        if flags.sync != SyncMode::None {
            sync_dir(&self.dir)?;
        }
        Ok(())
    }

    /// Drop the changeset being recorded.
    pub fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(
                "Aborting changeset for revision {}",
                active.header.new_revision
            );
            self.discard(active);
        }
    }

    fn discard(&self, active: ActiveChangeset) {
        drop(active.writer);
        let path = staging_path(&self.dir);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {:?}: {}", path, e),
        }
    }

    /// Delete changesets older than the newest `max_changesets`. Failures
    /// are logged and skipped.
    fn prune(&mut self, new_rev: Revision) {
        let Some(oldest) = self.oldest_changeset else {
            return;
        };
        let keep_from = new_rev.saturating_sub(self.max_changesets) + 1;
        if oldest >= keep_from {
            return;
        }
        for revision in oldest..keep_from {
            let path = changeset_path(&self.dir, revision);
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Pruned changeset {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to prune changeset {:?}: {}", path, e),
            }
        }
        self.oldest_changeset = Some(keep_from);
    }
}

/// A fully read and verified changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    pub header: ChangesetHeader,
    /// One block per table, in table order.
    pub table_blocks: Vec<Vec<u8>>,
    /// Version blob of the new revision.
    pub version_blob: Vec<u8>,
}

/// Sequential reader over a changeset stream.
pub struct ChangesetReader<R: Read> {
    reader: R,
    header: ChangesetHeader,
}

impl ChangesetReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> ChangesetReader<R> {
    /// Parses the header.
    pub fn new(mut reader: R) -> Result<Self> {
        let header = ChangesetHeader::read_from(&mut reader)?;
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> &ChangesetHeader {
        &self.header
    }

    /// The next block, or `None` at the end of the file.
    pub fn next_block(&mut self) -> Result<Option<Vec<u8>>> {
        let bad = |detail: &str| GlassError::format("changeset block", detail);
        let mut frame = [0u8; 8];
        let mut filled = 0;
        while filled < frame.len() {
            match self.reader.read(&mut frame[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(bad("truncated block header")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let stored_crc = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if len > MAX_CHANGESET_BLOCK_BYTES {
            return Err(bad(&format!("block length {} exceeds limit", len)));
        }
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => bad("block runs past end of file"),
            _ => GlassError::Io(e),
        })?;
        let computed_crc = crc32fast::hash(&payload);
        if computed_crc != stored_crc {
            return Err(bad(&format!(
                "CRC32 mismatch: expected {:#010x}, got {:#010x}",
                stored_crc, computed_crc
            )));
        }
        Ok(Some(payload))
    }

    /// Read every block, requiring exactly one per table plus the version.
    pub fn read_changeset(mut self) -> Result<Changeset> {
        let mut blocks = Vec::with_capacity(CHANGESET_BLOCKS);
        while let Some(block) = self.next_block()? {
            if blocks.len() == CHANGESET_BLOCKS {
                return Err(GlassError::format(
                    "changeset",
                    "trailing data after version block",
                ));
            }
            blocks.push(block);
        }
        if blocks.len() != CHANGESET_BLOCKS {
            return Err(GlassError::format(
                "changeset",
                format!(
                    "truncated: {} of {} blocks present",
                    blocks.len(),
                    CHANGESET_BLOCKS
                ),
            ));
        }
        let version_blob = blocks.pop().unwrap_or_default();
        Ok(Changeset {
            header: self.header,
            table_blocks: blocks,
            version_blob,
        })
    }
}

/// Validate a changeset file without an open database.
///
/// Checks the header, the framing and CRC of every block, the block count,
/// and that the embedded version blob is the revision the header names.
pub fn check_changeset(path: &Path) -> Result<ChangesetHeader> {
    let changeset = ChangesetReader::open(path)?.read_changeset()?;
    let version = VersionSnapshot::decode(&changeset.version_blob)?;
    if version.revision != changeset.header.new_revision {
        return Err(GlassError::format(
            "changeset",
            format!(
                "version block is revision {}, header says {}",
                version.revision, changeset.header.new_revision
            ),
        ));
    }
    Ok(changeset.header)
}
