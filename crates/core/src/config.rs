//! Global configuration for glassdb.
//!
//! On-disk format constants, block size limits, and file names are compile-time
//! constants. Per-database settings live in [`DatabaseConfig`] and per-commit
//! durability options in [`CommitFlags`].

use crate::error::{GlassError, Result};
use serde::{Deserialize, Serialize};

/// Smallest permitted table block size in bytes.
pub const MIN_BLOCKSIZE: u32 = 2048;

/// Largest permitted table block size in bytes.
pub const MAX_BLOCKSIZE: u32 = 65536;

/// Block size used when a database is created without an explicit setting.
pub const DEFAULT_BLOCKSIZE: u32 = 8192;

/// Block sizes are stored shifted right by this many bits.
///
/// Every legal block size is a power of two no smaller than `MIN_BLOCKSIZE`,
/// so the low 11 bits are always zero.
pub const BLOCKSIZE_SHIFT: u32 = 11;

/// Default minimum record size at which tables attempt compression.
///
/// Must be 0 (compression disabled) or at least 4.
pub const DEFAULT_COMPRESS_MIN: u32 = 4;

/// Longest term (in bytes) the termlist encoding can represent.
pub const MAX_TERM_LENGTH: usize = 245;

/// Name of the version file inside a database directory.
pub const VERSION_FILE_NAME: &str = "iamglass";

/// Name of the side file a new version is staged in before being renamed
/// over [`VERSION_FILE_NAME`].
pub const VERSION_TMP_FILE_NAME: &str = "v.tmp";

/// Name of the container file used by single-file databases.
pub const SINGLE_FILE_NAME: &str = "glass.db";

/// Magic bytes at the start of every version blob.
pub const VERSION_MAGIC: &[u8; 12] = b"\x0f\x0dGlassIndex";

/// Version file format number, stored big-endian after [`VERSION_MAGIC`].
pub const VERSION_FORMAT: u16 = 1;

/// Magic bytes preceding the CRC32 footer of a version blob.
pub const VERSION_CRC_MAGIC: &[u8; 4] = b"GCR1";

/// Magic bytes identifying a single-file pointer slot.
pub const SLOT_MAGIC: &[u8; 4] = b"GSLT";

/// Path stem for changeset files; revision N is stored in `changes.N`.
pub const CHANGES_STEM: &str = "changes";

/// Magic bytes at the start of every changeset file.
pub const CHANGES_MAGIC: &[u8; 12] = b"GlassChanges";

/// Changeset file format number.
pub const CHANGES_FORMAT: u8 = 1;

/// Default number of changesets retained. 0 = changesets disabled.
pub const DEFAULT_MAX_CHANGESETS: u64 = 0;

/// Maximum size of a single changeset block (256 MB safety limit).
pub const MAX_CHANGESET_BLOCK_BYTES: u32 = 256 * 1024 * 1024;

/// Maximum size of a version blob accepted by `read()` (16 MB safety limit).
pub const MAX_VERSION_BLOB_BYTES: u64 = 16 * 1024 * 1024;

/// How hard a commit pushes data to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Flush file data (`fdatasync`).
    #[default]
    Normal,
    /// Flush file data and metadata (`fsync`).
    Full,
    /// Skip flushing entirely. Crash consistency is not guaranteed.
    None,
}

/// Options passed to each step of a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFlags {
    pub sync: SyncMode,
    /// The commit modified tables in place. Changesets produced by such a
    /// commit must not be applied to a live replica.
    pub dangerous: bool,
}

impl CommitFlags {
    /// Flags for a commit which skips every `fsync`.
    pub fn no_sync() -> Self {
        Self {
            sync: SyncMode::None,
            dangerous: false,
        }
    }
}

/// Per-database settings chosen at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Block size for every table.
    pub blocksize: u32,
    /// Compression threshold for every table (0 or >= 4).
    pub compress_min: u32,
    /// Number of changesets to keep. 0 disables changeset generation.
    pub max_changesets: u64,
    /// Store the version data inside a single file instead of a directory.
    pub single_file: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            blocksize: DEFAULT_BLOCKSIZE,
            compress_min: DEFAULT_COMPRESS_MIN,
            max_changesets: DEFAULT_MAX_CHANGESETS,
            single_file: false,
        }
    }
}

impl DatabaseConfig {
    /// Check that the block size and compression threshold are legal.
    pub fn validate(&self) -> Result<()> {
        check_blocksize(self.blocksize)?;
        check_compress_min(self.compress_min)
    }
}

/// A block size must be a power of two in `[MIN_BLOCKSIZE, MAX_BLOCKSIZE]`.
pub fn check_blocksize(blocksize: u32) -> Result<()> {
    if !(MIN_BLOCKSIZE..=MAX_BLOCKSIZE).contains(&blocksize) || !blocksize.is_power_of_two() {
        return Err(GlassError::Consistency(format!(
            "blocksize {} must be a power of two between {} and {}",
            blocksize, MIN_BLOCKSIZE, MAX_BLOCKSIZE
        )));
    }
    Ok(())
}

/// A compression threshold is either 0 or at least 4.
pub fn check_compress_min(compress_min: u32) -> Result<()> {
    if compress_min != 0 && compress_min < 4 {
        return Err(GlassError::Consistency(format!(
            "compress_min {} must be 0 or at least 4",
            compress_min
        )));
    }
    Ok(())
}
