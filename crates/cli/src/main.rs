use clap::{Parser, Subcommand};
use glassdb_core::config::{CommitFlags, DatabaseConfig, SyncMode};
use glassdb_core::storage::{
    changeset_path, check_changeset, list_changesets, GlassDatabase, VersionFile, VersionLocation,
};
use glassdb_core::Revision;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glassdb", about = "Inspect, validate and replay glass databases")]
struct Args {
    /// Database directory
    #[arg(short, long, env = "GLASSDB_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Log as JSON lines instead of plain text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty database at revision 0
    Create {
        /// JSON file with database settings; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Table block size in bytes
        #[arg(long)]
        blocksize: Option<u32>,

        /// Number of changesets to retain (0 = none)
        #[arg(long)]
        max_changesets: Option<u64>,

        /// Keep version records in a single container file
        #[arg(long, default_value_t = false)]
        single_file: bool,
    },
    /// Print the current revision, table roots and statistics as JSON
    Inspect,
    /// Validate a changeset file
    CheckChangeset { path: PathBuf },
    /// List the changesets retained in the data directory
    ListChangesets,
    /// Bring the database in --data-dir forward using changesets
    Replay {
        /// Directory holding changesets of the primary; every newer one is applied
        #[arg(long)]
        source: Option<PathBuf>,

        /// Changeset files to apply, in order
        paths: Vec<PathBuf>,

        /// Skip fsync while installing revisions
        #[arg(long, default_value_t = false)]
        no_sync: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::from_default_env()
        .add_directive("glassdb_core=info".parse().expect("valid directive literal"))
        .add_directive("glassdb_cli=info".parse().expect("valid directive literal"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.json);

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn run(args: Args) -> CliResult<ExitCode> {
    let dir = args.data_dir;
    match args.command {
        Command::Create {
            config,
            blocksize,
            max_changesets,
            single_file,
        } => {
            let mut settings = match config {
                Some(path) => serde_json::from_slice(&std::fs::read(&path)?)?,
                None => DatabaseConfig::default(),
            };
            if let Some(blocksize) = blocksize {
                settings.blocksize = blocksize;
            }
            if let Some(max_changesets) = max_changesets {
                settings.max_changesets = max_changesets;
            }
            settings.single_file |= single_file;
            let db = GlassDatabase::create(&dir, &settings)?;
            println!("{}", db.version().uuid_string());
        }
        Command::Inspect => inspect(&dir)?,
        Command::CheckChangeset { path } => match check_changeset(&path) {
            Ok(header) => println!("{}", serde_json::to_string_pretty(&header)?),
            Err(e) => {
                eprintln!("{:?}: {}", path, e);
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::ListChangesets => {
            for revision in list_changesets(&dir)? {
                println!("{}", changeset_path(&dir, revision).display());
            }
        }
        Command::Replay {
            source,
            paths,
            no_sync,
        } => {
            let flags = if no_sync {
                CommitFlags::no_sync()
            } else {
                CommitFlags {
                    sync: SyncMode::Full,
                    ..CommitFlags::default()
                }
            };
            let revision = replay(&dir, source.as_deref(), &paths, flags)?;
            println!("{}", revision);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn inspect(dir: &Path) -> CliResult<()> {
    let version = VersionFile::read(VersionLocation::detect(dir)?)?;
    let report = serde_json::json!({
        "uuid": version.uuid_string(),
        "single_file": version.single_file(),
        "offset": version.offset(),
        "snapshot": version.snapshot(),
        "changesets": list_changesets(dir)?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn replay(
    dir: &Path,
    source: Option<&Path>,
    paths: &[PathBuf],
    flags: CommitFlags,
) -> CliResult<Revision> {
    let mut db = GlassDatabase::open(dir, &DatabaseConfig::default())?;
    for path in paths {
        db.apply_changeset(path, flags)?;
    }

    if let Some(source) = source {
        for revision in list_changesets(source)? {
            if revision <= db.revision() {
                continue;
            }
            if revision != db.revision() + 1 {
                return Err(format!(
                    "changeset for revision {} is no longer available in {:?}; a full copy is needed",
                    db.revision() + 1,
                    source
                )
                .into());
            }
            db.apply_changeset(&changeset_path(source, revision), flags)?;
        }
    }

    tracing::info!("Replica at revision {}", db.revision());
    Ok(db.revision())
}
