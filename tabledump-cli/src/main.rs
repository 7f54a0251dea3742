/*!
Tabledump CLI - create, restore, list and prune database snapshot archives.

Every option is read once here (flags first, then the matching environment
variable) and turned into a `DumpConfig` for the core engine.
*/

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use tabled::{Table, Tabled};
use tabledump_core::observability::{init_observability_with, DEFAULT_DIRECTIVE};
use tabledump_core::snapshot::{list, parse_leave, prune_candidates};
use tabledump_core::{
    prune, DumpConfig, MigrateDown, SelectOptions, Snapshot, SnapshotReader, SnapshotWriter,
    SqliteTableStore,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tabledump")]
#[command(about = "Versioned, taggable snapshots of a SQLite database")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Snapshot directory
    #[arg(short, long, global = true, env = "DUMP_DIR", default_value = "dump")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct Selection {
    /// Substring the snapshot name must contain
    #[arg(long, env = "LIKE")]
    like: Option<String>,

    /// Tag filter: `a` any of, `+a` required, `-a` forbidden
    #[arg(long, env = "TAGS")]
    tags: Option<String>,
}

impl Selection {
    fn options(&self) -> SelectOptions {
        SelectOptions {
            like: self.like.clone(),
            tags: self.tags.clone(),
            all: false,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot a database
    Create {
        /// SQLite database file
        #[arg(long, env = "DATABASE")]
        db: PathBuf,
        /// Free text description
        #[arg(long, env = "DESC", default_value = "")]
        desc: String,
        /// Comma separated tags
        #[arg(long, env = "TAGS", default_value = "")]
        tags: String,
        /// Tables to dump (`a,b` or `-a,b`)
        #[arg(long, env = "TABLES")]
        tables: Option<String>,
        /// Asset directories, comma separated
        #[arg(long, env = "ASSETS", value_delimiter = ',')]
        assets: Vec<String>,
        /// Directory asset paths are relative to
        #[arg(long, default_value = ".")]
        asset_base: PathBuf,
        /// Pack assets into a nested assets.tar
        #[arg(long)]
        legacy_assets_tar: bool,
    },
    /// Restore the newest matching snapshot
    Restore {
        /// SQLite database file
        #[arg(long, env = "DATABASE")]
        db: PathBuf,
        /// Snapshot name fragment, e.g. a timestamp
        version: Option<String>,
        #[command(flatten)]
        selection: Selection,
        /// Recreate the schema from the snapshot
        #[arg(
            long,
            env = "RESTORE_SCHEMA",
            default_value_t = true,
            action = clap::ArgAction::Set,
            value_parser = clap::builder::BoolishValueParser::new()
        )]
        restore_schema: bool,
        /// Tables to restore (`a,b` or `-a,b`)
        #[arg(long, env = "RESTORE_TABLES")]
        restore_tables: Option<String>,
        /// Asset roots to restore (`a,b` or `-a,b`)
        #[arg(long, env = "RESTORE_ASSETS")]
        restore_assets: Option<String>,
        /// `reset`, `no`, or anything else to roll back extra migrations
        #[arg(long, env = "MIGRATE_DOWN", default_value = "reconcile")]
        migrate_down: String,
        /// Abort a table on the first row that cannot be inserted
        #[arg(long)]
        strict_rows: bool,
        /// Directory asset paths are relative to
        #[arg(long, default_value = ".")]
        asset_base: PathBuf,
    },
    /// List snapshots
    Versions {
        #[command(flatten)]
        selection: Selection,
        /// Include unfinished snapshots
        #[arg(short, long)]
        all: bool,
    },
    /// Delete old snapshots, keeping the newest ones
    Cleanup {
        #[command(flatten)]
        selection: Selection,
        /// How many finalized snapshots to keep, or `none`
        #[arg(long, env = "LEAVE", default_value = "5")]
        leave: String,
        /// Only print what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Tabled)]
struct SnapshotInfo {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Description")]
    description: String,
    #[tabled(rename = "Tags")]
    tags: String,
    #[tabled(rename = "Size")]
    size: String,
}

impl From<&Snapshot> for SnapshotInfo {
    fn from(snapshot: &Snapshot) -> Self {
        SnapshotInfo {
            name: snapshot.name(),
            created: snapshot
                .timestamp()
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string()),
            description: snapshot.description().to_string(),
            tags: snapshot.tags().join(","),
            size: snapshot
                .size()
                .map(format_size)
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json)?;

    match cli.command {
        Commands::Create {
            db,
            desc,
            tags,
            tables,
            assets,
            asset_base,
            legacy_assets_tar,
        } => {
            let mut config = DumpConfig::new(&cli.dir);
            config.write.description = desc;
            config.write.tags = tags;
            config.write.tables = tables;
            config.write.assets = assets.into_iter().filter(|a| !a.trim().is_empty()).collect();
            config.write.asset_base = asset_base;
            config.write.legacy_assets_tar = legacy_assets_tar;
            create_snapshot(&db, &config)?
        }
        Commands::Restore {
            db,
            version,
            selection,
            restore_schema,
            restore_tables,
            restore_assets,
            migrate_down,
            strict_rows,
            asset_base,
        } => {
            let mut select = selection.options();
            if version.is_some() {
                select.like = version;
            }
            let mut config = DumpConfig::new(&cli.dir).with_select(select);
            config.restore.restore_schema = restore_schema;
            config.restore.tables = restore_tables;
            config.restore.assets = restore_assets;
            config.restore.migrate_down = migrate_down.parse::<MigrateDown>()?;
            config.restore.strict_rows = strict_rows;
            config.write.asset_base = asset_base;
            restore_snapshot(&db, &config)?
        }
        Commands::Versions { selection, all } => {
            let config = DumpConfig::new(&cli.dir).with_select(selection.options().all(all));
            list_snapshots(&config)?
        }
        Commands::Cleanup {
            selection,
            leave,
            dry_run,
        } => {
            let mut config = DumpConfig::new(&cli.dir).with_select(selection.options());
            config.leave = parse_leave(&leave)?;
            cleanup_snapshots(&config, dry_run)?
        }
    }

    #[cfg(feature = "metrics")]
    report_metrics()?;

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<(), anyhow::Error> {
    let directive = if verbose { "tabledump=debug" } else { DEFAULT_DIRECTIVE };
    init_observability_with(json, directive)?;
    Ok(())
}

#[cfg(feature = "metrics")]
fn report_metrics() -> Result<(), anyhow::Error> {
    if let Some(metrics) = tabledump_core::observability::DumpMetrics::global() {
        tracing::debug!("metrics:\n{}", metrics.gather_metrics()?);
    }
    Ok(())
}

fn create_snapshot(db: &Path, config: &DumpConfig) -> Result<(), anyhow::Error> {
    let store = SqliteTableStore::open(db)?;
    let report = SnapshotWriter::new(&store, config).write()?;
    println!("{}", report.snapshot.path().display());
    Ok(())
}

fn restore_snapshot(db: &Path, config: &DumpConfig) -> Result<(), anyhow::Error> {
    let store = SqliteTableStore::open(db)?;
    let migrations = store.migrations();
    let report = SnapshotReader::new(&store, &migrations, config).restore_latest()?;

    for version in &report.migrations.irreversible {
        warn!("migration {version} could not be rolled back");
    }
    for table in &report.tables {
        for rejected in &table.rejected {
            warn!(
                "{}: row {} rejected: {}",
                table.table, rejected.row, rejected.reason
            );
        }
    }
    println!(
        "Restored {} ({} rows, {} rejected)",
        report.snapshot,
        report.rows_restored(),
        report.rows_rejected()
    );
    Ok(())
}

fn list_snapshots(config: &DumpConfig) -> Result<(), anyhow::Error> {
    info!("Listing snapshots in {}", config.dir.display());
    if !config.dir.exists() {
        println!("No snapshot directory found at: {}", config.dir.display());
        return Ok(());
    }

    let snapshots = list(&config.dir, &config.select)?;
    if snapshots.is_empty() {
        println!("No snapshots found");
        return Ok(());
    }
    let rows: Vec<SnapshotInfo> = snapshots.iter().map(SnapshotInfo::from).collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn cleanup_snapshots(config: &DumpConfig, dry_run: bool) -> Result<(), anyhow::Error> {
    if dry_run {
        for snapshot in prune_candidates(&config.dir, &config.select, config.leave)? {
            println!("would delete {}", snapshot);
        }
        return Ok(());
    }

    let deleted = prune(&config.dir, &config.select, config.leave)?;
    for path in &deleted {
        println!("deleted {}", path.display());
    }
    info!("{} snapshot(s) deleted", deleted.len());
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
