/*!
Migration reconciliation performed before tables are restored.

The archive's copy of the versions table says which migrations the dumped
schema had. Versions applied live but missing from that list are rolled back,
newest first, so the live schema matches the data about to be loaded.
*/

use std::cmp::Ordering;
use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::codec::{table_entry, ArchiveReader, RecordReader};
use crate::config::MigrateDown;
use crate::store::MigrationRunner;
use crate::Result;

/// What reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub rolled_back: Vec<String>,
    /// Versions the runner could not undo, left in place
    pub irreversible: Vec<String>,
    pub reset: bool,
}

/// Versions recorded in the archive's dump of `versions_table`.
///
/// `None` when the archive holds no such entry.
pub fn archived_versions(reader: &ArchiveReader, versions_table: &str) -> Result<Option<Vec<String>>> {
    reader.with_entry(&table_entry(versions_table), |input| {
        let mut records = RecordReader::new(input)?;
        let mut versions = Vec::new();
        while let Some(row) = records.next_row()? {
            if let Some(version) = row.first().filter(|v| !v.is_null()) {
                versions.push(version.to_string());
            }
        }
        Ok(versions)
    })
}

/// Numeric-aware version ordering: a longer digit string is a later version.
fn compare_versions(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Roll back every live version absent from `archived`, newest first.
///
/// Irreversible versions are logged and kept; any other runner error aborts.
pub fn reconcile<M: MigrationRunner + ?Sized>(runner: &M, archived: &[String]) -> Result<MigrationReport> {
    let archived: BTreeSet<&str> = archived.iter().map(String::as_str).collect();
    let mut extra: Vec<String> = runner
        .applied_versions()?
        .into_iter()
        .filter(|v| !archived.contains(v.as_str()))
        .collect();
    extra.sort_by(|a, b| compare_versions(b, a));

    let mut report = MigrationReport::default();
    for version in extra {
        match runner.rollback(&version) {
            Ok(()) => {
                info!(version = %version, "migration rolled back");
                report.rolled_back.push(version);
            }
            Err(e) if e.is_irreversible() => {
                warn!(version = %version, "irreversible migration left in place");
                report.irreversible.push(version);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

/// Bring the live schema in line with the archive according to `mode`.
pub fn migrate_down<M: MigrationRunner + ?Sized>(
    runner: &M,
    reader: &ArchiveReader,
    mode: MigrateDown,
) -> Result<MigrationReport> {
    match mode {
        MigrateDown::Skip => Ok(MigrationReport::default()),
        MigrateDown::Reset => {
            info!("resetting schema");
            runner.reset_schema()?;
            Ok(MigrationReport {
                reset: true,
                ..MigrationReport::default()
            })
        }
        MigrateDown::Reconcile => match archived_versions(reader, runner.versions_table())? {
            Some(archived) => reconcile(runner, &archived),
            None => {
                warn!(
                    table = runner.versions_table(),
                    "archive has no migration versions, skipping reconciliation"
                );
                Ok(MigrationReport::default())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryMigrations, MemoryTableStore};

    fn runner(versions: &[&str]) -> MemoryMigrations {
        let migrations = MemoryMigrations::new(MemoryTableStore::new());
        for version in versions {
            migrations.apply(*version).unwrap();
        }
        migrations
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_extra_versions_roll_back_newest_first() {
        let migrations = runner(&["1", "2", "3", "10"]);
        let report = reconcile(&migrations, &strings(&["1", "2"])).unwrap();
        assert_eq!(report.rolled_back, strings(&["10", "3"]));
        assert_eq!(migrations.rolled_back().unwrap(), strings(&["10", "3"]));
        assert_eq!(migrations.applied_versions().unwrap(), strings(&["1", "2"]));
    }

    #[test]
    fn test_irreversible_version_is_skipped() {
        let migrations = runner(&["1", "2", "3"]);
        migrations.mark_irreversible("3").unwrap();
        let report = reconcile(&migrations, &strings(&["1"])).unwrap();
        assert_eq!(report.irreversible, strings(&["3"]));
        assert_eq!(report.rolled_back, strings(&["2"]));
    }

    #[test]
    fn test_matching_versions_do_nothing() {
        let migrations = runner(&["1", "2"]);
        let report = reconcile(&migrations, &strings(&["1", "2", "3"])).unwrap();
        assert_eq!(report, MigrationReport::default());
    }

    #[test]
    fn test_version_ordering_is_numeric() {
        assert_eq!(compare_versions("9", "10"), Ordering::Less);
        assert_eq!(
            compare_versions("20240102000000", "20240101000000"),
            Ordering::Greater
        );
    }
}
