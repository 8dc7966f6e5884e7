//! Compact command implementation.

use super::{format_size, open_existing};
use realmdb_core::SchemaMode;
use std::path::Path;

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction, estimated for a dry run.
    pub bytes_after: u64,
    /// Whether the file was rewritten.
    pub compacted: bool,
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting realm at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = compact(path, dry_run)?;
    let saved = stats.bytes_before.saturating_sub(stats.bytes_after);
    println!("  Size before: {}", format_size(stats.bytes_before));
    println!("  Size after:  {}", format_size(stats.bytes_after));
    println!(
        "  Space saved: {} ({:.1}%)",
        format_size(saved),
        if stats.bytes_before > 0 {
            saved as f64 / stats.bytes_before as f64 * 100.0
        } else {
            0.0
        }
    );

    if !dry_run {
        println!();
        if stats.compacted {
            println!("✓ Compaction complete");
        } else {
            println!("Realm is open in another process; nothing was done");
        }
    }

    Ok(())
}

/// Compacts the realm at `path`, or only measures it when `dry_run` is set.
pub fn compact(path: &Path, dry_run: bool) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let realm = open_existing(path, SchemaMode::Automatic)?;
    let (bytes_before, estimate) = realm.compaction_estimate()?;
    if dry_run {
        realm.close()?;
        return Ok(CompactStats {
            bytes_before,
            bytes_after: estimate,
            compacted: false,
        });
    }
    let compacted = realm.compact()?;
    let (bytes_after, _) = realm.compaction_estimate()?;
    realm.close()?;
    tracing::info!(target: "realm", path = %path.display(), bytes_before, bytes_after, compacted, "compacted realm");
    Ok(CompactStats {
        bytes_before,
        bytes_after,
        compacted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmdb_testkit::{add_person, person_schema, TestRealm};

    fn churned() -> tempfile::TempDir {
        let test = TestRealm::open(person_schema()).unwrap();
        for age in 0..20 {
            test.write(|realm| add_person(realm, 1, "Ada", age).map(|_| ()))
                .unwrap();
        }
        test.into_dir()
    }

    #[test]
    fn dry_runs_leave_the_file_alone() {
        let dir = churned();
        let path = dir.path().join(TestRealm::FILE_NAME);
        let before = std::fs::metadata(&path).unwrap().len();
        let stats = compact(&path, true).unwrap();
        assert!(!stats.compacted);
        assert_eq!(stats.bytes_before, before);
        assert!(stats.bytes_after < before);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
    }

    #[test]
    fn compaction_shrinks_the_log() {
        let dir = churned();
        let path = dir.path().join(TestRealm::FILE_NAME);
        let stats = compact(&path, false).unwrap();
        assert!(stats.compacted);
        assert!(stats.bytes_after < stats.bytes_before);
        assert!(super::super::verify::check(&path).unwrap().is_ok());
    }
}
