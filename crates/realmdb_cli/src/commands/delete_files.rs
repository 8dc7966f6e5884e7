//! Delete-files command implementation.

use realmdb_core::Realm;
use std::path::Path;

/// Runs the delete-files command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if Realm::delete_files(path)? {
        println!("✓ Deleted {}", path.display());
    } else {
        println!("No realm at {}; removed leftover auxiliary files", path.display());
    }
    Ok(())
}
