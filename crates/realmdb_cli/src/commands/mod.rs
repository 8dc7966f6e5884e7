//! CLI command implementations.

pub mod compact;
pub mod convert;
pub mod delete_files;
pub mod dump_log;
pub mod inspect;
pub mod verify;

use realmdb_core::{Realm, RealmConfig, SchemaMode};
use std::path::Path;

/// Opens an existing realm without changing its schema.
pub fn open_existing(path: &Path, mode: SchemaMode) -> Result<Realm, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No realm found at {}", path.display()).into());
    }
    Ok(Realm::open(RealmConfig::new(path).schema_mode(mode))?)
}

/// Renders a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
