//! Inspect command implementation.

use super::{format_size, open_existing};
use realmdb_core::{LogEntry, Realm, SchemaMode};
use serde::Serialize;
use std::path::Path;

/// Realm inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Realm path.
    pub path: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Bytes covered by complete log records.
    pub valid_size: u64,
    /// Snapshot records in the log.
    pub snapshot_records: usize,
    /// Commit records in the log.
    pub commit_records: usize,
    /// Version the file is at.
    pub version: Option<String>,
    /// Stored schema version.
    pub schema_version: Option<u64>,
    /// Per-class statistics.
    pub classes: Vec<ClassStats>,
}

/// Statistics for a single class.
#[derive(Debug, Serialize)]
pub struct ClassStats {
    /// Class name.
    pub name: String,
    /// Kind of class.
    pub kind: String,
    /// Number of objects.
    pub objects: usize,
    /// Primary key property.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    /// Properties as `name: type` (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<String>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_properties: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(path, show_properties)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Gathers the statistics of the realm at `path`.
pub fn collect(path: &Path, show_properties: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let report = Realm::describe_file(path)?;
    let snapshot_records = report
        .entries
        .iter()
        .filter(|e| matches!(e, LogEntry::Snapshot { .. }))
        .count();

    let realm = open_existing(path, SchemaMode::ReadOnly)?;
    let schema = realm.schema()?;
    let mut classes = Vec::with_capacity(schema.len());
    for class in schema.iter() {
        let properties = show_properties.then(|| {
            class
                .persisted_properties
                .iter()
                .map(|p| format!("{}: {}", p.name, p.property_type))
                .collect()
        });
        classes.push(ClassStats {
            name: class.name.clone(),
            kind: format!("{:?}", class.object_type),
            objects: realm.find_all(&class.name)?.count()?,
            primary_key: class.primary_key.clone(),
            properties,
        });
    }
    let result = InspectResult {
        path: path.display().to_string(),
        file_size: report.total_len,
        valid_size: report.valid_len,
        snapshot_records,
        commit_records: report.entries.len() - snapshot_records,
        version: realm.version_id()?.map(|v| v.to_string()),
        schema_version: realm.schema_version()?,
        classes,
    };
    realm.close()?;
    Ok(result)
}

fn print_text_output(result: &InspectResult) {
    println!("Realm Inspection");
    println!("================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Storage:");
    println!("  File size:   {}", format_size(result.file_size));
    println!("  Valid bytes: {}", format_size(result.valid_size));
    println!("  Snapshots:   {}", result.snapshot_records);
    println!("  Commits:     {}", result.commit_records);
    println!();
    println!(
        "Version:        {}",
        result.version.as_deref().unwrap_or("none")
    );
    match result.schema_version {
        Some(v) => println!("Schema version: {v}"),
        None => println!("Schema version: none"),
    }
    println!();
    println!("Classes:");
    for class in &result.classes {
        let pk = class
            .primary_key
            .as_deref()
            .map(|pk| format!(", primary key '{pk}'"))
            .unwrap_or_default();
        println!("  {} ({}{}): {} objects", class.name, class.kind, pk, class.objects);
        for property in class.properties.iter().flatten() {
            println!("    {property}");
        }
    }
}
