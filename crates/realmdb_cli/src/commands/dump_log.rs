//! Dump log command implementation.

use realmdb_core::{LogEntry, Realm};
use serde::Serialize;
use std::path::Path;

/// Log record representation for output.
#[derive(Debug, Serialize)]
pub struct LogRecordInfo {
    /// Offset in the realm file.
    pub offset: u64,
    /// Record type.
    pub record_type: &'static str,
    /// Version the record produces.
    pub version: String,
    /// Producer of a commit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Instruction tags of a commit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<Vec<&'static str>>,
    /// Class count of a snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classes: Option<usize>,
    /// Object count of a snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects: Option<usize>,
}

impl From<LogEntry> for LogRecordInfo {
    fn from(entry: LogEntry) -> Self {
        match entry {
            LogEntry::Snapshot {
                offset,
                version,
                classes,
                objects,
            } => Self {
                offset,
                record_type: "SNAPSHOT",
                version: version.to_string(),
                origin: None,
                instructions: None,
                classes: Some(classes),
                objects: Some(objects),
            },
            LogEntry::Commit {
                offset,
                version,
                origin,
                instructions,
            } => Self {
                offset,
                record_type: "COMMIT",
                version: version.to_string(),
                origin: Some(format!("{origin:?}")),
                instructions: Some(instructions),
                classes: None,
                objects: None,
            },
        }
    }
}

/// Runs the dump-log command.
pub fn run(path: &Path, limit: Option<usize>, start_offset: u64, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (records, tail_error) = read_records(path, start_offset, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
            if let Some(error) = tail_error {
                println!();
                println!("Log ends early: {error}");
            }
        }
    }

    Ok(())
}

/// Records at or after `start_offset`, at most `limit` of them, and why the
/// scan stopped early if it did.
pub fn read_records(
    path: &Path,
    start_offset: u64,
    limit: Option<usize>,
) -> Result<(Vec<LogRecordInfo>, Option<String>), Box<dyn std::error::Error>> {
    let report = Realm::describe_file(path)?;
    let records = report
        .entries
        .into_iter()
        .map(LogRecordInfo::from)
        .filter(|r| r.offset >= start_offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    Ok((records, report.tail_error))
}

fn print_text_output(records: &[LogRecordInfo]) {
    println!("{:>10}  {:<10}  {:<16}  DETAILS", "OFFSET", "TYPE", "VERSION");
    println!("{}", "-".repeat(64));

    for record in records {
        let details = match (&record.instructions, record.classes, record.objects) {
            (Some(instructions), _, _) => format!(
                "{} {}",
                record.origin.as_deref().unwrap_or_default(),
                instructions.join(" ")
            ),
            (None, Some(classes), Some(objects)) => format!("{classes} classes, {objects} objects"),
            _ => String::new(),
        };
        println!(
            "{:>10}  {:<10}  {:<16}  {}",
            record.offset, record.record_type, record.version, details
        );
    }

    println!();
    println!("Total: {} records", records.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmdb_testkit::{add_person, person_schema, TestRealm};

    #[test]
    fn records_start_with_a_snapshot() {
        let test = TestRealm::open(person_schema()).unwrap();
        test.write(|realm| add_person(realm, 1, "Ada", 36).map(|_| ()))
            .unwrap();
        let dir = test.into_dir();
        let path = dir.path().join(TestRealm::FILE_NAME);

        let (records, tail) = read_records(&path, 0, None).unwrap();
        assert!(tail.is_none());
        assert_eq!(records[0].record_type, "SNAPSHOT");
        assert_eq!(records[0].offset, 0);
        let last = records.last().unwrap();
        assert_eq!(last.record_type, "COMMIT");
        assert!(last.instructions.as_ref().is_some_and(|i| !i.is_empty()));

        let (limited, _) = read_records(&path, 1, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
        assert!(limited[0].offset >= 1);
    }
}
