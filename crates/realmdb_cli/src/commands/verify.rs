//! Verify command implementation.

use super::open_existing;
use realmdb_core::{Realm, SchemaMode};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of log records checked.
    pub records_checked: usize,
    /// Number of objects read back.
    pub objects_checked: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Whether no problem was found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying realm at {}", path.display());
    println!();

    let result = check(path)?;
    println!(
        "  records checked: {}, objects checked: {}",
        result.records_checked, result.objects_checked
    );
    for error in &result.errors {
        println!("    ERROR: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Realm verification passed");
        Ok(())
    } else {
        println!("✗ Realm verification failed");
        Err("Verification failed".into())
    }
}

/// Scans the log of the realm at `path` and reads back every object.
pub fn check(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    let report = Realm::describe_file(path)?;
    result.records_checked = report.entries.len();
    if let Some(error) = &report.tail_error {
        result
            .errors
            .push(format!("log stops at offset {}: {error}", report.valid_len));
    }
    if report.valid_len != report.total_len {
        result.errors.push(format!(
            "{} trailing bytes after the last complete record",
            report.total_len - report.valid_len
        ));
    }
    if report.entries.is_empty() {
        result.errors.push("log has no records".to_owned());
        return Ok(result);
    }

    let realm = match open_existing(path, SchemaMode::ReadOnly) {
        Ok(realm) => realm,
        Err(err) => {
            result.errors.push(format!("cannot open realm: {err}"));
            return Ok(result);
        }
    };
    let schema = realm.schema()?;
    for class in schema.iter() {
        let objects = realm.find_all(&class.name)?;
        for index in 0..objects.count()? {
            result.objects_checked += 1;
            if let Err(err) = objects.get_object(index).and_then(|o| o.describe()) {
                result
                    .errors
                    .push(format!("{} object {index} is unreadable: {err}", class.name));
            }
        }
    }
    realm.close()?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmdb_testkit::{add_person, person_schema, TestRealm};
    use std::io::Write;

    #[test]
    fn healthy_realms_pass() {
        let test = TestRealm::open(person_schema()).unwrap();
        test.write(|realm| add_person(realm, 1, "Ada", 36).map(|_| ()))
            .unwrap();
        let dir = test.into_dir();
        let result = check(&dir.path().join(TestRealm::FILE_NAME)).unwrap();
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.objects_checked, 1);
    }

    #[test]
    fn torn_tails_are_reported() {
        let test = TestRealm::open(person_schema()).unwrap();
        let dir = test.into_dir();
        let path = dir.path().join(TestRealm::FILE_NAME);
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"garbage")
            .unwrap();
        let result = check(&path).unwrap();
        assert!(!result.is_ok());
    }
}
