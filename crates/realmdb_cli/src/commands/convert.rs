//! Convert command implementation.

use super::open_existing;
use realmdb_core::{RealmConfig, SchemaMode};
use std::path::Path;

/// Runs the convert command.
pub fn run(path: &Path, target: &Path, merge: bool) -> Result<(), Box<dyn std::error::Error>> {
    convert(path, target, merge)?;
    println!("✓ Wrote {} to {}", path.display(), target.display());
    Ok(())
}

/// Writes the current version of the realm at `path` to `target`.
pub fn convert(path: &Path, target: &Path, merge: bool) -> Result<(), Box<dyn std::error::Error>> {
    let realm = open_existing(path, SchemaMode::ReadOnly)?;
    let result = realm.convert(&RealmConfig::new(target), merge);
    realm.close()?;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmdb_testkit::{add_person, person_schema, TestRealm};

    #[test]
    fn copies_and_merges() {
        let test = TestRealm::open(person_schema()).unwrap();
        test.write(|realm| add_person(realm, 1, "Ada", 36).map(|_| ()))
            .unwrap();
        let dir = test.into_dir();
        let source = dir.path().join(TestRealm::FILE_NAME);
        let target = dir.path().join("copy.realm");

        convert(&source, &target, false).unwrap();
        assert!(convert(&source, &target, false).is_err());
        convert(&source, &target, true).unwrap();

        let result = super::super::inspect::collect(&target, false).unwrap();
        let person = result.classes.iter().find(|c| c.name == "Person").unwrap();
        assert_eq!(person.objects, 1);
    }
}
