//! Backup and restore against a disk-backed repository.

use grove::backup::BackupOptions;
use grove::config::RepositoryConfiguration;
use grove::repository::Repository;
use grove::store::DocumentStore;
use grove::value::PropertyValue;
use tempfile::tempdir;

fn disk_config(path: &std::path::Path) -> RepositoryConfiguration {
    let mut config = RepositoryConfiguration::default();
    config.storage_path = Some(path.to_path_buf());
    config
}

#[test]
fn backup_survives_a_store_wipe() {
    let storage = tempdir().unwrap();
    let backups = tempdir().unwrap();

    let repo = Repository::start(disk_config(storage.path())).unwrap();
    let mut session = repo.login("admin").unwrap();
    let root = session.root_key();
    let mut keys = Vec::new();
    for i in 0..250 {
        let node = session
            .create_node(&root, &format!("doc-{}", i), "nt:file")
            .unwrap();
        session
            .set_property(node.key(), "index", PropertyValue::Long(i))
            .unwrap();
        keys.push(node.key().clone());
    }
    session.save().unwrap();

    let problems = repo.backup(backups.path(), &BackupOptions::default());
    assert!(problems.is_empty(), "{:?}", problems.messages());

    // Wipe everything, then restore.
    repo.store().clear().unwrap();
    let problems = repo.restore(backups.path());
    assert!(problems.is_empty(), "{:?}", problems.messages());

    let mut check = repo.login("admin").unwrap();
    for (i, key) in keys.iter().enumerate() {
        let node = check.find_node(key).unwrap().unwrap();
        assert_eq!(
            node.property("index").unwrap().as_long().unwrap(),
            i as i64
        );
    }
    let root_node = check.find_node(&root).unwrap().unwrap();
    assert_eq!(root_node.document().children.len(), 250);
}

#[test]
fn uncompressed_multi_file_backup_round_trips() {
    let backups = tempdir().unwrap();
    let repo = Repository::start(RepositoryConfiguration::default()).unwrap();
    let mut session = repo.login("admin").unwrap();
    let root = session.root_key();
    for i in 0..10 {
        session
            .create_node(&root, &format!("n{}", i), "nt:unstructured")
            .unwrap();
    }
    session.save().unwrap();

    let options = BackupOptions {
        documents_per_file: 4,
        compress: false,
    };
    let problems = repo.backup(backups.path(), &options);
    assert!(problems.is_empty());

    // 11 documents at 4 per file gives 3 numbered plain files.
    let mut names: Vec<String> = std::fs::read_dir(backups.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["documents-0", "documents-1", "documents-2"]);

    let restored = Repository::start(RepositoryConfiguration::default()).unwrap();
    let problems = restored.restore(backups.path());
    assert!(problems.is_empty());
    let mut check = restored.login("admin").unwrap();
    let root_node = check.find_node(&root).unwrap().unwrap();
    assert_eq!(root_node.document().children.len(), 10);
}

#[test]
fn restore_into_populated_repository_replaces_content() {
    let backups = tempdir().unwrap();

    let source = Repository::start(RepositoryConfiguration::default()).unwrap();
    let mut session = source.login("admin").unwrap();
    let root = session.root_key();
    let kept = session.create_node(&root, "kept", "nt:file").unwrap();
    session.save().unwrap();
    let problems = source.backup(backups.path(), &BackupOptions::default());
    assert!(problems.is_empty());

    // A repository with unrelated content loses it on restore.
    let target = Repository::start(RepositoryConfiguration::default()).unwrap();
    let mut session = target.login("admin").unwrap();
    let doomed = session
        .create_node(&session.root_key(), "doomed", "nt:file")
        .unwrap();
    let doomed_key = doomed.key().clone();
    session.save().unwrap();
    drop(session);

    let problems = target.restore(backups.path());
    assert!(problems.is_empty());

    let mut check = target.login("admin").unwrap();
    assert!(check.find_node(kept.key()).unwrap().is_some());
    assert!(check.find_node(&doomed_key).unwrap().is_none());
}
