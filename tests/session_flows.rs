//! End-to-end session flows through a running repository.

use grove::config::RepositoryConfiguration;
use grove::error::RepositoryError;
use grove::repository::Repository;
use grove::value::PropertyValue;
use std::collections::HashMap;

fn start() -> Repository {
    Repository::start(RepositoryConfiguration::default()).unwrap()
}

#[test]
fn create_save_and_read_back_from_second_session() {
    let repo = start();
    let mut writer = repo.login("writer").unwrap();
    let root = writer.root_key();

    let folder = writer.create_node(&root, "docs", "nt:folder").unwrap();
    let file = writer
        .create_node(folder.key(), "readme", "nt:file")
        .unwrap();
    writer
        .set_property(file.key(), "mime", PropertyValue::from("text/plain"))
        .unwrap();
    writer
        .set_property(file.key(), "size", PropertyValue::Long(42))
        .unwrap();
    writer.save().unwrap();

    let mut reader = repo.login("reader").unwrap();
    let seen = reader.find_node(file.key()).unwrap().unwrap();
    assert_eq!(seen.primary_type(), "nt:file");
    assert_eq!(seen.property("mime").unwrap().as_string(), "text/plain");
    assert_eq!(seen.property("size").unwrap().as_long().unwrap(), 42);
    assert_eq!(seen.parent(), Some(folder.key()));
}

#[test]
fn conflicting_saves_resolve_with_refresh_and_retry() {
    let repo = start();
    let mut first = repo.login("first").unwrap();
    let mut second = repo.login("second").unwrap();
    let root = first.root_key();

    first
        .set_property(&root, "counter", PropertyValue::Long(1))
        .unwrap();
    second
        .set_property(&root, "counter", PropertyValue::Long(2))
        .unwrap();

    first.save().unwrap();
    let err = second.save().unwrap_err();
    assert!(matches!(err, RepositoryError::StaleState(_)));
    assert!(err.is_retryable());

    second.refresh(true).unwrap();
    second.save().unwrap();

    let mut observer = repo.login("observer").unwrap();
    let root_node = observer.find_node(&root).unwrap().unwrap();
    assert_eq!(root_node.property("counter").unwrap().as_long().unwrap(), 2);
}

#[test]
fn subtree_removal_is_atomic() {
    let repo = start();
    let mut session = repo.login("admin").unwrap();
    let root = session.root_key();

    let a = session.create_node(&root, "a", "nt:folder").unwrap();
    let b = session.create_node(a.key(), "b", "nt:folder").unwrap();
    let c = session.create_node(b.key(), "c", "nt:file").unwrap();
    session.save().unwrap();

    session.remove_node(a.key()).unwrap();
    session.save().unwrap();

    let mut check = repo.login("admin").unwrap();
    assert!(check.find_node(a.key()).unwrap().is_none());
    assert!(check.find_node(b.key()).unwrap().is_none());
    assert!(check.find_node(c.key()).unwrap().is_none());
    let root_node = check.find_node(&root).unwrap().unwrap();
    assert!(root_node.document().children.is_empty());
}

#[test]
fn user_data_travels_on_the_change_set() {
    use grove::bus::ChangeSetListener;
    use grove::changes::ChangeSet;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recorder(Mutex<Vec<ChangeSet>>);
    impl ChangeSetListener for Recorder {
        fn notify(&self, change_set: &ChangeSet) {
            self.0.lock().push(change_set.clone());
        }
    }

    let repo = start();
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    repo.change_bus().register(recorder.clone());

    let mut user_data = HashMap::new();
    user_data.insert("client".to_string(), "importer".to_string());
    let mut session = repo.login_to("default", "alice", user_data).unwrap();
    let root = session.root_key();
    session
        .set_property(&root, "touched", PropertyValue::Boolean(true))
        .unwrap();
    session.save().unwrap();
    repo.shutdown();

    let received = recorder.0.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].user_id(), "alice");
    assert_eq!(
        received[0].user_data().get("client").map(String::as_str),
        Some("importer")
    );
    assert_eq!(received[0].workspace(), Some("default"));
}

#[test]
fn empty_save_publishes_nothing() {
    use grove::bus::ChangeSetListener;
    use grove::changes::ChangeSet;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Counter(Mutex<Vec<ChangeSet>>);
    impl ChangeSetListener for Counter {
        fn notify(&self, change_set: &ChangeSet) {
            self.0.lock().push(change_set.clone());
        }
    }

    let repo = start();
    let counter = Arc::new(Counter(Mutex::new(Vec::new())));
    repo.change_bus().register(counter.clone());

    let mut session = repo.login("alice").unwrap();
    session.save().unwrap();
    repo.shutdown();
    assert!(counter.0.lock().is_empty());
}
