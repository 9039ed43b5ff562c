//! Cross-workspace change bus delivery through a running repository.

use grove::bus::ChangeSetListener;
use grove::changes::ChangeSet;
use grove::config::RepositoryConfiguration;
use grove::repository::Repository;
use grove::value::PropertyValue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct Recorder {
    received: Mutex<Vec<ChangeSet>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Recorder {
            received: Mutex::new(Vec::new()),
        })
    }
}

impl ChangeSetListener for Recorder {
    fn notify(&self, change_set: &ChangeSet) {
        self.received.lock().push(change_set.clone());
    }
}

#[test]
fn saves_across_workspaces_arrive_in_publish_order() {
    let repo = Repository::start(RepositoryConfiguration::default()).unwrap();
    let first = Recorder::new();
    let second = Recorder::new();
    repo.change_bus().register(first.clone());
    repo.change_bus().register(second.clone());

    // Interleave saves across two workspaces from one thread; delivery
    // order must match save order exactly.
    let mut a = repo.login_to("ws-a", "alice", HashMap::new()).unwrap();
    let mut b = repo.login_to("ws-b", "bob", HashMap::new()).unwrap();
    let a_root = a.root_key();
    let b_root = b.root_key();
    for i in 0..20 {
        if i % 2 == 0 {
            a.set_property(&a_root, "seq", PropertyValue::Long(i)).unwrap();
            a.save().unwrap();
        } else {
            b.set_property(&b_root, "seq", PropertyValue::Long(i)).unwrap();
            b.save().unwrap();
        }
    }
    repo.shutdown();

    let first = first.received.lock();
    let second = second.received.lock();
    assert_eq!(first.len(), 20);
    let expected: Vec<Option<&str>> = (0..20)
        .map(|i| if i % 2 == 0 { Some("ws-a") } else { Some("ws-b") })
        .collect();
    let observed: Vec<Option<&str>> = first.iter().map(|s| s.workspace()).collect();
    assert_eq!(observed, expected);

    // Every listener sees the identical sequence.
    assert_eq!(first.len(), second.len());
    for (x, y) in first.iter().zip(second.iter()) {
        assert_eq!(x, y);
    }
}

#[test]
fn listener_registered_mid_stream_misses_earlier_sets() {
    let repo = Repository::start(RepositoryConfiguration::default()).unwrap();
    let early = Recorder::new();
    repo.change_bus().register(early.clone());

    let mut session = repo.login("alice").unwrap();
    let root = session.root_key();
    session
        .set_property(&root, "n", PropertyValue::Long(1))
        .unwrap();
    session.save().unwrap();

    let late = Recorder::new();
    repo.change_bus().register(late.clone());

    session
        .set_property(&root, "n", PropertyValue::Long(2))
        .unwrap();
    session.save().unwrap();
    repo.shutdown();

    assert_eq!(early.received.lock().len(), 2);
    assert_eq!(late.received.lock().len(), 1);
}

#[test]
fn unregistered_listener_stops_receiving() {
    let repo = Repository::start(RepositoryConfiguration::default()).unwrap();
    let recorder = Recorder::new();
    let listener: Arc<dyn ChangeSetListener> = recorder.clone();
    repo.change_bus().register(listener.clone());

    let mut session = repo.login("alice").unwrap();
    let root = session.root_key();
    session
        .set_property(&root, "n", PropertyValue::Long(1))
        .unwrap();
    session.save().unwrap();

    repo.change_bus().unregister(&listener);
    session
        .set_property(&root, "n", PropertyValue::Long(2))
        .unwrap();
    session.save().unwrap();
    repo.shutdown();

    assert_eq!(recorder.received.lock().len(), 1);
}
