//! Change bus: publish/subscribe dispatch of committed change sets.
//!
//! A single dispatch worker drains a FIFO channel, so delivery order across
//! all listeners matches publish order globally, even across workspaces.
//! Publishing never blocks on listener execution. Each published change set
//! carries a snapshot of the listener list taken at publish time, which is
//! what makes late registration well-defined: a listener registered after a
//! publish never sees that change set.

use crate::changes::ChangeSet;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Observer callback for committed change sets.
pub trait ChangeSetListener: Send + Sync {
    fn notify(&self, change_set: &ChangeSet);
}

struct Dispatch {
    change_set: ChangeSet,
    listeners: Vec<Arc<dyn ChangeSetListener>>,
}

/// In-process change set dispatcher.
pub struct ChangeBus {
    listeners: RwLock<Vec<Arc<dyn ChangeSetListener>>>,
    sender: Mutex<Option<mpsc::Sender<Dispatch>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Dispatch>();
        let worker = std::thread::Builder::new()
            .name("grove-change-bus".to_string())
            .spawn(move || {
                // The loop ends when the sender is dropped at shutdown,
                // after every already-published change set has been drained.
                for dispatch in rx {
                    trace!(
                        workspace = dispatch.change_set.workspace(),
                        changes = dispatch.change_set.len(),
                        listeners = dispatch.listeners.len(),
                        "Dispatching change set"
                    );
                    for listener in &dispatch.listeners {
                        listener.notify(&dispatch.change_set);
                    }
                }
                debug!("Change bus dispatch worker stopped");
            })
            .ok();

        ChangeBus {
            listeners: RwLock::new(Vec::new()),
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a listener. Returns false (and does nothing) if the same
    /// listener is already registered; listener identity is `Arc` pointer
    /// identity.
    pub fn register(&self, listener: Arc<dyn ChangeSetListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister a listener. Returns true only if it was present. A
    /// notification already in flight may still be delivered to it.
    pub fn unregister(&self, listener: &Arc<dyn ChangeSetListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Publish a change set to every currently-registered listener.
    ///
    /// Dispatch is asynchronous: this call enqueues and returns without
    /// waiting for listener execution.
    ///
    /// # Panics
    ///
    /// Panics if the bus has been shut down. Holding a bus reference past
    /// teardown is a programmer error, not a recoverable condition.
    pub fn notify(&self, change_set: ChangeSet) {
        if self.shut_down.load(Ordering::SeqCst) {
            panic!("notify called on a change bus that has been shut down");
        }
        let listeners = self.listeners.read().clone();
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => {
                // A send can only fail if the worker died; treat it like
                // notifying a torn-down bus.
                if tx
                    .send(Dispatch {
                        change_set,
                        listeners,
                    })
                    .is_err()
                {
                    panic!("change bus dispatch worker is no longer running");
                }
            }
            None => panic!("notify called on a change bus that has been shut down"),
        }
    }

    /// Stop the dispatch worker after draining everything already published.
    /// Idempotent; any notify() after this panics.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender ends the worker's receive loop once the
        // queue is empty.
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        debug!("Change bus shut down");
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChangeBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}
