use std::sync::{Arc, Mutex};

type Subscriber<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// In-process publish/subscribe with synchronous delivery.
///
/// Subscriptions are established once at wiring time; subscribers run on
/// the publisher's thread and must not block.
pub struct Signal<A> {
    subscribers: Mutex<Vec<Subscriber<A>>>,
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<A> Signal<A> {
    pub fn connect(&self, subscriber: impl Fn(&A) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Arc::new(subscriber));
    }

    /// The subscriber list is snapshotted first so a subscriber may emit
    /// or connect without deadlocking.
    pub fn emit(&self, args: &A) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for subscriber in subscribers {
            subscriber(args);
        }
    }
}
