//! Phase-change subscriptions.
//!
//! Listeners are called synchronously, in subscription order, after the new
//! state has been persisted. A listener never sees a phase that is not on disk.

use crate::state::FlowState;
use crate::types::FlowPhase;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// What a listener receives on each committed transition.
#[derive(Debug, Clone)]
pub struct PhaseChange {
    pub feature: String,
    pub previous: FlowPhase,
    pub state: FlowState,
}

type Listener = Arc<dyn Fn(&PhaseChange) + Send + Sync>;

#[derive(Default)]
struct Inner {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

#[derive(Clone, Default)]
pub struct PhaseObservers {
    inner: Arc<Mutex<Inner>>,
}

impl PhaseObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PhaseChange) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            observers: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn notify(&self, change: &PhaseChange) {
        // Snapshot first so a listener may (un)subscribe without deadlocking.
        let listeners: Vec<Listener> = self
            .inner
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

/// Handle returned by [`PhaseObservers::subscribe`].
pub struct Subscription {
    id: u64,
    observers: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Stop receiving notifications. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.observers.upgrade() {
            inner.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
