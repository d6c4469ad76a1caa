//! In-memory cache of virtual machine states with change notification.
//!
//! The store is the only state shared between the reconciliation loop and
//! the command path. Writes are serialised; readers only ever observe whole,
//! committed [`VmState`] records. Observers are called synchronously on the
//! writer's task after each write commits, so they must return quickly and
//! must not write to the store from inside a callback.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::state::{PowerState, VmState};

/// Receives store notifications.
pub trait StateObserver: Send + Sync {
    /// Called after a full reconciliation with every known state.
    fn on_all_ready(&self, _states: &BTreeMap<String, VmState>) {}

    /// Called after every upsert, whether or not the value changed.
    fn on_state_changed(&self, _state: &VmState) {}
}

/// Handle returned by [`StateStore::subscribe`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObserverId(u64);

/// Outcome of [`StateStore::transition`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Transition {
    /// The stored state satisfied the guard and was replaced.
    Applied {
        /// Record before the transition.
        previous: VmState,
        /// Record after the transition.
        current: VmState,
    },
    /// The stored state did not satisfy the guard; nothing was written.
    Rejected(VmState),
    /// No record exists for the resource id.
    Missing,
}

type ObserverList = Vec<(ObserverId, Arc<dyn StateObserver>)>;

/// Shared owner of all cached machine states.
#[derive(Default)]
pub struct StateStore {
    states: RwLock<HashMap<String, VmState>>,
    observers: RwLock<ObserverList>,
    writer: Mutex<()>,
    next_observer: AtomicU64,
}

impl StateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` for future notifications.
    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        write(&self.observers).push((id, observer));
        id
    }

    /// Removes a previously registered observer. Returns `false` when the id
    /// was unknown.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = write(&self.observers);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Inserts or replaces the record keyed by `state.resource_id` and
    /// notifies observers. Returns the replaced record, if any.
    pub fn upsert(&self, state: VmState) -> Option<VmState> {
        let _writer = self.lock_writer();
        let previous = write(&self.states).insert(state.resource_id.clone(), state.clone());
        debug!(
            resource_id = %state.resource_id,
            power_state = %state.power_state,
            "state stored"
        );
        self.notify_changed(&state);
        previous
    }

    /// Replaces the power state of `resource_id` with `to` when `guard`
    /// accepts the current power state. The check and the write happen under
    /// the same lock.
    pub fn transition(
        &self,
        resource_id: &str,
        to: PowerState,
        guard: impl Fn(PowerState) -> bool,
    ) -> Transition {
        let _writer = self.lock_writer();
        let (previous, current) = {
            let mut states = write(&self.states);
            let Some(existing) = states.get_mut(resource_id) else {
                return Transition::Missing;
            };
            if !guard(existing.power_state) {
                return Transition::Rejected(existing.clone());
            }
            let previous = existing.clone();
            *existing = previous.with_power_state(to);
            (previous, existing.clone())
        };
        self.notify_changed(&current);
        Transition::Applied { previous, current }
    }

    /// Returns the committed record for `resource_id`.
    #[must_use]
    pub fn get(&self, resource_id: &str) -> Option<VmState> {
        read(&self.states).get(resource_id).cloned()
    }

    /// Returns a copy of every record, ordered by resource id.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, VmState> {
        read(&self.states)
            .iter()
            .map(|(key, state)| (key.clone(), state.clone()))
            .collect()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.states).len()
    }

    /// Returns `true` when nothing has been stored yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        read(&self.states).is_empty()
    }

    /// Sends the current snapshot to every observer's
    /// [`StateObserver::on_all_ready`].
    pub fn notify_all_ready(&self) {
        let _writer = self.lock_writer();
        let snapshot = self.snapshot();
        for observer in self.observers() {
            observer.on_all_ready(&snapshot);
        }
    }

    fn notify_changed(&self, state: &VmState) {
        for observer in self.observers() {
            observer.on_state_changed(state);
        }
    }

    fn observers(&self) -> Vec<Arc<dyn StateObserver>> {
        read(&self.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
