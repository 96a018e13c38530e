//! System health state and its observers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemState {
    Normal,
    Busy,
    Pause,
    Stop,
}

pub trait StateObserver: Send + Sync {
    fn state_changed(&self, prev: SystemState, next: SystemState);
}

pub trait StateControl: Send + Sync + fmt::Debug {
    fn subscribe(&self, observer: Arc<dyn StateObserver>, name: &str);

    fn unsubscribe(&self, name: &str);

    fn get_state(&self) -> SystemState;
}

/// Holds the current state and notifies subscribers of every change.
pub struct StateManager {
    state: RwLock<SystemState>,
    observers: Mutex<BTreeMap<String, Arc<dyn StateObserver>>>,
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("state", &*self.state.read())
            .field("observers", &self.observers.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StateManager {
    pub fn new(initial: SystemState) -> StateManager {
        StateManager { state: RwLock::new(initial), observers: Mutex::default() }
    }

    pub fn set_state(&self, next: SystemState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev == next {
            return;
        }
        log::info!("system state {:?} -> {:?}", prev, next);

        // notify without holding the registry lock
        let observers: Vec<_> = self.observers.lock().values().cloned().collect();
        for observer in observers {
            observer.state_changed(prev, next);
        }
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.observers.lock().contains_key(name)
    }
}

impl StateControl for StateManager {
    fn subscribe(&self, observer: Arc<dyn StateObserver>, name: &str) {
        if self.observers.lock().insert(name.to_owned(), observer).is_some() {
            log::warn!("state observer {} subscribed twice", name);
        }
    }

    fn unsubscribe(&self, name: &str) {
        self.observers.lock().remove(name);
    }

    fn get_state(&self) -> SystemState {
        *self.state.read()
    }
}
