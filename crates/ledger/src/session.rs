//! A locked read-modify-write session over a [`StateStore`]

use chrono::Utc;

use crate::error::Result;
use crate::store::{StateLock, StateStore};
use crate::types::{State, StateRecord};

/// Holds the store lock for a whole run and persists every mutation
///
/// The session is the only writer while it is alive. Each call to
/// [`Session::update`] applies the change to the working copy and saves it
/// immediately, so a crash loses at most the change in flight.
pub struct Session<'a> {
    store: &'a dyn StateStore,
    state: State,
    _lock: StateLock,
}

impl<'a> Session<'a> {
    /// Lock the store and load its current state
    pub fn open(store: &'a dyn StateStore) -> Result<Self> {
        let lock = store.lock()?;
        let state = store.load()?;
        log::debug!(
            "Opened state session on {} at serial {}",
            store.location(),
            state.serial
        );
        Ok(Self {
            store,
            state,
            _lock: lock,
        })
    }

    /// Current working copy
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Consistent copy for planning
    pub fn snapshot(&self) -> State {
        self.state.clone()
    }

    pub fn record(&self, key: &str) -> Option<&StateRecord> {
        self.state.get(key)
    }

    /// Apply a change and persist it
    pub fn update<R>(&mut self, change: impl FnOnce(&mut State) -> R) -> Result<R> {
        let result = change(&mut self.state);
        self.commit()?;
        Ok(result)
    }

    /// Persist the working copy with a new serial
    pub fn commit(&mut self) -> Result<()> {
        self.state.serial += 1;
        self.state.updated_at = Utc::now();
        if let Err(e) = self.store.save(&self.state) {
            self.state.serial -= 1;
            return Err(e);
        }
        Ok(())
    }

    /// Store location, for messages
    pub fn location(&self) -> String {
        self.store.location()
    }
}
