//! Shared handle to the SQLite store.

use std::sync::{Arc, Mutex};

use palaver_store::{Database, StoreError};

/// The single store connection, shared by the router and the REST handlers.
///
/// The lock is held only for the duration of one synchronous closure and is
/// never held across an `.await`.
#[derive(Clone)]
pub struct Db(Arc<Mutex<Database>>);

impl Db {
    pub fn new(db: Database) -> Self {
        Self(Arc::new(Mutex::new(db)))
    }

    pub fn with<T>(
        &self,
        f: impl FnOnce(&Database) -> palaver_store::Result<T>,
    ) -> palaver_store::Result<T> {
        let guard = self.0.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&*guard)
    }
}
