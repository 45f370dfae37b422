use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::PoolError;

/// Reference-counted open handle on a named database.
///
/// The pin is released when the value is dropped; the pool holds one pin for
/// the duration of every acquire/release cycle so a database cannot be torn
/// down underneath a running script.
pub struct DatabasePin {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DatabasePin {
    pub fn new(name: impl Into<String>, release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            name: name.into(),
            release: Some(release),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DatabasePin {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for DatabasePin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePin").field("name", &self.name).finish()
    }
}

/// Lookup service for named databases.
pub trait DatabaseRegistry: Send + Sync {
    /// Pin a database open. Fails with [`PoolError::NotFound`] for unknown
    /// names; a successful pin keeps the database alive until dropped.
    fn pin(&self, name: &str) -> Result<DatabasePin, PoolError>;
}

/// In-process registry: a name → refcount map.
///
/// This is the registry the test suites and embedding harnesses use; a real
/// server wires its own catalog behind [`DatabaseRegistry`] instead.
#[derive(Default)]
pub struct InMemoryDatabaseRegistry {
    databases: Arc<Mutex<HashMap<String, usize>>>,
}

impl InMemoryDatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a database name so it can be pinned.
    pub fn create(&self, name: impl Into<String>) {
        let mut databases = self
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        databases.entry(name.into()).or_insert(0);
    }

    /// Current pin count for a database, `None` if unknown.
    pub fn pin_count(&self, name: &str) -> Option<usize> {
        let databases = self
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        databases.get(name).copied()
    }
}

impl DatabaseRegistry for InMemoryDatabaseRegistry {
    fn pin(&self, name: &str) -> Result<DatabasePin, PoolError> {
        let mut databases = self
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match databases.get_mut(name) {
            Some(count) => {
                *count += 1;
                let map = Arc::clone(&self.databases);
                let pinned = name.to_string();
                Ok(DatabasePin::new(
                    name,
                    Box::new(move || {
                        let mut databases =
                            map.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Some(count) = databases.get_mut(&pinned) {
                            *count = count.saturating_sub(1);
                        }
                    }),
                ))
            }
            None => Err(PoolError::NotFound(format!("database '{}'", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DatabaseRegistry, InMemoryDatabaseRegistry};
    use crate::error::PoolError;

    #[test]
    fn pin_unknown_database_fails() {
        let registry = InMemoryDatabaseRegistry::new();
        match registry.pin("missing") {
            Err(PoolError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|p| p.name().to_string())),
        }
    }

    #[test]
    fn pin_count_tracks_outstanding_pins() {
        let registry = InMemoryDatabaseRegistry::new();
        registry.create("_system");

        let a = registry.pin("_system").unwrap();
        let b = registry.pin("_system").unwrap();
        assert_eq!(registry.pin_count("_system"), Some(2));

        drop(a);
        assert_eq!(registry.pin_count("_system"), Some(1));
        drop(b);
        assert_eq!(registry.pin_count("_system"), Some(0));
    }
}
