//! Registry of per-context state, created lazily under its own lock

use super::device::ContextId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Map from accelerator context to lazily created shared state
#[derive(Debug)]
pub struct PerContextData<T> {
    map: Mutex<HashMap<ContextId, Arc<T>>>,
}

impl<T> Default for PerContextData<T> {
    fn default() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PerContextData<T> {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State of `context`, if created
    #[must_use]
    pub fn find(&self, context: ContextId) -> Option<Arc<T>> {
        self.map.lock().get(&context).cloned()
    }

    /// State of `context`, creating it with `create` on first use
    ///
    /// `create` runs with the registry locked, so two racing callers never
    /// build state for the same context twice.
    ///
    /// # Errors
    ///
    /// Returns the error from `create`; nothing is inserted in that case
    pub fn find_or_try_create<E, F>(&self, context: ContextId, create: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut map = self.map.lock();
        if let Some(existing) = map.get(&context) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(create()?);
        map.insert(context, Arc::clone(&created));
        Ok(created)
    }

    /// Snapshot of every context's state, ordered by context id
    #[must_use]
    pub fn entries(&self) -> Vec<(ContextId, Arc<T>)> {
        let mut entries: Vec<_> = self
            .map
            .lock()
            .iter()
            .map(|(&context, state)| (context, Arc::clone(state)))
            .collect();
        entries.sort_by_key(|(context, _)| *context);
        entries
    }

    /// Run `f` on every context's state (outside the registry lock)
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(ContextId, &T),
    {
        for (context, state) in self.entries() {
            f(context, &state);
        }
    }

    /// Number of contexts with state
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// True if no context has state yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}
