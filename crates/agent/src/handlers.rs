//! Local handler tables for inbound `state` and `query` requests.
//!
//! Lookups never fail: a missing key resolves to a future that yields the
//! absent value.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

/// A boxed future returned by handlers. `None` is the absent value.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Value>> + Send + 'static>>;

/// Zero-argument state handler.
pub type StateHandler = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;

/// Variadic query handler; receives the caller's positional arguments.
pub type QueryHandler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Mapping from key to handler.
///
/// Tables merge: [`HandlerTable::merge`] overwrites only the keys present in
/// the incoming table.
pub struct HandlerTable<H> {
    entries: HashMap<String, H>,
}

/// Table consulted for `state` requests.
pub type StateTable = HandlerTable<StateHandler>;

/// Table consulted for `query` requests.
pub type QueryTable = HandlerTable<QueryHandler>;

impl<H> Default for HandlerTable<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<H> HandlerTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `other` into this table.
    pub fn merge(&mut self, other: HandlerTable<H>) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn absent() -> HandlerFuture {
    Box::pin(async { None })
}

impl StateTable {
    /// Adds a state handler under `key`.
    pub fn route<F, Fut>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        let handler: StateHandler = Arc::new(move || -> HandlerFuture { Box::pin(handler()) });
        self.entries.insert(key.into(), handler);
        self
    }

    /// Starts the handler registered under `key`.
    pub fn resolve(&self, key: &str) -> HandlerFuture {
        match self.entries.get(key) {
            Some(handler) => handler(),
            None => absent(),
        }
    }
}

impl QueryTable {
    /// Adds a query handler under `key`.
    pub fn route<F, Fut>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        let handler: QueryHandler = Arc::new(move |params: Vec<Value>| -> HandlerFuture {
            Box::pin(handler(params))
        });
        self.entries.insert(key.into(), handler);
        self
    }

    /// Starts the handler registered under `key` with `params`.
    pub fn resolve(&self, key: &str, params: Vec<Value>) -> HandlerFuture {
        match self.entries.get(key) {
            Some(handler) => handler(params),
            None => absent(),
        }
    }
}
