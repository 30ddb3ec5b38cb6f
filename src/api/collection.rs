//! Purpose: Chat-collection operations over any `Store`.
//! Exports: `Collection`, `add_record`.
//! Role: Glue between the store seam and the client-side query pipeline.
//! Invariants: Every read re-fetches the full subtree; nothing is cached.
//! Invariants: A missing subtree yields empty results, never an error.
use serde_json::Value;

use super::store::Store;
use super::watch::{Watcher, watch};
use crate::core::error::ApiResult;
use crate::core::event::{ChangeEvent, Subscription};
use crate::core::path::DbPath;
use crate::core::query::{Query, order_and_limit};
use crate::core::record::{Record, entry, normalize};

/// Writes `payload` at `path/key`, or under a store-generated key when `key` is
/// absent or empty. Returns the key the payload landed under.
pub fn add_record(
    store: &dyn Store,
    path: &DbPath,
    payload: &Value,
    key: Option<&str>,
) -> ApiResult<String> {
    match key.filter(|key| !key.is_empty()) {
        Some(key) => {
            store.set(&path.child(key)?, payload)?;
            Ok(key.to_string())
        }
        None => store.push(path, payload),
    }
}

#[derive(Clone)]
pub struct Collection<'a> {
    store: &'a dyn Store,
    path: DbPath,
}

impl<'a> Collection<'a> {
    pub fn new(store: &'a dyn Store, path: DbPath) -> Self {
        Self { store, path }
    }

    pub fn path(&self) -> &DbPath {
        &self.path
    }

    pub fn add(&self, payload: &Value, key: Option<&str>) -> ApiResult<String> {
        add_record(self.store, &self.path, payload, key)
    }

    /// All records in the collection, in the store's iteration order.
    pub fn fetch(&self) -> ApiResult<Vec<Record>> {
        let snapshot = self.store.get(&self.path)?;
        Ok(normalize(&snapshot))
    }

    pub fn query(&self, query: &Query) -> ApiResult<Vec<Record>> {
        Ok(query.apply(self.fetch()?))
    }

    pub fn list(&self, limit: Option<usize>) -> ApiResult<Vec<Record>> {
        Ok(order_and_limit(self.fetch()?, None, limit))
    }

    pub fn entry(&self, key: &str) -> ApiResult<Option<Record>> {
        let snapshot = self.store.get(&self.path.child(key)?)?;
        Ok(entry(snapshot, key))
    }

    pub fn subscribe(&self) -> ApiResult<Subscription> {
        self.store.subscribe(&self.path)
    }

    pub fn watch<F>(&self, handler: F) -> ApiResult<Watcher>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        watch(self.subscribe()?, handler)
    }
}
