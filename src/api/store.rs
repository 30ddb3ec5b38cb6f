//! Purpose: Define the remote-store seam the query layer and collections depend on.
//! Exports: `Store`.
//! Role: One trait implemented by the HTTP client and the in-memory tree.
//! Invariants: Writing `null` (via `set`, or a `null` field in `update`) deletes data.
//! Invariants: `subscribe` yields a `put` at `/` with the current value before any change.
use serde_json::{Map, Value};

use crate::core::error::ApiResult;
use crate::core::event::Subscription;
use crate::core::path::DbPath;
use crate::core::record::Snapshot;

pub trait Store: Send + Sync {
    /// Reads the full subtree at `path`; absent data is a `null` snapshot, not an error.
    fn get(&self, path: &DbPath) -> ApiResult<Snapshot>;

    /// Replaces the data at `path`.
    fn set(&self, path: &DbPath, value: &Value) -> ApiResult<()>;

    /// Writes `value` under a new store-generated child key of `path` and returns that key.
    fn push(&self, path: &DbPath, value: &Value) -> ApiResult<String>;

    /// Merges `fields` into `path`; keys may be nested relative paths (`a/b`).
    fn update(&self, path: &DbPath, fields: &Map<String, Value>) -> ApiResult<()>;

    fn remove(&self, path: &DbPath) -> ApiResult<()>;

    fn subscribe(&self, path: &DbPath) -> ApiResult<Subscription>;
}
