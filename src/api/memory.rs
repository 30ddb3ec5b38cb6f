//! Purpose: In-process document tree with the remote store's read/write/listen semantics.
//! Exports: `MemoryStore`.
//! Role: Backing store for the local emulator and for tests that need no network.
//! Invariants: `null` object children are never stored; emptied objects disappear.
//! Invariants: Listener events are sent under the tree lock, so every listener observes
//! writes in the order they were applied.
//! Invariants: Listener channels are unbounded; a write never blocks on a slow listener.
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tracing::debug;

use super::push_id::PushIdGenerator;
use super::store::Store;
use crate::core::error::ApiResult;
use crate::core::event::{ChangeEvent, EventKind, EventSender, Subscription, relative_path};
use crate::core::path::DbPath;
use crate::core::record::Snapshot;

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    tree: Mutex<Tree>,
    push_ids: PushIdGenerator,
}

#[derive(Default)]
struct Tree {
    root: Value,
    listeners: Vec<Listener>,
}

struct Listener {
    path: DbPath,
    sender: EventSender,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `root` as the whole database.
    pub fn with_data(root: Value) -> Self {
        let store = Self::new();
        store.lock().root = strip_nulls(root);
        store
    }

    /// Number of live listeners; cancelled ones are pruned first.
    pub fn listener_count(&self) -> usize {
        let mut tree = self.lock();
        tree.listeners.retain(|listener| !listener.sender.is_closed());
        tree.listeners.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.inner
            .tree
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Tree {
    fn value_at(&self, path: &DbPath) -> Value {
        value_at(&self.root, path.segments())
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn write(&mut self, path: &DbPath, value: Value) {
        let value = strip_nulls(value);
        if value.is_null() {
            remove_at(&mut self.root, path.segments());
        } else {
            write_at(&mut self.root, path.segments(), value);
        }
    }

    fn notify_put(&mut self, written: &DbPath) {
        let data = self.value_at(written);
        let batches: Vec<Vec<ChangeEvent>> = self
            .listeners
            .iter()
            .map(|listener| {
                event_for(&listener.path, written, EventKind::Put, &data, self)
                    .into_iter()
                    .collect()
            })
            .collect();
        self.deliver(batches);
    }

    fn notify_patch(&mut self, base: &DbPath, fields: &Map<String, Value>, touched: &[DbPath]) {
        let data = Value::Object(fields.clone());
        let mut batches = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            if base.starts_with(&listener.path) {
                let event = event_for(&listener.path, base, EventKind::Patch, &data, self);
                batches.push(event.into_iter().collect());
                continue;
            }
            // Listeners below the patched location see each touched child as a put.
            let mut own = Vec::new();
            for path in touched {
                let value = self.value_at(path);
                own.extend(event_for(&listener.path, path, EventKind::Put, &value, self));
            }
            batches.push(own);
        }
        self.deliver(batches);
    }

    /// Sends `batches[i]` to listener `i`, dropping listeners that went away.
    fn deliver(&mut self, batches: Vec<Vec<ChangeEvent>>) {
        let mut batches = batches.into_iter();
        self.listeners.retain(|listener| {
            let events = batches.next().unwrap_or_default();
            if events.is_empty() {
                return !listener.sender.is_closed();
            }
            events
                .into_iter()
                .all(|event| listener.sender.send(Ok(event)))
        });
    }
}

impl Store for MemoryStore {
    fn get(&self, path: &DbPath) -> ApiResult<Snapshot> {
        let tree = self.lock();
        Ok(Snapshot::new(path.clone(), tree.value_at(path)))
    }

    fn set(&self, path: &DbPath, value: &Value) -> ApiResult<()> {
        let mut tree = self.lock();
        tree.write(path, value.clone());
        tree.notify_put(path);
        debug!(path = %path, "memory set");
        Ok(())
    }

    fn push(&self, path: &DbPath, value: &Value) -> ApiResult<String> {
        let key = self.inner.push_ids.next_id()?;
        let child = path.child(&key)?;
        self.set(&child, value)?;
        Ok(key)
    }

    fn update(&self, path: &DbPath, fields: &Map<String, Value>) -> ApiResult<()> {
        let mut touched = Vec::with_capacity(fields.len());
        for key in fields.keys() {
            touched.push(path.child(key)?);
        }
        let mut tree = self.lock();
        for (child, value) in touched.iter().zip(fields.values()) {
            tree.write(child, value.clone());
        }
        tree.notify_patch(path, fields, &touched);
        debug!(path = %path, fields = fields.len(), "memory update");
        Ok(())
    }

    fn remove(&self, path: &DbPath) -> ApiResult<()> {
        self.set(path, &Value::Null)
    }

    fn subscribe(&self, path: &DbPath) -> ApiResult<Subscription> {
        let (subscription, sender) = Subscription::unbounded(path.clone());
        let mut tree = self.lock();
        let current = tree.value_at(path);
        if sender.send(Ok(ChangeEvent::put("/", current))) {
            tree.listeners.push(Listener {
                path: path.clone(),
                sender,
            });
        }
        debug!(path = %path, listeners = tree.listeners.len(), "memory subscribe");
        Ok(subscription)
    }
}

fn event_for(
    listener: &DbPath,
    written: &DbPath,
    kind: EventKind,
    data: &Value,
    tree: &Tree,
) -> Option<ChangeEvent> {
    if let Some(rest) = written.strip_prefix(listener) {
        return Some(ChangeEvent {
            kind,
            path: relative_path(rest),
            data: data.clone(),
        });
    }
    if listener.starts_with(written) {
        return Some(ChangeEvent::put("/", tree.value_at(listener)));
    }
    None
}

fn value_at<'a>(node: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(node).filter(|value| !value.is_null());
    };
    let child = match node {
        Value::Object(map) => map.get(head),
        Value::Array(items) => head.parse::<usize>().ok().and_then(|idx| items.get(idx)),
        _ => None,
    }?;
    value_at(child, rest)
}

fn write_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if let Value::Array(items) = node {
        if let Ok(idx) = head.parse::<usize>() {
            if idx <= items.len() {
                if idx == items.len() {
                    items.push(Value::Null);
                }
                write_at(&mut items[idx], rest, value);
                return;
            }
        }
    }
    let map = as_object_mut(node);
    let child = map.entry(head.clone()).or_insert(Value::Null);
    write_at(child, rest, value);
}

fn remove_at(node: &mut Value, segments: &[String]) {
    let Some((head, rest)) = segments.split_first() else {
        *node = Value::Null;
        return;
    };
    match node {
        Value::Object(map) => {
            if let Some(child) = map.get_mut(head) {
                remove_at(child, rest);
                if child.is_null() {
                    map.remove(head);
                }
            }
            if map.is_empty() {
                *node = Value::Null;
            }
        }
        Value::Array(items) => {
            if let Some(child) = head.parse::<usize>().ok().and_then(|idx| items.get_mut(idx)) {
                remove_at(child, rest);
            }
            while items.last().is_some_and(Value::is_null) {
                items.pop();
            }
            if items.is_empty() {
                *node = Value::Null;
            }
        }
        _ => {}
    }
}

/// Converts `node` into an object in place, keeping array items under index keys.
fn as_object_mut(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        let map = match node.take() {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .filter(|(_, item)| !item.is_null())
                .map(|(idx, item)| (idx.to_string(), item))
                .collect(),
            _ => Map::new(),
        };
        *node = Value::Object(map);
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just converted to an object"),
    }
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .map(|(key, child)| (key, strip_nulls(child)))
                .filter(|(_, child)| !child.is_null())
                .collect();
            if map.is_empty() {
                Value::Null
            } else {
                Value::Object(map)
            }
        }
        Value::Array(items) => {
            let items: Vec<Value> = items.into_iter().map(strip_nulls).collect();
            if items.iter().all(Value::is_null) {
                Value::Null
            } else {
                Value::Array(items)
            }
        }
        other => other,
    }
}
