//! Purpose: Change-event model and the cancellable subscription handed to callers.
//! Exports: `EventKind`, `ChangeEvent`, `Subscription`, `EventSender`, `CancelHandle`.
//! Role: Shared contract between store workers (producers) and callers (consumers).
//! Invariants: Event paths are relative to the watched location and start with `/`.
//! Invariants: After cancellation no further events are yielded.
//! Invariants: An error ends the sequence after it has been yielded once.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::error::{ApiResult, Error, ErrorKind};
use super::path::DbPath;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Full replace of the data at `path`.
    Put,
    /// Merge of the children in `data` into `path`.
    Patch,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Put => "put",
            EventKind::Patch => "patch",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub path: String,
    pub data: Value,
}

impl ChangeEvent {
    pub fn put(path: impl Into<String>, data: Value) -> Self {
        Self {
            kind: EventKind::Put,
            path: path.into(),
            data,
        }
    }

    pub fn patch(path: impl Into<String>, data: Value) -> Self {
        Self {
            kind: EventKind::Patch,
            path: path.into(),
            data,
        }
    }
}

/// Formats relative segments as an event path (`/` when empty).
pub fn relative_path(segments: &[String]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    segments.iter().map(|segment| format!("/{segment}")).collect()
}

#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Producer half held by the worker that feeds a subscription.
#[derive(Clone)]
pub struct EventSender {
    channel: Channel,
    cancel: CancelHandle,
}

#[derive(Clone)]
enum Channel {
    Unbounded(Sender<ApiResult<ChangeEvent>>),
    Bounded(SyncSender<ApiResult<ChangeEvent>>),
}

impl EventSender {
    /// Delivers one item; `false` once the subscriber has cancelled or gone away.
    pub fn send(&self, item: ApiResult<ChangeEvent>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let delivered = match &self.channel {
            Channel::Unbounded(tx) => tx.send(item).is_ok(),
            Channel::Bounded(tx) => tx.send(item).is_ok(),
        };
        delivered && !self.cancel.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

pub struct Subscription {
    path: DbPath,
    receiver: Receiver<ApiResult<ChangeEvent>>,
    cancel: CancelHandle,
    finished: bool,
}

impl Subscription {
    /// Subscription whose producer never blocks (in-process stores).
    pub fn unbounded(path: DbPath) -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel();
        Self::assemble(path, rx, Channel::Unbounded(tx))
    }

    /// Subscription whose producer blocks once `capacity` events are pending.
    pub fn bounded(path: DbPath, capacity: usize) -> (Self, EventSender) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        Self::assemble(path, rx, Channel::Bounded(tx))
    }

    fn assemble(
        path: DbPath,
        receiver: Receiver<ApiResult<ChangeEvent>>,
        channel: Channel,
    ) -> (Self, EventSender) {
        let cancel = CancelHandle::default();
        let sender = EventSender {
            channel,
            cancel: cancel.clone(),
        };
        let subscription = Self {
            path,
            receiver,
            cancel,
            finished: false,
        };
        (subscription, sender)
    }

    pub fn path(&self) -> &DbPath {
        &self.path
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Stops delivery immediately. Producers observe the cancel at their next
    /// wake-up: a remote listener closes its connection after the next frame or
    /// keep-alive from the database (at most one keep-alive interval, 30s for
    /// hosted databases).
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.finished = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits up to `timeout` for the next event. `Ok(None)` means the stream ended
    /// or was cancelled; a timeout is reported as a `TimedOut` I/O error kind.
    pub fn next_timeout(&mut self, timeout: Duration) -> ApiResult<Option<ChangeEvent>> {
        if self.finished || self.cancel.is_cancelled() {
            return Ok(None);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => self.accept(item),
            Err(RecvTimeoutError::Timeout) => Err(Error::new(ErrorKind::Io)
                .with_message("timed out waiting for change event")
                .with_path(&self.path)
                .with_source(std::io::Error::from(std::io::ErrorKind::TimedOut))),
            Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    fn accept(&mut self, item: ApiResult<ChangeEvent>) -> ApiResult<Option<ChangeEvent>> {
        if self.cancel.is_cancelled() {
            self.finished = true;
            return Ok(None);
        }
        match item {
            Ok(event) => Ok(Some(event)),
            Err(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }
}

impl Iterator for Subscription {
    type Item = ApiResult<ChangeEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.cancel.is_cancelled() {
            return None;
        }
        match self.receiver.recv() {
            Ok(item) => self.accept(item).transpose(),
            Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn is_timeout(err: &Error) -> bool {
    use std::error::Error as _;
    err.kind() == ErrorKind::Io
        && err
            .source()
            .and_then(|source| source.downcast_ref::<std::io::Error>())
            .is_some_and(|io| io.kind() == std::io::ErrorKind::TimedOut)
}
