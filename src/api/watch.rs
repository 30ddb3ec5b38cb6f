//! Purpose: Run a change handler on a dedicated worker and render events for humans.
//! Exports: `Watcher`, `watch`, `format_event`, `print_event`.
//! Role: Handler-style front end over `Subscription`.
//! Invariants: The handler runs once per event, in delivery order, never on the caller's thread.
//! Invariants: Handler failures are not retried; a stream error stops the worker.
use std::thread::{self, JoinHandle};
use std::time::Duration;

use time::OffsetDateTime;

use crate::core::error::{ApiResult, Error, ErrorKind};
use crate::core::event::{CancelHandle, ChangeEvent, Subscription, is_timeout};
use crate::core::path::DbPath;

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Handle to a running handler worker. Dropping it detaches the worker; call
/// `cancel` to stop delivery.
pub struct Watcher {
    path: DbPath,
    cancel: CancelHandle,
    handle: JoinHandle<ApiResult<()>>,
}

impl Watcher {
    pub fn path(&self) -> &DbPath {
        &self.path
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the worker; returns the stream error that stopped it, if any.
    pub fn join(self) -> ApiResult<()> {
        self.handle.join().map_err(|_| {
            Error::new(ErrorKind::Internal)
                .with_message("change handler panicked")
                .with_path(&self.path)
        })?
    }
}

pub fn watch<F>(mut subscription: Subscription, mut handler: F) -> ApiResult<Watcher>
where
    F: FnMut(ChangeEvent) + Send + 'static,
{
    let path = subscription.path().clone();
    let cancel = subscription.cancel_handle();
    let handle = thread::Builder::new()
        .name("rtchat-handler".to_string())
        .spawn(move || {
            loop {
                match subscription.next_timeout(CANCEL_POLL) {
                    Ok(Some(event)) => handler(event),
                    Ok(None) => return Ok(()),
                    Err(err) if is_timeout(&err) => continue,
                    Err(err) => return Err(err),
                }
            }
        })
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start handler thread")
                .with_path(&path)
                .with_source(err)
        })?;
    Ok(Watcher {
        path,
        cancel,
        handle,
    })
}

/// Location an event touched, spelled the way users type paths (`chats_v2/k1`).
pub fn event_location(watched: &DbPath, event: &ChangeEvent) -> String {
    let base = watched.segments().join("/");
    let relative = event.path.trim_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => relative.to_string(),
        (false, true) => base,
        (false, false) => format!("{base}/{relative}"),
    }
}

pub fn format_event(watched: &DbPath, event: &ChangeEvent, timestamp: &str) -> String {
    let mut out = format!(
        "\n[{timestamp}] {} event on '{}':\n",
        event.kind.as_str().to_uppercase(),
        event_location(watched, event)
    );
    if event.data.is_null() {
        out.push_str("  (null)\n");
    } else {
        let body = serde_json::to_string_pretty(&event.data)
            .unwrap_or_else(|_| event.data.to_string());
        out.push_str(&body);
        out.push('\n');
    }
    out.push_str(&"-".repeat(80));
    out
}

pub fn print_event(watched: &DbPath, event: &ChangeEvent) {
    println!("{}", format_event(watched, event, &now_timestamp()));
}

fn now_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
        .ok()
        .and_then(|format| now.format(&format).ok())
        .unwrap_or_else(|| now.unix_timestamp().to_string())
}
