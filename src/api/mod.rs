//! Purpose: Define the public Rust API boundary for rtchat.
//! Exports: Stores, sessions, collections, subscriptions, and the query types callers need.
//! Role: Public surface used by the CLI, the local emulator, and library callers.
//! Invariants: Store implementations are reachable only through the `Store` trait and
//! the concrete `RemoteStore`/`MemoryStore` handles re-exported here.

mod collection;
mod memory;
mod push_id;
mod remote;
mod session;
pub mod sse;
mod store;
mod watch;

pub use crate::core::error::{ApiResult, Error, ErrorKind, to_exit_code};
pub use crate::core::event::{CancelHandle, ChangeEvent, EventKind, Subscription, is_timeout};
pub use crate::core::path::DbPath;
pub use crate::core::query::{Op, Predicate, Query};
pub use crate::core::record::{Record, Snapshot};
pub use collection::{Collection, add_record};
pub use memory::MemoryStore;
pub use push_id::PushIdGenerator;
pub use remote::RemoteStore;
pub use session::{
    AUTH_TOKEN_ENV, DATABASE_URL_ENV, DEFAULT_CHAT_LOG_PATH, DEFAULT_CHATS_PATH, Session,
    SessionConfig,
};
pub use store::Store;
pub use watch::{Watcher, event_location, format_event, print_event, watch};
