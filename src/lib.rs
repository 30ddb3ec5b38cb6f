//! Purpose: Library crate behind the `rtchat` CLI and emulator.
//! Exports: `core` (paths, records, queries, events, errors), `api` (stores, sessions).
//! Role: Thin client for a realtime document database plus its client-side query layer.
//! Invariants: Core modules are pure and perform no I/O.
//! Invariants: All network access goes through `api::Store` implementations.
pub mod api;
pub mod core;
