//! metalloc allocator library.
//!
//! The crate ships the `allocator` binary; the library surface exists so the
//! allocation core can be driven directly from integration tests.

pub mod allocation;
pub mod api;
pub mod config;
pub mod model;
pub mod notify;
pub mod state;
pub mod store;
