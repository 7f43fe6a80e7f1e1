//! # metalloc-events
//!
//! Notification types and payloads for metalloc.
//!
//! ## Design Principles
//!
//! - Notifications are immutable records of something that already happened
//! - Every flow that emits a `start` notification emits exactly one
//!   terminal notification (`end` or `error`)
//! - Payloads carry UUIDs, never internal record ids
//!
//! ## Event Types
//!
//! - `allocation.create`, `allocation.delete`: request flows
//! - `allocation.match`: the asynchronous match outcome
//! - `allocation.release`: best-effort node release problems

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
