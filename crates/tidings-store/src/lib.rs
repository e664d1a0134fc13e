//! # tidings-store
//!
//! Durable message log for the tidings messaging subsystem, backed by
//! SQLite. It is the system of record: every message, group and the local
//! user directory live here, and every cache or live delivery is derived
//! from it.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers per domain model.
//! Async callers are expected to move calls onto a blocking thread.

pub mod database;
pub mod groups;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
