//! State storage for pipevine.
//!
//! Two interchangeable backends implement the [`StateStore`] contract: a
//! single-document JSON file ([`FileStateStore`]) and `SQLite`
//! ([`SqliteStateStore`]). Both persist the run ledger (runs plus their
//! per-task records) and a generic key/value surface the scheduler uses for
//! its catalogue.

pub mod error;
mod file;
mod sqlite;
mod store;

pub use error::StateError;
pub use file::FileStateStore;
pub use sqlite::SqliteStateStore;
pub use store::{StateStore, DEFAULT_RUN_LIMIT};
