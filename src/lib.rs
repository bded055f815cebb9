//! records-vault — backup, restore and disaster recovery for the
//! departmental records archive.
//!
//! The crate owns the storage engine's lifecycle during maintenance
//! operations, streams the data tree into portable snapshot archives, and
//! drives the restore state machine that replaces the live store with an
//! archive's contents without ever leaving the system half-restored.

pub mod archive;
pub mod audit;
pub mod backup;
pub mod compare;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod progress;
pub mod restore;
pub mod retry;
pub mod service;

pub use error::{Result, VaultError};
