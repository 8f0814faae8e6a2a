//! cutover-state — embedded state store for cutover.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployment records, traffic splits, attached traffic targets,
//! locally registered revisions and the deployment audit history.
//!
//! # Architecture
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{environment}:{revision}`, `{environment}:{seq}`)
//! allow range scans per environment.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync`. On disk, the file is only
//! open while a transaction runs, so several processes can share it; an
//! operation that cannot get the file within its busy timeout fails with
//! [`StateError::Locked`].

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
