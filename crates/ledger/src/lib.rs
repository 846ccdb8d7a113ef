//! # Ledger
//!
//! Crash-safe persistence of provisioned resource state.
//!
//! This crate provides:
//! - [`State`] / [`StateRecord`]: the last-known state of every node, keyed by
//!   node identity and tagged with a schema version
//! - [`StateStore`]: load/save/lock contract with a JSON [`FileStore`]
//!   (write-temp-then-rename) and an in-process [`MemoryStore`]
//! - [`Session`]: a locked read-modify-write session that persists after
//!   every change
//!
//! ## Example
//!
//! ```no_run
//! use ledger::{FileStore, NodeKind, Session, StateRecord};
//!
//! let store = FileStore::new(".terrace/state.json");
//! let mut session = Session::open(&store)?;
//! session.update(|state| {
//!     state.insert(StateRecord::new("aws_vpc.main", NodeKind::ManagedResource, "aws_vpc"));
//! })?;
//! # Ok::<(), ledger::Error>(())
//! ```

mod error;
mod session;
mod store;
mod types;

pub use error::{Error, Result};
pub use session::Session;
pub use store::{FileStore, MemoryStore, StateLock, StateStore};
pub use types::{NodeKind, RecordStatus, SCHEMA_VERSION, State, StateRecord};
