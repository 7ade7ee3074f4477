//! Test support: an in-memory store, scripted collaborators, assertion
//! macros and explicit Postgres provisioning.
//!
//! Enabled for this crate's own tests and, for downstream crates, with the
//! `testing` feature.
//!
//! ```ignore
//! let store = Arc::new(MemoryStore::new());
//! let generator = Arc::new(ScriptedGenerator::failing_then(2, "Dear Acme"));
//! let sender = Arc::new(RecordingSender::new());
//! ```

pub mod assertions;
pub mod db;
pub mod memory;
pub mod mocks;

pub use assertions::audit_actions;
pub use db::{IsolatedTestDb, TestDatabase};
pub use memory::{CreditRecord, MemoryStore};
pub use mocks::{Delivery, RecordingSender, ScriptedGenerator};
