//! Runtime services for draftflow: allowance ledger, outbound queue,
//! audit log, workflow engine and the PostgreSQL store.

pub mod audit;
pub mod db;
pub mod ledger;
pub mod migrations;
pub mod outbox;
pub mod store;
pub mod workflow;

mod http;
mod store_retry;

pub use audit::AuditLog;
pub use db::Database;
pub use ledger::AllowanceLedger;
pub use migrations::{Migration, MigrationRunner, MigrationStatus};
pub use outbox::{OutboundQueue, SweepStats, Sweeper, WebhookSender};
pub use store::PgStore;
pub use workflow::{
    HttpDraftGenerator, RecoveryStats, StalledRecovery, StatusReport, WorkflowEngine,
};
