//! Domain model and seams for durable draft generation and review.
//!
//! Runtime implementations (ledger, outbound queue, audit log, engine and
//! the Postgres store) live in `draftflow-runtime`.

pub mod allowance;
pub mod audit;
pub mod config;
pub mod error;
pub mod outbox;
pub mod retry;
pub mod store;
pub mod workflow;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use allowance::{AllowanceAccount, Balance, CreditMode};
pub use audit::{AuditAction, AuditEntry};
pub use config::DraftflowConfig;
pub use error::{DraftflowError, Result};
pub use outbox::{
    DeliveryError, MessageStatus, NewMessage, NotificationSender, QueueStats, QueuedMessage,
};
pub use retry::{RetryPolicy, Retryable};
pub use store::{
    AllowanceStore, AuditStore, Charge, FailureOutcome, InstanceStore, OutboxStore, Store,
    TransitionEffects, TransitionOutcome,
};
pub use workflow::{
    Decision, DraftGenerator, DraftResult, GenerationError, InstanceUpdate, WorkflowInput,
    WorkflowInstance, WorkflowKind, WorkflowState,
};
