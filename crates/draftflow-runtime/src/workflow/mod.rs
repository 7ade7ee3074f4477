mod engine;
mod http;
mod recovery;

pub use engine::{RecoveryStats, StatusReport, WorkflowEngine, INTERRUPTED, NO_ALLOWANCE};
pub use http::HttpDraftGenerator;
pub use recovery::StalledRecovery;
