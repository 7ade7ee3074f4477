use std::sync::Arc;

use uuid::Uuid;

use draftflow_core::audit::AuditEntry;
use draftflow_core::error::Result;
use draftflow_core::store::AuditStore;

/// Append-only transition history.
///
/// Writes never fail the caller: a lost audit line is logged and the
/// transition it documents stands.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Record one entry. Returns whether it was persisted.
    pub async fn record(&self, entry: AuditEntry) -> bool {
        match self.store.append(&entry).await {
            Ok(()) => {
                tracing::debug!(
                    instance_id = %entry.workflow_instance_id,
                    action = %entry.action,
                    to_state = %entry.to_state,
                    "Audit entry recorded"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    instance_id = %entry.workflow_instance_id,
                    action = %entry.action,
                    error = %e,
                    "Failed to record audit entry"
                );
                false
            }
        }
    }

    /// Entries for `instance_id`, oldest first.
    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>> {
        self.store.list_for_instance(instance_id).await
    }
}
