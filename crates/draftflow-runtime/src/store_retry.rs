use std::future::Future;

use draftflow_core::error::Result;
use draftflow_core::retry::{self, RetryPolicy};

/// Run a store call, retrying transient errors under `policy`.
///
/// Exhausting the budget surfaces `RetryExhausted`; any other error is
/// returned unchanged.
pub(crate) async fn with_store_retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    Ok(retry::run(policy, op).await?)
}
