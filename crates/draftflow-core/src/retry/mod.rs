//! Bounded retries with backoff for side-effecting operations.
//!
//! The wrapper is stateless: it never persists attempt counts. Callers that
//! need durable attempt bookkeeping (the outbound queue) run it with a
//! single-attempt policy and keep the count themselves.

mod policy;
mod runner;

pub use policy::{BackoffStrategy, RetryPolicy};
pub use runner::{run, run_with, RetryError, Retryable};
