//! draftflow: durable draft generation with human review.
//!
//! The engine, ledger and outbound queue live in `draftflow-runtime`; this
//! crate wires them into a long-running process and a CLI.

mod logging;
mod runtime;

#[doc(hidden)]
pub use draftflow_core;
#[doc(hidden)]
pub use draftflow_runtime;

pub use draftflow_runtime::migrations::Migration;

#[cfg(feature = "testing")]
pub use draftflow_core::{assert_err_variant, assert_ok, assert_state};

pub use logging::init_logging;
pub use runtime::prelude;
pub use runtime::{webhook_queue, Draftflow, DraftflowBuilder, Services};
