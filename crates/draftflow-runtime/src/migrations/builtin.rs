//! Built-in draftflow schema migrations.
//!
//! Applied once each, before any user migrations, and tracked in
//! `draftflow_migrations`.

use super::runner::Migration;

const DRAFTFLOW_INTERNAL_SQL: &str = include_str!("../../migrations/0000_draftflow_internal.sql");

/// Built-in migrations in application order.
pub fn get_builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0000_draftflow_internal", DRAFTFLOW_INTERNAL_SQL)]
}
