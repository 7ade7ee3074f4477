//! PostgreSQL implementation of the store traits.
//!
//! Every method is one SQL statement, except instance transitions, which
//! run their charge, outbox insert and state update in one transaction.
//! Contended rows are claimed with conditional updates or
//! `FOR UPDATE SKIP LOCKED`, so any number of processes can share the
//! database.

mod allowance;
mod audit;
mod instances;
mod outbox;

use sqlx::PgPool;

use crate::db::Database;

/// Store backed by the draftflow Postgres schema.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
