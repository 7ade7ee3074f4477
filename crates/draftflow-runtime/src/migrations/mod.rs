//! Schema migrations: the built-in draftflow schema plus optional
//! user migrations from a directory.

mod builtin;
mod runner;

pub use builtin::get_builtin_migrations;
pub use runner::{load_migrations_from_dir, Migration, MigrationRunner, MigrationStatus};
