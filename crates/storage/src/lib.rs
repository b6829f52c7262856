//! Storage contract and backends for MDM enrollments and command queues.
//!
//! The traits in [`traits`] are the ground truth for what a backend must
//! provide. Two backends ship here: a mutex-guarded in-memory store and a
//! Diesel/SQLite store with embedded migrations.

mod inmem;
mod models;
mod pagination;
mod schema;
mod sqlite;
mod traits;

pub use inmem::InMemStorage;
pub use models::*;
pub use pagination::*;
pub use sqlite::SqliteStorage;
pub use traits::*;

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
