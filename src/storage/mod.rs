//! Storage engine for Limbic
//!
//! SQLite database operations, WAL mode, and schema management.

mod connection;
mod migrations;
pub mod queries;

pub use connection::{EngramStore, StorageMode, StoreConfig};
pub use migrations::{run_migrations, SCHEMA_VERSION};
