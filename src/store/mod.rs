//! Persistence layer: libSQL-backed storage for templates, users and onboarding state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, StoreTransaction, TemplateReferences, TxMode, with_transaction};
