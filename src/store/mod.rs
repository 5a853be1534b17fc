//! Persistence layer: patient state, outcome records and alerts.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Alert, AlertSink, Record, RecordStore, SessionStore, Severity};
