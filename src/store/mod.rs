//! Persistence — the job/sub-task store is the only shared mutable state in
//! the engine. Dispatcher, ingestor, and sweeper are stateless and talk to
//! each other through it (plus the queue).

mod libsql_backend;
mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::JobStore;
