//! PostgreSQL implementations of the experiment store and the run queue.
//!
//! [`PostgresExperimentStore`] backs [`crate::store::ExperimentStore`],
//! [`PostgresConnector`] hands run executors their own pool, and
//! [`PostgresJobQueue`] is a durable [`crate::queue::JobQueue`] shared by
//! orchestrators and worker pools.
pub mod postgres;

pub use postgres::{
    connect_pool, ensure_schema, PostgresConnector, PostgresExperimentStore, PostgresJobQueue,
};
