//! Infrastructure layer: Postgres persistence for the job engine.

pub mod pool;
pub mod postgres;

pub use pool::connect_from_env;
pub use postgres::PostgresJobStore;
