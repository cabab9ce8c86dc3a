//! PostgreSQL driver adapter built on `deadpool-postgres`.
//!
//! Batched rounds are submitted by issuing every request of the round
//! concurrently on the pinned connection; tokio-postgres coalesces the
//! concurrent extended-query traffic into pipelined network round trips.

mod config;
mod connection;
mod params;
mod query;

pub use config::{PostgresDriver, PostgresOptions, PostgresOptionsBuilder};
pub use connection::{PgBatchResults, PostgresConnection};
pub use params::Params;
pub use query::build_result_set;
