use async_trait::async_trait;
use deadpool_postgres::{Config as PgConfig, Pool, Runtime};
use tokio_postgres::NoTls;

use crate::context::Context;
use crate::driver::{DriverConnection, DriverPool};
use crate::error::SqlBatchError;

use super::connection::PostgresConnection;

/// Options for configuring a Postgres driver pool.
#[derive(Clone)]
pub struct PostgresOptions {
    pub config: PgConfig,
}

impl PostgresOptions {
    #[must_use]
    pub fn new(config: PgConfig) -> Self {
        Self { config }
    }
}

/// Fluent builder for the Postgres driver.
#[derive(Clone)]
pub struct PostgresOptionsBuilder {
    opts: PostgresOptions,
}

impl PostgresOptionsBuilder {
    #[must_use]
    pub fn new(config: PgConfig) -> Self {
        Self {
            opts: PostgresOptions::new(config),
        }
    }

    #[must_use]
    pub fn finish(self) -> PostgresOptions {
        self.opts
    }

    /// # Errors
    /// `ConfigError` for missing required fields, `ConnectionError` if
    /// pool creation fails.
    pub fn build(self) -> Result<PostgresDriver, SqlBatchError> {
        PostgresDriver::new(self.finish())
    }
}

/// PostgreSQL driver pool for [`BatchDb`](crate::db::BatchDb).
#[derive(Clone, Debug)]
pub struct PostgresDriver {
    pool: Pool,
}

impl PostgresDriver {
    /// Validate the configuration and create the connection pool.
    ///
    /// # Errors
    /// `ConfigError` if required config fields are missing,
    /// `ConnectionError` if pool creation fails.
    pub fn new(opts: PostgresOptions) -> Result<Self, SqlBatchError> {
        let pg_config = opts.config;

        if pg_config.dbname.is_none() {
            return Err(SqlBatchError::ConfigError("dbname is required".to_string()));
        }
        if pg_config.host.is_none() {
            return Err(SqlBatchError::ConfigError("host is required".to_string()));
        }
        if pg_config.port.is_none() {
            return Err(SqlBatchError::ConfigError("port is required".to_string()));
        }
        if pg_config.user.is_none() {
            return Err(SqlBatchError::ConfigError("user is required".to_string()));
        }
        if pg_config.password.is_none() {
            return Err(SqlBatchError::ConfigError(
                "password is required".to_string(),
            ));
        }

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                SqlBatchError::ConnectionError(format!("Failed to create Postgres pool: {e}"))
            })?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl DriverPool for PostgresDriver {
    async fn acquire(&self, ctx: &Context) -> Result<Box<dyn DriverConnection>, SqlBatchError> {
        let client = ctx
            .run_until_cancelled(async { Ok(self.pool.get().await?) })
            .await?;
        Ok(Box::new(PostgresConnection::new(client)))
    }
}
