use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge, histogram};
use sea_orm::{
    ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Establishes a connection pool to the database with default tuning.
pub async fn establish_connection(database_url: &str) -> Result<DbPool, ServiceError> {
    let config = DbConfig {
        url: database_url.to_string(),
        ..Default::default()
    };

    establish_connection_with_config(&config).await
}

/// Establishes a connection pool to the database with custom configuration
///
/// An in-memory SQLite database lives inside a single connection, so the pool
/// is pinned to one connection for such URLs.
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let in_memory = config.url.starts_with("sqlite::memory:") || config.url.contains("mode=memory");
    let (max_connections, min_connections) = if in_memory {
        (1, 1)
    } else {
        (config.max_connections, config.min_connections)
    };

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(max_connections)
        .min_connections(min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(false);

    gauge!("remitflow_db.max_connections", max_connections as f64);

    info!(max_connections, "Connecting to database");

    let db_pool = Database::connect(opt).await.map_err(|e| {
        error!(error = %e, "Database connection establishment failed");
        counter!("remitflow_db.connection_failures", 1);
        ServiceError::store("db.connect", None, e)
    })?;

    info!("Database connection pool established successfully");

    Ok(db_pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    let pool = establish_connection_with_config(&db_cfg).await?;
    if cfg.auto_migrate {
        run_migrations(&pool).await?;
    }
    Ok(pool)
}

/// Runs database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    info!("Running database migrations");
    let start = Instant::now();

    let result = crate::migrator::Migrator::up(pool, None)
        .await
        .map_err(|e| ServiceError::store("db.migrate", None, e));

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => info!("Database migrations completed successfully in {:?}", elapsed),
        Err(e) => error!("Database migrations failed after {:?}: {}", elapsed, e),
    }

    result
}

/// Checks if the database connection is active
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    debug!("Checking database connection");
    let start = Instant::now();

    let result = pool
        .ping()
        .await
        .map_err(|e| ServiceError::store("db.ping", None, e));

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => {
            debug!("Database connection check successful in {:?}", elapsed);
            gauge!("remitflow_db.connection_latency", elapsed.as_millis() as f64);
        }
        Err(e) => {
            error!("Database connection check failed after {:?}: {}", elapsed, e);
            counter!("remitflow_db.connection_failures", 1);
        }
    }

    result
}

/// Opens a transaction for a lifecycle operation. Dropping it without
/// [`commit`] rolls it back.
pub async fn begin(pool: &DbPool, operation: &'static str) -> Result<DatabaseTransaction, ServiceError> {
    counter!("remitflow_db.transaction.started", 1, "operation" => operation);
    pool.begin().await.map_err(|e| {
        counter!("remitflow_db.transaction.begin_failed", 1, "operation" => operation);
        ServiceError::store(operation, None, e)
    })
}

/// Commits a lifecycle transaction, recording the outcome.
pub async fn commit(txn: DatabaseTransaction, operation: &'static str) -> Result<(), ServiceError> {
    let start = Instant::now();
    match txn.commit().await {
        Ok(()) => {
            counter!("remitflow_db.transaction.committed", 1, "operation" => operation);
            histogram!("remitflow_db.transaction.commit_duration", start.elapsed(), "operation" => operation);
            Ok(())
        }
        Err(e) => {
            counter!("remitflow_db.transaction.rolled_back", 1, "operation" => operation);
            Err(ServiceError::store(operation, None, e))
        }
    }
}

/// Runs `write` inside a savepoint of `txn`. A failure rolls back only the
/// savepoint and is reported as `false`; the outer transaction stays usable.
pub async fn savepoint<F, Fut>(txn: &DatabaseTransaction, what: &'static str, write: F) -> bool
where
    F: FnOnce(DatabaseTransaction) -> Fut,
    Fut: Future<Output = Result<DatabaseTransaction, DbErr>>,
{
    let nested = match txn.begin().await {
        Ok(nested) => nested,
        Err(e) => {
            warn!(error = %e, what, "could not open savepoint; skipping best-effort write");
            counter!("remitflow_db.savepoint.failed", 1, "what" => what);
            return false;
        }
    };

    match write(nested).await {
        Ok(nested) => match nested.commit().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, what, "could not release savepoint");
                counter!("remitflow_db.savepoint.failed", 1, "what" => what);
                false
            }
        },
        Err(e) => {
            warn!(error = %e, what, "best-effort write failed; savepoint rolled back");
            counter!("remitflow_db.savepoint.failed", 1, "what" => what);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectionTrait, Statement};

    #[tokio::test]
    async fn in_memory_connection_is_usable_after_migrations() {
        let pool = establish_connection("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        assert!(check_connection(&pool).await.is_ok());
    }

    #[tokio::test]
    async fn decimal_columns_keep_their_scale_on_sqlite() {
        use crate::entities::exchange_rate;
        use chrono::Utc;
        use rust_decimal_macros::dec;
        use sea_orm::{ActiveModelTrait, EntityTrait, Set};
        use uuid::Uuid;

        let pool = establish_connection("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();

        let id = Uuid::new_v4();
        exchange_rate::ActiveModel {
            id: Set(id),
            from_currency: Set("USD".into()),
            to_currency: Set("CUP".into()),
            rate: Set(dec!(320.125000)),
            is_active: Set(true),
            effective_from: Set(Utc::now()),
            created_at: Set(Utc::now()),
        }
        .insert(&pool)
        .await
        .unwrap();

        let stored = exchange_rate::Entity::find_by_id(id)
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.rate, dec!(320.125));
    }

    #[tokio::test]
    async fn failed_savepoint_keeps_outer_transaction() {
        let pool = establish_connection("sqlite::memory:").await.unwrap();
        pool.execute(Statement::from_string(
            pool.get_database_backend(),
            "CREATE TABLE t (v INTEGER NOT NULL)".to_string(),
        ))
        .await
        .unwrap();

        let txn = begin(&pool, "test").await.unwrap();
        txn.execute(Statement::from_string(
            txn.get_database_backend(),
            "INSERT INTO t (v) VALUES (1)".to_string(),
        ))
        .await
        .unwrap();

        let ok = savepoint(&txn, "bad insert", |nested| async move {
            nested
                .execute(Statement::from_string(
                    nested.get_database_backend(),
                    "INSERT INTO missing (v) VALUES (2)".to_string(),
                ))
                .await?;
            Ok(nested)
        })
        .await;
        assert!(!ok);

        commit(txn, "test").await.unwrap();

        let row = pool
            .query_one(Statement::from_string(
                pool.get_database_backend(),
                "SELECT COUNT(*) AS n FROM t".to_string(),
            ))
            .await
            .unwrap()
            .unwrap();
        let n: i64 = row.try_get("", "n").unwrap();
        assert_eq!(n, 1);
    }
}
