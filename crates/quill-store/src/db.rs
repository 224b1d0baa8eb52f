//! Database handle and connection management.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use crate::alert_repo::AlertRepository;
use crate::error::StoreResult;
use crate::history_repo::HistoryRepository;
use crate::purchase_repo::PurchaseRepository;
use crate::quota_repo::QuotaRepository;
use crate::usage_repo::UsageEventRepository;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the relational store.
///
/// Wraps a connection pool; all cross-request coordination happens via
/// database transactions, never in-process locks. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the database at `url` and run pending migrations.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(url = %url, "Connected to store");

        Ok(Self { pool })
    }

    /// Create an in-memory store for tests.
    ///
    /// Uses a single connection so transactions fully serialize; an
    /// in-memory database is dropped when the pool closes.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap connectivity check for readiness probes.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Quota account repository.
    pub fn quota(&self) -> QuotaRepository {
        QuotaRepository::new(self.pool.clone())
    }

    /// Usage event repository.
    pub fn usage(&self) -> UsageEventRepository {
        UsageEventRepository::new(self.pool.clone())
    }

    /// Usage alert repository.
    pub fn alerts(&self) -> AlertRepository {
        AlertRepository::new(self.pool.clone())
    }

    /// Purchase transaction repository.
    pub fn purchases(&self) -> PurchaseRepository {
        PurchaseRepository::new(self.pool.clone())
    }

    /// Monthly history repository.
    pub fn history(&self) -> HistoryRepository {
        HistoryRepository::new(self.pool.clone())
    }
}

/// Start a write transaction, taking the write lock up front.
///
/// Mutating transactions here read before writing; with a deferred
/// BEGIN the later lock upgrade can fail immediately with a busy error
/// the busy timeout does not cover. BEGIN IMMEDIATE makes concurrent
/// writers queue on the timeout instead.
pub(crate) async fn begin_write(pool: &SqlitePool) -> StoreResult<Transaction<'static, Sqlite>> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}
