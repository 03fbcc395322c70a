//! Transaction plumbing shared by the processor and the error orchestrator

use postbox_core::ListenerResult;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

pub type PgTransaction = Transaction<'static, Postgres>;

/// Transaction isolation level requested by an isolation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Statement applying the level; must be the first statement inside the
    /// transaction to take effect.
    pub fn set_sql(self) -> &'static str {
        match self {
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Open a transaction, applying the requested isolation level. `None` keeps
/// the database default.
pub async fn begin_with_isolation(
    pool: &PgPool,
    isolation: Option<IsolationLevel>,
) -> ListenerResult<PgTransaction> {
    let mut tx = pool.begin().await?;
    if let Some(level) = isolation {
        sqlx::query(level.set_sql()).execute(tx.as_mut()).await?;
    }
    Ok(tx)
}

/// Commit on success, roll back on failure.
///
/// A rollback failure never replaces the original error; it is logged as a
/// secondary cause and the original error is surfaced. Pooled connections are
/// released on every path when the transaction is consumed.
pub async fn commit_or_rollback<T>(
    tx: PgTransaction,
    result: ListenerResult<T>,
) -> ListenerResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(
                    error = %rollback_err,
                    "rollback failed; surfacing the original error"
                );
            }
            Err(err)
        }
    }
}
