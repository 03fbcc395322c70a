//! Periodic deletion of terminal and aged message rows

use std::sync::Arc;

use postbox_core::{CleanupSettings, ErrorCode, ListenerResult, ListenerSettings};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub(crate) async fn run_cleanup(
    pool: PgPool,
    settings: Arc<ListenerSettings>,
    shutdown: CancellationToken,
) {
    let cleanup = settings.cleanup.clone();
    if !cleanup.is_enabled() {
        debug!(kind = %settings.kind, "message cleanup disabled");
        return;
    }

    let table = settings.qualified_table();
    let mut ticker = tokio::time::interval(cleanup.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; wait one full interval instead
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match delete_expired_messages(&pool, &table, &cleanup).await {
                    Ok(0) => {}
                    Ok(deleted) => {
                        info!(kind = %settings.kind, deleted, "cleaned up aged messages");
                    }
                    Err(err) => {
                        error!(
                            code = %ErrorCode::DbError,
                            error = %err,
                            "message cleanup failed"
                        );
                    }
                }
            }
        }
    }
}

/// One DELETE covering whichever age predicates are configured
pub async fn delete_expired_messages(
    pool: &PgPool,
    qualified_table: &str,
    settings: &CleanupSettings,
) -> ListenerResult<u64> {
    let mut predicates = Vec::new();
    let mut ages: Vec<i64> = Vec::new();

    if let Some(age) = settings.processed_max_age {
        ages.push(age.as_secs() as i64);
        predicates.push(format!(
            "processed_at < NOW() - INTERVAL '1 second' * ${}",
            ages.len()
        ));
    }
    if let Some(age) = settings.abandoned_max_age {
        ages.push(age.as_secs() as i64);
        predicates.push(format!(
            "abandoned_at < NOW() - INTERVAL '1 second' * ${}",
            ages.len()
        ));
    }
    if let Some(age) = settings.all_max_age {
        ages.push(age.as_secs() as i64);
        predicates.push(format!(
            "created_at < NOW() - INTERVAL '1 second' * ${}",
            ages.len()
        ));
    }

    if predicates.is_empty() {
        return Ok(0);
    }

    let sql = format!(
        "DELETE FROM {qualified_table} WHERE {} RETURNING id",
        predicates.join(" OR ")
    );
    let mut query = sqlx::query(&sql);
    for age in &ages {
        query = query.bind(age);
    }

    let deleted = query.fetch_all(pool).await?;
    Ok(deleted.len() as u64)
}
