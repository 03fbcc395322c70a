//! Polling acquisition
//!
//! Periodically calls the server-side `next_*_messages` function, which
//! atomically selects due rows, bumps their `started_attempts` and leases
//! them via `locked_until`. Fetched rows are processed on their own tasks; a
//! bounded in-flight set provides backpressure, and the loop wakes on either
//! a task completion or the polling interval, whichever comes first.

use std::sync::Arc;

use postbox_core::{ErrorCode, ListenerResult, ListenerSettings, PollingSettings, StoredMessage};
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::processor::{MessageProcessor, ProcessOutcome};
use crate::strategies::Strategies;

pub(crate) struct PollingSource {
    pub pool: PgPool,
    pub settings: Arc<ListenerSettings>,
    pub polling: PollingSettings,
    pub processor: Arc<MessageProcessor>,
    pub strategies: Arc<Strategies>,
    pub shutdown: CancellationToken,
}

pub(crate) async fn run_polling_source(source: PollingSource) {
    let function = source.polling.qualified_function();
    let sql = format!("SELECT * FROM {function}($1, $2)");
    let lock_ms = source.polling.lock_duration.as_millis() as i32;

    info!(
        kind = %source.settings.kind,
        function = %function,
        interval_ms = source.polling.polling_interval.as_millis() as u64,
        "polling listener started"
    );

    let mut inflight: JoinSet<ProcessOutcome> = JoinSet::new();

    loop {
        if source.shutdown.is_cancelled() {
            break;
        }

        let capacity = source.strategies.batch_size.next_batch_size() as usize;
        let free = capacity.saturating_sub(inflight.len());
        if free == 0 {
            tokio::select! {
                () = source.shutdown.cancelled() => break,
                _ = inflight.join_next() => {}
            }
            continue;
        }

        match fetch_batch(&source.pool, &sql, free as i32, lock_ms).await {
            Ok(messages) if messages.is_empty() => {
                tokio::select! {
                    () = source.shutdown.cancelled() => break,
                    () = tokio::time::sleep(source.polling.polling_interval) => {}
                    _ = inflight.join_next(), if !inflight.is_empty() => {}
                }
            }
            Ok(messages) => {
                for mut message in messages {
                    let processor = Arc::clone(&source.processor);
                    inflight.spawn(async move {
                        let cancel = CancellationToken::new();
                        // The SQL function already counted the started attempt
                        processor.process(&mut message, &cancel, false).await
                    });
                }
            }
            Err(err) => {
                error!(
                    code = %ErrorCode::BatchProcessingError,
                    error = %err,
                    "failed to fetch next messages"
                );
                tokio::select! {
                    () = source.shutdown.cancelled() => break,
                    () = tokio::time::sleep(source.polling.polling_interval) => {}
                }
            }
        }
    }

    // In-flight work completes or hits its processing timeout
    while inflight.join_next().await.is_some() {}
    info!(kind = %source.settings.kind, "polling listener stopped");
}

async fn fetch_batch(
    pool: &PgPool,
    sql: &str,
    max: i32,
    lock_ms: i32,
) -> ListenerResult<Vec<StoredMessage>> {
    Ok(sqlx::query_as::<_, StoredMessage>(sql)
        .bind(max)
        .bind(lock_ms)
        .fetch_all(pool)
        .await?)
}
