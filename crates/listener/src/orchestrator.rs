//! Error orchestration for failed message handling
//!
//! Guarantees that attempt counters advance even when the user's error hook
//! itself fails; without that, a broken hook would replay the same message
//! forever.

use std::sync::Arc;
use std::time::Duration;

use postbox_core::{ErrorCode, ListenerError, ListenerResult, StoredMessage};
use tracing::{error, warn};

use crate::accessors::{increment_finished_attempts, mark_abandoned};
use crate::handler::HandlerRegistry;
use crate::strategies::{RetrySource, Strategies};
use crate::transaction::{PgTransaction, begin_with_isolation, commit_or_rollback};

pub struct ErrorOrchestrator {
    registry: Arc<HandlerRegistry>,
    strategies: Arc<Strategies>,
    table: String,
}

impl ErrorOrchestrator {
    pub fn new(registry: Arc<HandlerRegistry>, strategies: Arc<Strategies>, table: String) -> Self {
        Self {
            registry,
            strategies,
            table,
        }
    }

    /// Record a failed attempt and decide whether the message is retried.
    /// Never fails; orchestration errors degrade into the best-effort
    /// counter update.
    pub async fn on_error(&self, message: &mut StoredMessage, error: &ListenerError) -> bool {
        match self.try_orchestrate(message, error).await {
            Ok(retry) => {
                if !retry {
                    error!(
                        code = %ErrorCode::GivingUpMessageHandling,
                        message_id = %message.id,
                        finished_attempts = message.finished_attempts,
                        error = %error,
                        "giving up on message"
                    );
                }
                retry
            }
            Err(orchestration_error) => {
                error!(
                    code = %ErrorCode::MessageErrorHandlingFailed,
                    message_id = %message.id,
                    error = %orchestration_error,
                    original_error = %error,
                    "error handling failed; falling back to best-effort counter update"
                );
                self.best_effort_counter_update(message, error).await;
                self.strategies
                    .retry
                    .should_retry(message, Some(error), RetrySource::ErrorHandlerError)
            }
        }
    }

    async fn try_orchestrate(
        &self,
        message: &mut StoredMessage,
        error: &ListenerError,
    ) -> ListenerResult<bool> {
        let pool = self.strategies.client.pool(message);
        let isolation = self.strategies.isolation.isolation_level(message);
        let mut tx = begin_with_isolation(pool, isolation).await?;

        // The error hook must see the post-attempt count; the accessor below
        // re-synchronises from the database either way.
        message.finished_attempts += 1;
        let retry =
            self.strategies
                .retry
                .should_retry(message, Some(error), RetrySource::MessageHandler);

        let result = self.record_attempt(&mut tx, message, error, retry).await;
        commit_or_rollback(tx, result).await?;
        Ok(retry)
    }

    async fn record_attempt(
        &self,
        tx: &mut PgTransaction,
        message: &mut StoredMessage,
        error: &ListenerError,
        retry: bool,
    ) -> ListenerResult<()> {
        if let Some(handler) = self.registry.select(message) {
            handler
                .handle_error(error, message, tx.as_mut(), retry)
                .await
                .map_err(|source| ListenerError::MessageErrorHandlingFailed {
                    message_id: message.id,
                    source,
                })?;
        }

        if retry {
            increment_finished_attempts(tx.as_mut(), &self.table, message).await
        } else {
            mark_abandoned(tx.as_mut(), &self.table, message).await
        }
    }

    /// Up to three single-purpose transactions advancing only the counter.
    /// Sleeps between attempts only for serialization/deadlock errors, which
    /// are the one class worth waiting out.
    async fn best_effort_counter_update(&self, message: &mut StoredMessage, error: &ListenerError) {
        let pool = self.strategies.client.pool(message);

        for attempt in 1..=3u64 {
            let result: ListenerResult<()> = async {
                let mut tx = begin_with_isolation(pool, None).await?;
                let retry = self.strategies.retry.should_retry(
                    message,
                    Some(error),
                    RetrySource::MessageHandler,
                );
                let update = if retry {
                    increment_finished_attempts(tx.as_mut(), &self.table, message).await
                } else {
                    mark_abandoned(tx.as_mut(), &self.table, message).await
                };
                commit_or_rollback(tx, update).await
            }
            .await;

            match result {
                Ok(()) => return,
                Err(update_error) if update_error.is_serialization_error() => {
                    warn!(
                        message_id = %message.id,
                        attempt,
                        error = %update_error,
                        "best-effort counter update lost a serialization race"
                    );
                    tokio::time::sleep(Duration::from_millis(attempt * 100)).await;
                }
                Err(update_error) => {
                    error!(
                        code = %ErrorCode::DbError,
                        message_id = %message.id,
                        error = %update_error,
                        "best-effort counter update failed; leaving the row as-is"
                    );
                    return;
                }
            }
        }
    }
}
