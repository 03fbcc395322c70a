//! Per-message processing state machine
//!
//! One call to [`MessageProcessor::process`] turns a freshly acquired message
//! into at most one successful handler invocation:
//!
//! 1. optional started-attempts bump in its own transaction, so the
//!    crash-detection counter survives a later rollback
//! 2. poisonous gap check (started − finished ≥ 2 means a previous run died
//!    mid-handling)
//! 3. the main transaction: row lock, handler invocation, completion mark —
//!    all bounded by the processing timeout

use std::sync::Arc;

use postbox_core::{ErrorCode, ListenerError, ListenerResult, ListenerSettings, StoredMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::accessors::{
    AccessResult, increment_started_attempts, initiate_message_processing, mark_abandoned,
    mark_completed,
};
use crate::handler::{HandlerRegistry, MessageHandler};
use crate::orchestrator::ErrorOrchestrator;
use crate::strategies::{RetrySource, Strategies};
use crate::transaction::{PgTransaction, begin_with_isolation, commit_or_rollback};

/// What the source should do with the message afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler ran (or no handler was registered) and the row is processed
    Completed,
    /// The row was gone, already terminal, or exhausted; nothing to do
    Skipped,
    /// A retryable failure; the source must make the message come around again
    Retry,
    /// Terminal failure; the source can move on
    Abandoned,
}

pub struct MessageProcessor {
    registry: Arc<HandlerRegistry>,
    strategies: Arc<Strategies>,
    settings: Arc<ListenerSettings>,
    orchestrator: ErrorOrchestrator,
    table: String,
}

impl MessageProcessor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        strategies: Arc<Strategies>,
        settings: Arc<ListenerSettings>,
    ) -> Self {
        let table = settings.qualified_table();
        let orchestrator =
            ErrorOrchestrator::new(Arc::clone(&registry), Arc::clone(&strategies), table.clone());
        Self {
            registry,
            strategies,
            settings,
            orchestrator,
            table,
        }
    }

    /// Process one message. Never returns an error: per-message failures are
    /// routed through the error orchestrator and reduced to an outcome.
    ///
    /// `bump_started_attempts` is set by the replication source, which sees
    /// the raw INSERT; the polling source's SQL function already bumped the
    /// counter while leasing the row.
    pub async fn process(
        &self,
        message: &mut StoredMessage,
        cancel: &CancellationToken,
        bump_started_attempts: bool,
    ) -> ProcessOutcome {
        let Some(handler) = self.registry.select(message) else {
            return self.complete_unhandled(message).await;
        };

        if self.settings.enable_poisonous_message_protection {
            if bump_started_attempts {
                match self.bump_started(message).await {
                    Ok(AccessResult::Ok) => {}
                    Ok(result) => {
                        debug!(
                            message_id = %message.id,
                            ?result,
                            "message dropped before processing"
                        );
                        return ProcessOutcome::Skipped;
                    }
                    Err(err) => {
                        warn!(
                            code = %err.code(),
                            message_id = %message.id,
                            error = %err,
                            "started-attempts bump failed"
                        );
                        return ProcessOutcome::Retry;
                    }
                }
            }

            if message.attempt_gap() >= 2 && !self.strategies.poisonous.should_reattempt(message) {
                return self.abandon_poisonous(message).await;
            }
        }

        let timeout = self.strategies.timeout.timeout(message);
        let message_id = message.id;
        let result = tokio::select! {
            () = cancel.cancelled() => Err(ListenerError::ListenerStopped),
            handled = tokio::time::timeout(timeout, self.handle_locked(message, handler)) => {
                match handled {
                    Ok(result) => result,
                    // The elapsed timeout dropped the in-flight transaction,
                    // rolling it back and releasing its connection.
                    Err(_) => Err(ListenerError::Timeout {
                        message_id,
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(ListenerError::ListenerStopped) => {
                debug!(message_id = %message.id, "processing cancelled");
                ProcessOutcome::Retry
            }
            Err(err) => {
                error!(
                    code = %err.code(),
                    message_id = %message.id,
                    error = %err,
                    "message handling failed"
                );
                if self.orchestrator.on_error(message, &err).await {
                    ProcessOutcome::Retry
                } else {
                    ProcessOutcome::Abandoned
                }
            }
        }
    }

    /// The main transaction: lock, re-check, handle, complete
    async fn handle_locked(
        &self,
        message: &mut StoredMessage,
        handler: Arc<dyn MessageHandler>,
    ) -> ListenerResult<ProcessOutcome> {
        let pool = self.strategies.client.pool(message);
        let isolation = self.strategies.isolation.isolation_level(message);
        let mut tx = begin_with_isolation(pool, isolation).await?;
        let result = self.run_locked(&mut tx, message, handler).await;
        // A no-op commit on the skip paths is deliberate; the lock is gone
        // either way.
        commit_or_rollback(tx, result).await
    }

    async fn run_locked(
        &self,
        tx: &mut PgTransaction,
        message: &mut StoredMessage,
        handler: Arc<dyn MessageHandler>,
    ) -> ListenerResult<ProcessOutcome> {
        let result = initiate_message_processing(
            tx.as_mut(),
            &self.table,
            message,
            self.strategies.not_found.as_ref(),
        )
        .await?;

        match result {
            AccessResult::NotFound => {
                debug!(message_id = %message.id, "message row not found");
                Ok(ProcessOutcome::Skipped)
            }
            AccessResult::AlreadyProcessed | AccessResult::Abandoned => {
                debug!(message_id = %message.id, ?result, "message already terminal");
                Ok(ProcessOutcome::Skipped)
            }
            AccessResult::Ok => {
                if message.finished_attempts > 0
                    && !self.strategies.retry.should_retry(
                        message,
                        None,
                        RetrySource::MessageHandler,
                    )
                {
                    debug!(
                        message_id = %message.id,
                        finished_attempts = message.finished_attempts,
                        "attempts exhausted; not handling again"
                    );
                    return Ok(ProcessOutcome::Skipped);
                }

                handler
                    .handle(message, tx.as_mut())
                    .await
                    .map_err(|source| ListenerError::MessageHandlingFailed {
                        message_id: message.id,
                        source,
                    })?;
                mark_completed(tx.as_mut(), &self.table, message).await?;
                Ok(ProcessOutcome::Completed)
            }
        }
    }

    /// No registered handler: a single completion mark, no wrapping
    /// transaction, so unrecognised messages never block the stream.
    async fn complete_unhandled(&self, message: &mut StoredMessage) -> ProcessOutcome {
        let pool = self.strategies.client.pool(message);
        let result: ListenerResult<()> = async {
            let mut conn = pool.acquire().await?;
            mark_completed(&mut conn, &self.table, message).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                debug!(
                    message_id = %message.id,
                    aggregate_type = %message.aggregate_type,
                    message_type = %message.message_type,
                    "no handler registered; marked processed"
                );
                ProcessOutcome::Completed
            }
            Err(err) => {
                warn!(
                    code = %err.code(),
                    message_id = %message.id,
                    error = %err,
                    "failed to complete unhandled message"
                );
                ProcessOutcome::Retry
            }
        }
    }

    async fn bump_started(&self, message: &mut StoredMessage) -> ListenerResult<AccessResult> {
        let pool = self.strategies.client.pool(message);
        let mut tx = begin_with_isolation(pool, None).await?;
        let result = increment_started_attempts(tx.as_mut(), &self.table, message).await;
        commit_or_rollback(tx, result).await
    }

    async fn abandon_poisonous(&self, message: &mut StoredMessage) -> ProcessOutcome {
        let pool = self.strategies.client.pool(message);
        let result: ListenerResult<()> = async {
            let mut tx = begin_with_isolation(pool, None).await?;
            let update = mark_abandoned(tx.as_mut(), &self.table, message).await;
            commit_or_rollback(tx, update).await
        }
        .await;

        match result {
            Ok(()) => {
                error!(
                    code = %ErrorCode::PoisonousMessage,
                    message_id = %message.id,
                    started_attempts = message.started_attempts,
                    finished_attempts = message.finished_attempts,
                    "abandoned poisonous message"
                );
                ProcessOutcome::Abandoned
            }
            Err(err) => {
                warn!(
                    code = %err.code(),
                    message_id = %message.id,
                    error = %err,
                    "failed to abandon poisonous message"
                );
                ProcessOutcome::Retry
            }
        }
    }
}
