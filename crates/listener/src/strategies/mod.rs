//! Pluggable listener policies
//!
//! Each strategy is a single-method trait with a documented default. They are
//! constructed once at listener start and bundled into a [`Strategies`]
//! record that the processor, orchestrator and sources share.

pub mod concurrency;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use postbox_core::{ListenerError, ListenerSettings, StoredMessage};
use sqlx::PgPool;
use tokio_postgres::error::SqlState;

use crate::transaction::IsolationLevel;

pub use concurrency::{
    CompositeController, ConcurrencyController, Lease, ParallelController, SegmentMutexController,
    SemaphoreController, SequentialController,
};

/// Where a retry decision is being made from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySource {
    /// The message handler itself failed
    MessageHandler,
    /// The error orchestration (including the user error hook) failed
    ErrorHandlerError,
}

impl RetrySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageHandler => "message-handler",
            Self::ErrorHandlerError => "error-handler-error",
        }
    }
}

pub trait ProcessingTimeoutStrategy: Send + Sync {
    fn timeout(&self, message: &StoredMessage) -> Duration;
}

/// Same timeout for every message
pub struct FixedTimeout(pub Duration);

impl ProcessingTimeoutStrategy for FixedTimeout {
    fn timeout(&self, _message: &StoredMessage) -> Duration {
        self.0
    }
}

pub trait IsolationLevelStrategy: Send + Sync {
    fn isolation_level(&self, message: &StoredMessage) -> Option<IsolationLevel>;
}

/// Database default isolation for every message
pub struct DefaultIsolation;

impl IsolationLevelStrategy for DefaultIsolation {
    fn isolation_level(&self, _message: &StoredMessage) -> Option<IsolationLevel> {
        None
    }
}

/// One fixed isolation level for every message
pub struct FixedIsolation(pub IsolationLevel);

impl IsolationLevelStrategy for FixedIsolation {
    fn isolation_level(&self, _message: &StoredMessage) -> Option<IsolationLevel> {
        Some(self.0)
    }
}

/// Supplies the database client used to process a message
#[async_trait]
pub trait ClientProvider: Send + Sync {
    fn pool(&self, message: &StoredMessage) -> &PgPool;

    async fn shutdown(&self);
}

/// One shared pool for every message; closed on listener shutdown
pub struct SharedPool(pub PgPool);

#[async_trait]
impl ClientProvider for SharedPool {
    fn pool(&self, _message: &StoredMessage) -> &PgPool {
        &self.0
    }

    async fn shutdown(&self) {
        self.0.close().await;
    }
}

pub trait RetryStrategy: Send + Sync {
    fn should_retry(
        &self,
        message: &StoredMessage,
        error: Option<&ListenerError>,
        source: RetrySource,
    ) -> bool;
}

/// Default retry policy:
/// serialization/deadlock errors retry up to `max(max_attempts, 100)`
/// attempts, orchestration failures never retry, everything else retries
/// while `finished_attempts < max_attempts` (or always, when max-attempts
/// protection is disabled).
pub struct DefaultRetry {
    pub max_attempts: i32,
    pub enabled: bool,
}

impl RetryStrategy for DefaultRetry {
    fn should_retry(
        &self,
        message: &StoredMessage,
        error: Option<&ListenerError>,
        source: RetrySource,
    ) -> bool {
        match source {
            RetrySource::ErrorHandlerError => false,
            RetrySource::MessageHandler => {
                if error.is_some_and(ListenerError::is_serialization_error) {
                    return message.finished_attempts < self.max_attempts.max(100);
                }
                if !self.enabled {
                    return true;
                }
                message.finished_attempts < self.max_attempts
            }
        }
    }
}

pub trait PoisonousRetryStrategy: Send + Sync {
    /// Whether a message with a suspicious attempt gap deserves another try
    fn should_reattempt(&self, message: &StoredMessage) -> bool;
}

pub struct DefaultPoisonousRetry {
    pub max_poisonous_attempts: i32,
}

impl PoisonousRetryStrategy for DefaultPoisonousRetry {
    fn should_reattempt(&self, message: &StoredMessage) -> bool {
        message.attempt_gap() < self.max_poisonous_attempts
    }
}

pub trait NotFoundRetryStrategy: Send + Sync {
    /// `Some(delay)` re-checks the row after the delay; `None` gives up.
    fn retry_delay(&self, message: &StoredMessage, attempt: u32) -> Option<Duration>;
}

pub struct DefaultNotFoundRetry {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl NotFoundRetryStrategy for DefaultNotFoundRetry {
    fn retry_delay(&self, _message: &StoredMessage, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then_some(self.delay)
    }
}

pub trait BatchSizeStrategy: Send + Sync {
    fn next_batch_size(&self) -> u32;
}

/// Ramps from 1 to the configured maximum across successive polls, so a
/// poisonous cluster at boot taints one message instead of a whole batch.
pub struct RampUpBatchSize {
    max: u32,
    polls: AtomicU32,
}

impl RampUpBatchSize {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            polls: AtomicU32::new(0),
        }
    }
}

impl BatchSizeStrategy for RampUpBatchSize {
    fn next_batch_size(&self) -> u32 {
        let polls = self.polls.fetch_add(1, Ordering::Relaxed);
        polls.saturating_add(1).min(self.max)
    }
}

/// Same batch size on every poll
pub struct FixedBatchSize(pub u32);

impl BatchSizeStrategy for FixedBatchSize {
    fn next_batch_size(&self) -> u32 {
        self.0.max(1)
    }
}

pub trait RestartDelayStrategy: Send + Sync {
    fn restart_delay(&self, error: &anyhow::Error) -> Duration;
}

/// Short delay on ordinary failures; a much longer one when the replication
/// slot is held by another process, since that rarely clears quickly.
pub struct DefaultRestartDelay {
    pub delay: Duration,
    pub slot_in_use_delay: Duration,
}

impl RestartDelayStrategy for DefaultRestartDelay {
    fn restart_delay(&self, error: &anyhow::Error) -> Duration {
        if is_slot_in_use(error) {
            self.slot_in_use_delay
        } else {
            self.delay
        }
    }
}

fn is_slot_in_use(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<tokio_postgres::Error>())
        .filter_map(tokio_postgres::Error::as_db_error)
        .any(|db| {
            *db.code() == SqlState::OBJECT_IN_USE
                || db.message().contains("replication slot")
        })
}

/// The full strategy record shared across the listener
pub struct Strategies {
    pub timeout: Arc<dyn ProcessingTimeoutStrategy>,
    pub isolation: Arc<dyn IsolationLevelStrategy>,
    pub client: Arc<dyn ClientProvider>,
    pub retry: Arc<dyn RetryStrategy>,
    pub poisonous: Arc<dyn PoisonousRetryStrategy>,
    pub not_found: Arc<dyn NotFoundRetryStrategy>,
    pub batch_size: Arc<dyn BatchSizeStrategy>,
    pub concurrency: Arc<dyn ConcurrencyController>,
    pub restart_delay: Arc<dyn RestartDelayStrategy>,
}

impl Strategies {
    /// The documented defaults, derived from the listener settings
    pub fn defaults(settings: &ListenerSettings, pool: PgPool) -> Self {
        Self {
            timeout: Arc::new(FixedTimeout(settings.message_processing_timeout)),
            isolation: Arc::new(DefaultIsolation),
            client: Arc::new(SharedPool(pool)),
            retry: Arc::new(DefaultRetry {
                max_attempts: settings.max_attempts,
                enabled: settings.enable_max_attempts_protection,
            }),
            poisonous: Arc::new(DefaultPoisonousRetry {
                max_poisonous_attempts: settings.max_poisonous_attempts,
            }),
            not_found: Arc::new(DefaultNotFoundRetry {
                max_attempts: settings.max_message_not_found_attempts,
                delay: settings.max_message_not_found_delay,
            }),
            batch_size: Arc::new(RampUpBatchSize::new(5)),
            concurrency: Arc::new(SequentialController::new()),
            restart_delay: Arc::new(DefaultRestartDelay {
                delay: Duration::from_millis(250),
                slot_in_use_delay: Duration::from_millis(10_000),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn message(started: i32, finished: i32) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            aggregate_type: "movie".to_string(),
            aggregate_id: "1".to_string(),
            message_type: "movie_created".to_string(),
            segment: None,
            concurrency: None,
            payload: json!({}),
            metadata: None,
            created_at: Utc::now(),
            locked_until: None,
            started_attempts: started,
            finished_attempts: finished,
            processed_at: None,
            abandoned_at: None,
        }
    }

    #[test]
    fn error_handler_errors_never_retry() {
        let retry = DefaultRetry {
            max_attempts: 5,
            enabled: true,
        };
        assert!(!retry.should_retry(&message(1, 0), None, RetrySource::ErrorHandlerError));
    }

    #[test]
    fn retry_respects_the_attempt_ceiling() {
        let retry = DefaultRetry {
            max_attempts: 5,
            enabled: true,
        };
        assert!(retry.should_retry(&message(4, 4), None, RetrySource::MessageHandler));
        assert!(!retry.should_retry(&message(5, 5), None, RetrySource::MessageHandler));

        let disabled = DefaultRetry {
            max_attempts: 5,
            enabled: false,
        };
        assert!(disabled.should_retry(&message(50, 50), None, RetrySource::MessageHandler));
    }

    #[test]
    fn serialization_errors_get_a_higher_ceiling() {
        let retry = DefaultRetry {
            max_attempts: 5,
            enabled: true,
        };
        let err = ListenerError::BatchProcessing("not a db error".to_string());
        // A non-serialization error at attempt 50 is past the ceiling
        assert!(!retry.should_retry(&message(50, 50), Some(&err), RetrySource::MessageHandler));
    }

    #[test]
    fn poisonous_gap_check() {
        let poisonous = DefaultPoisonousRetry {
            max_poisonous_attempts: 3,
        };
        assert!(poisonous.should_reattempt(&message(2, 0)));
        assert!(!poisonous.should_reattempt(&message(4, 1)));
    }

    #[test]
    fn not_found_default_gives_up_immediately() {
        let strategy = DefaultNotFoundRetry {
            max_attempts: 0,
            delay: Duration::from_millis(10),
        };
        assert_eq!(strategy.retry_delay(&message(0, 0), 0), None);

        let patient = DefaultNotFoundRetry {
            max_attempts: 2,
            delay: Duration::from_millis(10),
        };
        assert_eq!(
            patient.retry_delay(&message(0, 0), 0),
            Some(Duration::from_millis(10))
        );
        assert_eq!(patient.retry_delay(&message(0, 0), 2), None);
    }

    #[test]
    fn batch_size_ramps_from_one() {
        let batch = RampUpBatchSize::new(5);
        let sizes: Vec<u32> = (0..7).map(|_| batch.next_batch_size()).collect();
        assert_eq!(sizes, vec![1, 2, 3, 4, 5, 5, 5]);
    }

    #[test]
    fn restart_delay_distinguishes_slot_in_use() {
        let strategy = DefaultRestartDelay {
            delay: Duration::from_millis(250),
            slot_in_use_delay: Duration::from_millis(10_000),
        };
        let plain = anyhow::anyhow!("connection refused");
        assert_eq!(strategy.restart_delay(&plain), Duration::from_millis(250));
    }

    #[test]
    fn retry_source_labels() {
        assert_eq!(RetrySource::MessageHandler.as_str(), "message-handler");
        assert_eq!(RetrySource::ErrorHandlerError.as_str(), "error-handler-error");
    }
}
