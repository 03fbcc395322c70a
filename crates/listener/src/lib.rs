//! Postbox Listener - transactional outbox/inbox draining
//!
//! Turns newly inserted outbox/inbox rows into at-most-one successful
//! handler invocation each, with poisonous-message detection, retry and
//! abandonment accounting, per-message timeouts and two interchangeable
//! acquisition strategies: logical replication and polling.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use postbox_core::{ListenerSettings, ReplicationSettings};
//! use postbox_listener::{HandlerRegistry, run_replication_listener};
//! # use postbox_core::StoredMessage;
//! # struct MovieHandler;
//! # #[async_trait::async_trait]
//! # impl postbox_listener::MessageHandler for MovieHandler {
//! #     async fn handle(
//! #         &self,
//! #         _message: &StoredMessage,
//! #         _conn: &mut sqlx::PgConnection,
//! #     ) -> anyhow::Result<()> { Ok(()) }
//! # }
//!
//! # async fn example(pool: sqlx::PgPool) -> anyhow::Result<()> {
//! let registry = HandlerRegistry::builder()
//!     .register("movie", "movie_created", Arc::new(MovieHandler))
//!     .build()?;
//!
//! run_replication_listener(
//!     pool,
//!     "host=localhost user=app dbname=app",
//!     ListenerSettings::inbox(),
//!     ReplicationSettings::new("postbox_pub", "postbox_slot"),
//!     registry,
//!     None,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

mod accessors;
mod cleanup;
mod handler;
mod orchestrator;
mod polling;
mod processor;
mod replication;
mod strategies;
mod transaction;

use std::sync::Arc;

use postbox_core::{ListenerResult, ListenerSettings, PollingSettings, ReplicationSettings};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

pub use accessors::{
    AccessResult, increment_finished_attempts, increment_started_attempts,
    initiate_message_processing, mark_abandoned, mark_completed,
};
pub use cleanup::delete_expired_messages;
pub use handler::{HandlerRegistry, HandlerRegistryBuilder, MessageHandler};
pub use replication::pgoutput;
pub use processor::{MessageProcessor, ProcessOutcome};
pub use strategies::{
    BatchSizeStrategy, ClientProvider, CompositeController, ConcurrencyController,
    DefaultIsolation, DefaultNotFoundRetry, DefaultPoisonousRetry, DefaultRestartDelay,
    DefaultRetry, FixedBatchSize, FixedIsolation, FixedTimeout, IsolationLevelStrategy, Lease,
    NotFoundRetryStrategy, ParallelController, PoisonousRetryStrategy, ProcessingTimeoutStrategy,
    RampUpBatchSize, RestartDelayStrategy, RetrySource, RetryStrategy, SegmentMutexController,
    SemaphoreController, SequentialController, SharedPool, Strategies,
};
pub use transaction::{IsolationLevel, PgTransaction, begin_with_isolation, commit_or_rollback};

/// Run a replication-fed listener with the default strategies until the
/// shutdown token fires. The pool is closed on exit via the client provider.
pub async fn run_replication_listener(
    pool: PgPool,
    connection_string: impl Into<String>,
    settings: ListenerSettings,
    replication: ReplicationSettings,
    registry: HandlerRegistry,
    shutdown: Option<CancellationToken>,
) -> ListenerResult<()> {
    let mut strategies = Strategies::defaults(&settings, pool.clone());
    strategies.restart_delay = Arc::new(strategies::DefaultRestartDelay {
        delay: replication.restart_delay,
        slot_in_use_delay: replication.restart_delay_slot_in_use,
    });
    run_replication_listener_with_strategies(
        pool,
        connection_string,
        settings,
        replication,
        registry,
        strategies,
        shutdown,
    )
    .await
}

/// As [`run_replication_listener`], with caller-supplied strategies
pub async fn run_replication_listener_with_strategies(
    pool: PgPool,
    connection_string: impl Into<String>,
    settings: ListenerSettings,
    replication: ReplicationSettings,
    registry: HandlerRegistry,
    strategies: Strategies,
    shutdown: Option<CancellationToken>,
) -> ListenerResult<()> {
    let shutdown = shutdown.unwrap_or_default();
    let settings = Arc::new(settings);
    let strategies = Arc::new(strategies);
    let processor = Arc::new(MessageProcessor::new(
        Arc::new(registry),
        Arc::clone(&strategies),
        Arc::clone(&settings),
    ));

    spawn_controller_drain(&strategies, &shutdown);
    let cleanup_task = tokio::spawn(cleanup::run_cleanup(
        pool,
        Arc::clone(&settings),
        shutdown.clone(),
    ));

    replication::run_replication_source(replication::ReplicationSource {
        connection_string: connection_string.into(),
        settings,
        replication,
        processor,
        strategies: Arc::clone(&strategies),
        shutdown,
    })
    .await;

    cleanup_task.await.ok();
    strategies.client.shutdown().await;
    Ok(())
}

/// Run a polling listener with the default strategies until the shutdown
/// token fires. The pool is closed on exit via the client provider.
pub async fn run_polling_listener(
    pool: PgPool,
    settings: ListenerSettings,
    polling: PollingSettings,
    registry: HandlerRegistry,
    shutdown: Option<CancellationToken>,
) -> ListenerResult<()> {
    let mut strategies = Strategies::defaults(&settings, pool.clone());
    strategies.batch_size = Arc::new(strategies::RampUpBatchSize::new(polling.batch_size));
    run_polling_listener_with_strategies(pool, settings, polling, registry, strategies, shutdown)
        .await
}

/// As [`run_polling_listener`], with caller-supplied strategies
pub async fn run_polling_listener_with_strategies(
    pool: PgPool,
    settings: ListenerSettings,
    polling: PollingSettings,
    registry: HandlerRegistry,
    strategies: Strategies,
    shutdown: Option<CancellationToken>,
) -> ListenerResult<()> {
    let shutdown = shutdown.unwrap_or_default();
    let settings = Arc::new(settings);
    let strategies = Arc::new(strategies);
    let processor = Arc::new(MessageProcessor::new(
        Arc::new(registry),
        Arc::clone(&strategies),
        Arc::clone(&settings),
    ));

    spawn_controller_drain(&strategies, &shutdown);
    let cleanup_task = tokio::spawn(cleanup::run_cleanup(
        pool.clone(),
        Arc::clone(&settings),
        shutdown.clone(),
    ));

    polling::run_polling_source(polling::PollingSource {
        pool,
        settings,
        polling,
        processor,
        strategies: Arc::clone(&strategies),
        shutdown,
    })
    .await;

    cleanup_task.await.ok();
    strategies.client.shutdown().await;
    Ok(())
}

/// Cancel the concurrency controller when shutdown fires, so pending lease
/// acquisitions drain instead of waiting forever
fn spawn_controller_drain(strategies: &Arc<Strategies>, shutdown: &CancellationToken) {
    let strategies = Arc::clone(strategies);
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        strategies.concurrency.cancel();
    });
}
