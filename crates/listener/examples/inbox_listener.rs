//! Minimal inbox listener wired up from environment variables
//!
//! Requires DATABASE_URL plus POSTBOX_DB_PUBLICATION / POSTBOX_DB_REPLICATION_SLOT
//! for replication mode; run with POSTBOX_MODE=polling to poll instead.

use std::sync::Arc;

use postbox_core::{
    DatabaseSettings, ListenerSettings, MessageKind, PollingSettings, ReplicationSettings,
    StoredMessage, bootstrap,
};
use postbox_listener::{
    HandlerRegistry, MessageHandler, run_polling_listener, run_replication_listener,
};
use sqlx::PgConnection;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct LogHandler;

#[async_trait::async_trait]
impl MessageHandler for LogHandler {
    async fn handle(
        &self,
        message: &StoredMessage,
        _conn: &mut PgConnection,
    ) -> anyhow::Result<()> {
        info!(
            message_id = %message.id,
            aggregate_type = %message.aggregate_type,
            message_type = %message.message_type,
            "handled message"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap::init_env();
    let _guard = bootstrap::init_tracing(MessageKind::Inbox);

    let database = DatabaseSettings::from_env()?;
    let pool = bootstrap::init_db(&database).await?;
    let settings = ListenerSettings::from_env(MessageKind::Inbox)?;
    let registry = HandlerRegistry::catch_all(Arc::new(LogHandler));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
            shutdown.cancel();
        });
    }

    let mode = std::env::var("POSTBOX_MODE").unwrap_or_else(|_| "replication".to_string());
    match mode.as_str() {
        "polling" => {
            let polling = PollingSettings::from_env(MessageKind::Inbox)?;
            run_polling_listener(pool, settings, polling, registry, Some(shutdown)).await?;
        }
        _ => {
            let replication = ReplicationSettings::from_env()?;
            run_replication_listener(
                pool,
                &database.url,
                settings,
                replication,
                registry,
                Some(shutdown),
            )
            .await?;
        }
    }

    Ok(())
}
