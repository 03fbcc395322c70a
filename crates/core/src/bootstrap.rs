//! Process bootstrap helpers for listener services

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::message::MessageKind;
use crate::settings::DatabaseSettings;

/// Load `.env` if present
pub fn init_env() {
    dotenvy::dotenv().ok();
}

/// Console tracing plus, when `LOG_DIR` is set, a daily-rolling JSON file
/// layer labelled with the listener side it serves.
///
/// The default filter keeps the postbox crates at debug and quiets sqlx's
/// per-query logging; `RUST_LOG` overrides it entirely. The returned guard
/// must be held for the lifetime of the process or buffered file output is
/// lost.
pub fn init_tracing(kind: MessageKind) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,postbox_listener=debug,postbox_core=debug,sqlx=warn".into());

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match std::env::var("LOG_DIR") {
        Ok(log_dir) => {
            let file_appender =
                tracing_appender::rolling::daily(&log_dir, format!("postbox-{kind}.log.jsonl"));
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(non_blocking),
                )
                .init();
            Some(guard)
        }
        Err(_) => {
            registry.init();
            None
        }
    }
}

/// Connection pool sized and tuned from [`DatabaseSettings`]
pub async fn init_db(settings: &DatabaseSettings) -> Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .max_lifetime(settings.max_lifetime)
        .connect(&settings.url)
        .await?;

    tracing::info!(
        max_connections = settings.max_connections,
        "database pool established"
    );

    Ok(pool)
}
