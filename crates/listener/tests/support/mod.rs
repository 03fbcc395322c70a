//! Shared fixtures for the listener integration tests
//!
//! The message table, the side-effect table and the polling function are
//! consumed by the listener, not owned by it; the tests create them the way
//! a host application's migrations would.

#![allow(dead_code)]

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use postbox_core::{ListenerError, ListenerSettings, NewMessage, StoredMessage, store_message};
use postbox_listener::{HandlerRegistry, MessageHandler, MessageProcessor, Strategies};
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;
use uuid::Uuid;

pub const TABLE: &str = "public.inbox";

const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS inbox (
    id uuid PRIMARY KEY,
    aggregate_type text NOT NULL,
    aggregate_id text NOT NULL,
    message_type text NOT NULL,
    segment text,
    concurrency text,
    payload jsonb NOT NULL,
    metadata jsonb,
    created_at timestamptz NOT NULL DEFAULT clock_timestamp(),
    locked_until timestamptz,
    started_attempts integer NOT NULL DEFAULT 0,
    finished_attempts integer NOT NULL DEFAULT 0,
    processed_at timestamptz,
    abandoned_at timestamptz
)
"#;

const CREATE_SIDE_EFFECTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS handler_side_effects (
    message_id uuid NOT NULL,
    attempt integer NOT NULL
)
"#;

const CREATE_NEXT_MESSAGES_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION next_inbox_messages(max_size integer, lock_ms integer)
    RETURNS SETOF inbox AS $BODY$
DECLARE
    message_row inbox%ROWTYPE;
    ids uuid[];
BEGIN
    SELECT array_agg(id) INTO ids
    FROM (
        SELECT id FROM inbox
        WHERE processed_at IS NULL
          AND abandoned_at IS NULL
          AND (locked_until IS NULL OR locked_until < NOW())
        ORDER BY created_at
        LIMIT max_size
        FOR NO KEY UPDATE SKIP LOCKED
    ) due;

    FOR message_row IN
        UPDATE inbox
        SET started_attempts = started_attempts + 1,
            locked_until = clock_timestamp() + (lock_ms || ' milliseconds')::interval
        WHERE id = ANY(ids)
        RETURNING *
    LOOP
        RETURN NEXT message_row;
    END LOOP;
    RETURN;
END;
$BODY$ LANGUAGE plpgsql
"#;

pub async fn setup(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query(CREATE_MESSAGES_TABLE).execute(pool).await?;
    sqlx::query(CREATE_SIDE_EFFECTS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_NEXT_MESSAGES_FUNCTION)
        .execute(pool)
        .await?;
    Ok(())
}

pub fn movie_message() -> NewMessage {
    NewMessage::new("movie", "1", "movie_created", json!({"t": 1}))
}

pub async fn insert(pool: &PgPool, message: &NewMessage) -> Result<bool, ListenerError> {
    store_message(pool, TABLE, message).await
}

pub async fn fetch(pool: &PgPool, id: Uuid) -> sqlx::Result<StoredMessage> {
    sqlx::query_as::<_, StoredMessage>("SELECT * FROM inbox WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
}

pub async fn seed_counters(
    pool: &PgPool,
    id: Uuid,
    started: i32,
    finished: i32,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE inbox SET started_attempts = $2, finished_attempts = $3 WHERE id = $1")
        .bind(id)
        .bind(started)
        .bind(finished)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn side_effect_count(pool: &PgPool, id: Uuid) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM handler_side_effects WHERE message_id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
}

pub fn build_processor(
    pool: &PgPool,
    settings: ListenerSettings,
    registry: HandlerRegistry,
    tweak: impl FnOnce(&mut Strategies),
) -> MessageProcessor {
    let mut strategies = Strategies::defaults(&settings, pool.clone());
    tweak(&mut strategies);
    MessageProcessor::new(
        Arc::new(registry),
        Arc::new(strategies),
        Arc::new(settings),
    )
}

/// Test handler: writes a side-effect row through the listener's connection,
/// fails a configurable number of initial attempts and records every error
/// hook invocation.
pub struct RecordingHandler {
    pub fail_first: u32,
    pub hook_fails: bool,
    pub sleep: Option<Duration>,
    pub handled: AtomicU32,
    pub concurrent: AtomicI32,
    pub max_concurrent: AtomicI32,
    pub error_calls: StdMutex<Vec<(String, bool)>>,
}

impl RecordingHandler {
    pub fn succeeding() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(fail_first: u32) -> Self {
        Self {
            fail_first,
            hook_fails: false,
            sleep: None,
            handled: AtomicU32::new(0),
            concurrent: AtomicI32::new(0),
            max_concurrent: AtomicI32::new(0),
            error_calls: StdMutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    pub fn slow(sleep: Duration) -> Self {
        let mut handler = Self::succeeding();
        handler.sleep = Some(sleep);
        handler
    }

    pub fn with_failing_hook(mut self) -> Self {
        self.hook_fails = true;
        self
    }

    pub fn handle_count(&self) -> u32 {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn error_calls(&self) -> Vec<(String, bool)> {
        self.error_calls
            .lock()
            .expect("error call log poisoned")
            .clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        message: &StoredMessage,
        conn: &mut PgConnection,
    ) -> anyhow::Result<()> {
        let concurrent = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(concurrent, Ordering::SeqCst);

        if let Some(sleep) = self.sleep {
            tokio::time::sleep(sleep).await;
        }

        let attempt = self.handled.fetch_add(1, Ordering::SeqCst);
        let result = async {
            sqlx::query("INSERT INTO handler_side_effects (message_id, attempt) VALUES ($1, $2)")
                .bind(message.id)
                .bind(attempt as i32)
                .execute(&mut *conn)
                .await?;
            if attempt < self.fail_first {
                anyhow::bail!("handler failure on attempt {attempt}");
            }
            Ok(())
        }
        .await;

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn handle_error(
        &self,
        error: &ListenerError,
        _message: &StoredMessage,
        _conn: &mut PgConnection,
        will_retry: bool,
    ) -> anyhow::Result<()> {
        self.error_calls
            .lock()
            .expect("error call log poisoned")
            .push((error.code().as_str().to_string(), will_retry));
        if self.hook_fails {
            anyhow::bail!("error hook failure");
        }
        Ok(())
    }
}
