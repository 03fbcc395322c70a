//! Row accessors for one message row
//!
//! Every accessor runs against a connection already enrolled in the caller's
//! transaction and re-synchronises the in-memory message from the row it
//! touched (`RETURNING`), so attempt counters always reflect database truth
//! even after out-of-band changes.

use postbox_core::{ListenerResult, StoredMessage};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tracing::instrument;

use crate::strategies::NotFoundRetryStrategy;

/// State of the row after an accessor touched it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResult {
    Ok,
    NotFound,
    AlreadyProcessed,
    Abandoned,
}

/// Bump `started_attempts` before the main processing transaction.
///
/// The nested `FOR UPDATE NOWAIT` fails immediately when another worker holds
/// the row, so concurrent listeners never pile up behind one lock.
#[instrument(skip_all, fields(message_id = %message.id))]
pub async fn increment_started_attempts(
    conn: &mut PgConnection,
    qualified_table: &str,
    message: &mut StoredMessage,
) -> ListenerResult<AccessResult> {
    let sql = format!(
        r#"
        UPDATE {qualified_table}
        SET started_attempts = started_attempts + 1
        WHERE id IN (SELECT id FROM {qualified_table} WHERE id = $1 FOR UPDATE NOWAIT)
        RETURNING started_attempts, finished_attempts, locked_until, processed_at, abandoned_at
        "#
    );

    let row = sqlx::query(&sql)
        .bind(message.id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row) = row else {
        return Ok(AccessResult::NotFound);
    };
    apply_bookkeeping(message, &row)?;
    Ok(classify(message))
}

/// Lock the row for the remainder of the current transaction and load its
/// bookkeeping columns.
///
/// `FOR NO KEY UPDATE NOWAIT` blocks concurrent updates while still allowing
/// concurrent key reads. When the row is not yet visible (a replication
/// announcement can outrun visibility in other sessions under load), the
/// not-found strategy decides how often to re-check and how long to wait.
#[instrument(skip_all, fields(message_id = %message.id))]
pub async fn initiate_message_processing(
    conn: &mut PgConnection,
    qualified_table: &str,
    message: &mut StoredMessage,
    not_found: &dyn NotFoundRetryStrategy,
) -> ListenerResult<AccessResult> {
    let sql = format!(
        r#"
        SELECT started_attempts, finished_attempts, locked_until, processed_at, abandoned_at
        FROM {qualified_table}
        WHERE id = $1
        FOR NO KEY UPDATE NOWAIT
        "#
    );

    let mut attempt: u32 = 0;
    loop {
        let row = sqlx::query(&sql)
            .bind(message.id)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => {
                apply_bookkeeping(message, &row)?;
                return Ok(classify(message));
            }
            None => match not_found.retry_delay(message, attempt) {
                Some(delay) => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                None => return Ok(AccessResult::NotFound),
            },
        }
    }
}

/// Terminal success: sets `processed_at` and counts the finished attempt.
#[instrument(skip_all, fields(message_id = %message.id))]
pub async fn mark_completed(
    conn: &mut PgConnection,
    qualified_table: &str,
    message: &mut StoredMessage,
) -> ListenerResult<()> {
    let sql = format!(
        r#"
        UPDATE {qualified_table}
        SET processed_at = NOW(), finished_attempts = finished_attempts + 1
        WHERE id = $1
        RETURNING finished_attempts, processed_at
        "#
    );

    let row = sqlx::query(&sql)
        .bind(message.id)
        .fetch_one(&mut *conn)
        .await?;
    message.finished_attempts = row.try_get("finished_attempts")?;
    message.processed_at = row.try_get("processed_at")?;
    Ok(())
}

/// Terminal failure: sets `abandoned_at` and counts the finished attempt.
#[instrument(skip_all, fields(message_id = %message.id))]
pub async fn mark_abandoned(
    conn: &mut PgConnection,
    qualified_table: &str,
    message: &mut StoredMessage,
) -> ListenerResult<()> {
    let sql = format!(
        r#"
        UPDATE {qualified_table}
        SET abandoned_at = clock_timestamp(), finished_attempts = finished_attempts + 1
        WHERE id = $1
        RETURNING finished_attempts, abandoned_at
        "#
    );

    let row = sqlx::query(&sql)
        .bind(message.id)
        .fetch_one(&mut *conn)
        .await?;
    message.finished_attempts = row.try_get("finished_attempts")?;
    message.abandoned_at = row.try_get("abandoned_at")?;
    Ok(())
}

/// Count a finished attempt without reaching a terminal state.
#[instrument(skip_all, fields(message_id = %message.id))]
pub async fn increment_finished_attempts(
    conn: &mut PgConnection,
    qualified_table: &str,
    message: &mut StoredMessage,
) -> ListenerResult<()> {
    let sql = format!(
        r#"
        UPDATE {qualified_table}
        SET finished_attempts = finished_attempts + 1
        WHERE id = $1
        RETURNING finished_attempts
        "#
    );

    let row = sqlx::query(&sql)
        .bind(message.id)
        .fetch_one(&mut *conn)
        .await?;
    message.finished_attempts = row.try_get("finished_attempts")?;
    Ok(())
}

fn apply_bookkeeping(message: &mut StoredMessage, row: &PgRow) -> ListenerResult<()> {
    message.started_attempts = row.try_get("started_attempts")?;
    message.finished_attempts = row.try_get("finished_attempts")?;
    message.locked_until = row.try_get("locked_until")?;
    message.processed_at = row.try_get("processed_at")?;
    message.abandoned_at = row.try_get("abandoned_at")?;
    Ok(())
}

fn classify(message: &StoredMessage) -> AccessResult {
    if message.processed_at.is_some() {
        AccessResult::AlreadyProcessed
    } else if message.abandoned_at.is_some() {
        AccessResult::Abandoned
    } else {
        AccessResult::Ok
    }
}
