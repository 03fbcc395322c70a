//! Logical replication acquisition
//!
//! A single supervised task subscribes to the replication slot, decodes
//! INSERTs on the watched table and feeds them to the processor. Leases are
//! acquired in WAL order; completions acknowledge LSNs so the slot can
//! advance. Any fatal error tears the subscription down and the supervisor
//! restarts it after a strategy-determined backoff from the slot's last
//! acknowledged position.

pub mod pgoutput;

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use postbox_core::{ListenerError, ListenerSettings, ReplicationSettings, StoredMessage};
use tokio::task::JoinSet;
use tokio_postgres::{CopyBothDuplex, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::processor::{MessageProcessor, ProcessOutcome};
use crate::strategies::Strategies;
use self::pgoutput::{
    Lsn, PgOutputDecoder, ReplicationFrame, encode_status_update, format_lsn, parse_frame,
};

/// Keepalives are acknowledged at most this often while idle
const IDLE_ACK_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct ReplicationSource {
    pub connection_string: String,
    pub settings: Arc<ListenerSettings>,
    pub replication: ReplicationSettings,
    pub processor: Arc<MessageProcessor>,
    pub strategies: Arc<Strategies>,
    pub shutdown: CancellationToken,
}

pub(crate) async fn run_replication_source(source: ReplicationSource) {
    info!(
        kind = %source.settings.kind,
        slot = %source.replication.slot,
        publication = %source.replication.publication,
        "replication listener started"
    );

    loop {
        if source.shutdown.is_cancelled() {
            break;
        }

        match subscribe_once(&source).await {
            Ok(()) => break,
            Err(err) => {
                let delay = source.strategies.restart_delay.restart_delay(&err);
                warn!(
                    error = %format!("{err:#}"),
                    delay_ms = delay.as_millis() as u64,
                    "replication subscription failed; restarting"
                );
                tokio::select! {
                    () = source.shutdown.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!(kind = %source.settings.kind, "replication listener stopped");
}

enum StreamEvent {
    Shutdown,
    TaskDone(Option<Result<(Lsn, Lsn, ProcessOutcome), tokio::task::JoinError>>),
    AckTick,
    Frame(Option<Result<Bytes, tokio_postgres::Error>>),
}

/// One subscription lifetime: connect, stream, dispatch, acknowledge.
/// Returns `Ok` only for a graceful shutdown.
async fn subscribe_once(source: &ReplicationSource) -> anyhow::Result<()> {
    let conninfo = replication_conninfo(&source.connection_string);
    let (client, connection) = tokio_postgres::connect(&conninfo, NoTls)
        .await
        .context("replication connect failed")?;
    let connection_task = tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(error = %err, "replication connection closed");
        }
    });

    // 0/0 resumes from the slot's confirmed position
    let start_replication = format!(
        r#"START_REPLICATION SLOT "{}" LOGICAL 0/0 (proto_version '1', publication_names '"{}"')"#,
        source.replication.slot, source.replication.publication
    );
    let duplex = client
        .copy_both_simple::<Bytes>(&start_replication)
        .await
        .context("START_REPLICATION failed")?;
    tokio::pin!(duplex);

    let mut decoder = PgOutputDecoder::new(&source.settings.db_schema, &source.settings.db_table);
    let mut acks = AckTracker::new();
    let mut inflight: JoinSet<(Lsn, Lsn, ProcessOutcome)> = JoinSet::new();
    let mut ack_timer = tokio::time::interval(IDLE_ACK_INTERVAL);
    ack_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // A retried message must be redelivered; stop taking work, drain, restart.
    let mut draining_for_retry = false;

    let result: anyhow::Result<()> = loop {
        if draining_for_retry && inflight.is_empty() {
            break Err(anyhow::anyhow!(
                "restarting subscription to redeliver a retried message"
            ));
        }

        let event = tokio::select! {
            () = source.shutdown.cancelled() => StreamEvent::Shutdown,
            joined = inflight.join_next(), if !inflight.is_empty() => StreamEvent::TaskDone(joined),
            _ = ack_timer.tick() => StreamEvent::AckTick,
            frame = duplex.next() => StreamEvent::Frame(frame),
        };

        match event {
            StreamEvent::Shutdown => break Ok(()),
            StreamEvent::TaskDone(joined) => match joined {
                Some(Ok((wal_start, wal_end, outcome))) => match outcome {
                    ProcessOutcome::Completed
                    | ProcessOutcome::Skipped
                    | ProcessOutcome::Abandoned => acks.complete(wal_start, wal_end),
                    ProcessOutcome::Retry => {
                        acks.forget(wal_start);
                        draining_for_retry = true;
                    }
                },
                Some(Err(join_err)) => {
                    warn!(error = %join_err, "processing task failed");
                    draining_for_retry = true;
                }
                None => {}
            },
            StreamEvent::AckTick => {
                if let Some(lsn) = acks.pending_send() {
                    send_status(duplex.as_mut(), lsn, false).await?;
                    acks.mark_sent(lsn);
                }
            }
            StreamEvent::Frame(frame) => {
                let bytes = frame.context("replication stream ended")??;
                match parse_frame(bytes)? {
                    ReplicationFrame::Keepalive {
                        wal_end,
                        reply_requested,
                    } => {
                        if !draining_for_retry {
                            acks.idle_advance(wal_end);
                        }
                        if reply_requested {
                            let lsn = acks.confirmed();
                            send_status(duplex.as_mut(), lsn, false).await?;
                            acks.mark_sent(lsn);
                        }
                    }
                    ReplicationFrame::XLogData {
                        wal_start,
                        wal_end,
                        data,
                    } => match decoder.decode(data)? {
                        Some(message) if !draining_for_retry => {
                            dispatch(source, &mut acks, &mut inflight, wal_start, wal_end, message)
                                .await?;
                        }
                        Some(message) => {
                            debug!(message_id = %message.id, "draining; leaving message for redelivery");
                        }
                        None => {
                            if !draining_for_retry {
                                acks.idle_advance(wal_end);
                            }
                        }
                    },
                }
            }
        }
    };

    // Let in-flight work finish (bounded by the processing timeout), then
    // confirm what actually completed.
    while let Some(joined) = inflight.join_next().await {
        if let Ok((wal_start, wal_end, outcome)) = joined {
            match outcome {
                ProcessOutcome::Completed | ProcessOutcome::Skipped | ProcessOutcome::Abandoned => {
                    acks.complete(wal_start, wal_end);
                }
                ProcessOutcome::Retry => acks.forget(wal_start),
            }
        }
    }
    if let Some(lsn) = acks.pending_send() {
        if send_status(duplex.as_mut(), lsn, false).await.is_ok() {
            acks.mark_sent(lsn);
        }
    }
    debug!(confirmed = %format_lsn(acks.confirmed()), "subscription closed");

    connection_task.abort();
    result
}

/// Acquire the lease in WAL order, then hand the message to its own task
async fn dispatch(
    source: &ReplicationSource,
    acks: &mut AckTracker,
    inflight: &mut JoinSet<(Lsn, Lsn, ProcessOutcome)>,
    wal_start: Lsn,
    wal_end: Lsn,
    mut message: StoredMessage,
) -> anyhow::Result<()> {
    let lease = match source.strategies.concurrency.acquire(&message).await {
        Ok(lease) => lease,
        Err(ListenerError::ListenerStopped) => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    acks.begin(wal_start);
    let processor = Arc::clone(&source.processor);
    inflight.spawn(async move {
        let cancel = CancellationToken::new();
        let outcome = processor.process(&mut message, &cancel, true).await;
        drop(lease);
        (wal_start, wal_end, outcome)
    });
    Ok(())
}

async fn send_status(
    mut duplex: Pin<&mut CopyBothDuplex<Bytes>>,
    lsn: Lsn,
    reply_requested: bool,
) -> anyhow::Result<()> {
    duplex
        .send(encode_status_update(lsn, reply_requested))
        .await
        .context("standby status update failed")
}

/// Append the startup parameter that switches the connection into logical
/// replication mode; works for both URL and keyword/value connection strings.
fn replication_conninfo(base: &str) -> String {
    if base.contains("://") {
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}replication=database")
    } else {
        format!("{base} replication=database")
    }
}

/// Tracks which LSNs are safe to confirm.
///
/// The confirmed position never moves past the start of an unfinished
/// message, so a crash or retry always redelivers it. Idle advances (from
/// keepalives and foreign-table traffic) only apply while nothing is in
/// flight.
struct AckTracker {
    outstanding: BTreeSet<Lsn>,
    done_max: Lsn,
    sent: Lsn,
}

impl AckTracker {
    fn new() -> Self {
        Self {
            outstanding: BTreeSet::new(),
            done_max: 0,
            sent: 0,
        }
    }

    fn begin(&mut self, wal_start: Lsn) {
        self.outstanding.insert(wal_start);
    }

    fn complete(&mut self, wal_start: Lsn, wal_end: Lsn) {
        self.outstanding.remove(&wal_start);
        self.done_max = self.done_max.max(wal_end);
    }

    /// Drop an outstanding entry without confirming it (retry path)
    fn forget(&mut self, wal_start: Lsn) {
        self.outstanding.remove(&wal_start);
        // Keep the confirmed position below the retried message
        self.done_max = self.done_max.min(wal_start.saturating_sub(1));
    }

    fn idle_advance(&mut self, wal_end: Lsn) {
        if self.outstanding.is_empty() {
            self.done_max = self.done_max.max(wal_end);
        }
    }

    fn confirmed(&self) -> Lsn {
        match self.outstanding.first() {
            Some(&lowest) => self.done_max.min(lowest.saturating_sub(1)),
            None => self.done_max,
        }
    }

    fn pending_send(&self) -> Option<Lsn> {
        let confirmed = self.confirmed();
        (confirmed > self.sent).then_some(confirmed)
    }

    fn mark_sent(&mut self, lsn: Lsn) {
        self.sent = self.sent.max(lsn);
    }
}
