//! pgoutput wire decoding for the logical replication stream
//!
//! Covers the subset of the protocol the listener needs: the CopyData frame
//! envelope (XLogData and keepalives), the standby status update sent back to
//! the server, and the v1 logical messages Begin/Commit/Relation/Insert.
//! Column values arrive in text format and are mapped onto a
//! [`StoredMessage`] by relation column name.

use std::collections::HashMap;

use anyhow::{Context, bail, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use postbox_core::StoredMessage;

/// Byte position in the write-ahead log
pub type Lsn = u64;

/// Microseconds between the Unix and PostgreSQL (2000-01-01) epochs
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

pub fn format_lsn(lsn: Lsn) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

pub fn parse_lsn(raw: &str) -> Option<Lsn> {
    let (hi, lo) = raw.split_once('/')?;
    let hi = u64::from_str_radix(hi, 16).ok()?;
    let lo = u64::from_str_radix(lo, 16).ok()?;
    Some((hi << 32) | lo)
}

fn pg_epoch_micros_now() -> i64 {
    Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

/// One CopyData payload received from the server
#[derive(Debug)]
pub enum ReplicationFrame {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        data: Bytes,
    },
    Keepalive {
        wal_end: Lsn,
        reply_requested: bool,
    },
}

pub fn parse_frame(mut buf: Bytes) -> anyhow::Result<ReplicationFrame> {
    ensure!(!buf.is_empty(), "empty replication frame");
    match buf.get_u8() {
        b'w' => {
            ensure!(buf.remaining() >= 24, "truncated XLogData header");
            let wal_start = buf.get_u64();
            let wal_end = buf.get_u64();
            let _send_time = buf.get_i64();
            Ok(ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                data: buf,
            })
        }
        b'k' => {
            ensure!(buf.remaining() >= 17, "truncated keepalive");
            let wal_end = buf.get_u64();
            let _send_time = buf.get_i64();
            let reply_requested = buf.get_u8() != 0;
            Ok(ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
            })
        }
        tag => bail!("unexpected replication frame tag {tag:#04x}"),
    }
}

/// Standby status update acknowledging everything up to and including `lsn`
pub fn encode_status_update(lsn: Lsn, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(lsn); // written
    buf.put_u64(lsn); // flushed
    buf.put_u64(lsn); // applied
    buf.put_i64(pg_epoch_micros_now());
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

#[derive(Debug, Clone)]
pub struct RelationColumn {
    pub name: String,
    pub type_oid: u32,
}

/// Table metadata announced by the server before the first change
#[derive(Debug, Clone)]
pub struct Relation {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug)]
pub enum LogicalMessage {
    Begin { final_lsn: Lsn },
    Commit { end_lsn: Lsn },
    Relation(Relation),
    Insert {
        relation_oid: u32,
        columns: Vec<Option<String>>,
    },
    /// Origin, Type, Update, Delete, Truncate, …; not needed here
    Other(u8),
}

pub fn parse_logical_message(mut buf: Bytes) -> anyhow::Result<LogicalMessage> {
    ensure!(!buf.is_empty(), "empty logical message");
    match buf.get_u8() {
        b'B' => {
            ensure!(buf.remaining() >= 20, "truncated Begin");
            let final_lsn = buf.get_u64();
            let _commit_timestamp = buf.get_i64();
            let _xid = buf.get_u32();
            Ok(LogicalMessage::Begin { final_lsn })
        }
        b'C' => {
            ensure!(buf.remaining() >= 25, "truncated Commit");
            let _flags = buf.get_u8();
            let _commit_lsn = buf.get_u64();
            let end_lsn = buf.get_u64();
            let _commit_timestamp = buf.get_i64();
            Ok(LogicalMessage::Commit { end_lsn })
        }
        b'R' => {
            let oid = buf.get_u32();
            let namespace = get_cstr(&mut buf)?;
            let name = get_cstr(&mut buf)?;
            let _replica_identity = buf.get_u8();
            let column_count = buf.get_i16();
            ensure!(column_count >= 0, "negative relation column count");
            let mut columns = Vec::with_capacity(column_count as usize);
            for _ in 0..column_count {
                let _flags = buf.get_u8();
                let column_name = get_cstr(&mut buf)?;
                let type_oid = buf.get_u32();
                let _type_modifier = buf.get_i32();
                columns.push(RelationColumn {
                    name: column_name,
                    type_oid,
                });
            }
            Ok(LogicalMessage::Relation(Relation {
                oid,
                namespace,
                name,
                columns,
            }))
        }
        b'I' => {
            let relation_oid = buf.get_u32();
            let tuple_kind = buf.get_u8();
            ensure!(
                tuple_kind == b'N',
                "unexpected tuple kind {tuple_kind:#04x} in Insert"
            );
            let columns = parse_tuple(&mut buf)?;
            Ok(LogicalMessage::Insert {
                relation_oid,
                columns,
            })
        }
        tag => Ok(LogicalMessage::Other(tag)),
    }
}

fn parse_tuple(buf: &mut Bytes) -> anyhow::Result<Vec<Option<String>>> {
    let column_count = buf.get_i16();
    ensure!(column_count >= 0, "negative tuple column count");
    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        match buf.get_u8() {
            b'n' | b'u' => columns.push(None),
            b't' => {
                let len = buf.get_i32();
                ensure!(len >= 0, "negative column length");
                let len = len as usize;
                ensure!(buf.remaining() >= len, "truncated column value");
                let raw = buf.split_to(len);
                columns.push(Some(
                    String::from_utf8(raw.to_vec()).context("non-utf8 column value")?,
                ));
            }
            kind => bail!("unsupported tuple column kind {kind:#04x}"),
        }
    }
    Ok(columns)
}

fn get_cstr(buf: &mut Bytes) -> anyhow::Result<String> {
    let end = buf
        .iter()
        .position(|byte| *byte == 0)
        .context("unterminated string in logical message")?;
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec()).context("non-utf8 string in logical message")
}

/// Stateful decoder tracking relation metadata and filtering for INSERTs on
/// the watched table
pub struct PgOutputDecoder {
    watched_schema: String,
    watched_table: String,
    relations: HashMap<u32, Relation>,
}

impl PgOutputDecoder {
    pub fn new(watched_schema: impl Into<String>, watched_table: impl Into<String>) -> Self {
        Self {
            watched_schema: watched_schema.into(),
            watched_table: watched_table.into(),
            relations: HashMap::new(),
        }
    }

    /// Feed one XLogData payload. Returns a message for INSERTs on the
    /// watched table, `None` for everything else.
    pub fn decode(&mut self, data: Bytes) -> anyhow::Result<Option<StoredMessage>> {
        match parse_logical_message(data)? {
            LogicalMessage::Relation(relation) => {
                self.relations.insert(relation.oid, relation);
                Ok(None)
            }
            LogicalMessage::Insert {
                relation_oid,
                columns,
            } => {
                let relation = self
                    .relations
                    .get(&relation_oid)
                    .with_context(|| format!("insert for unannounced relation {relation_oid}"))?;
                if relation.namespace != self.watched_schema
                    || relation.name != self.watched_table
                {
                    return Ok(None);
                }
                build_message(relation, &columns).map(Some)
            }
            LogicalMessage::Begin { .. }
            | LogicalMessage::Commit { .. }
            | LogicalMessage::Other(_) => Ok(None),
        }
    }
}

fn build_message(relation: &Relation, columns: &[Option<String>]) -> anyhow::Result<StoredMessage> {
    ensure!(
        relation.columns.len() == columns.len(),
        "tuple has {} columns but relation {} has {}",
        columns.len(),
        relation.name,
        relation.columns.len()
    );

    let mut fields: HashMap<&str, Option<&str>> = HashMap::with_capacity(columns.len());
    for (meta, value) in relation.columns.iter().zip(columns) {
        fields.insert(meta.name.as_str(), value.as_deref());
    }

    Ok(StoredMessage {
        id: required(&fields, "id")?
            .parse()
            .context("invalid message id")?,
        aggregate_type: required(&fields, "aggregate_type")?.to_string(),
        aggregate_id: required(&fields, "aggregate_id")?.to_string(),
        message_type: required(&fields, "message_type")?.to_string(),
        segment: optional(&fields, "segment").map(str::to_string),
        concurrency: optional(&fields, "concurrency").map(str::to_string),
        payload: serde_json::from_str(required(&fields, "payload")?)
            .context("invalid payload json")?,
        metadata: optional(&fields, "metadata")
            .map(serde_json::from_str)
            .transpose()
            .context("invalid metadata json")?,
        created_at: parse_timestamptz(required(&fields, "created_at")?)?,
        locked_until: optional(&fields, "locked_until")
            .map(parse_timestamptz)
            .transpose()?,
        started_attempts: required(&fields, "started_attempts")?
            .parse()
            .context("invalid started_attempts")?,
        finished_attempts: required(&fields, "finished_attempts")?
            .parse()
            .context("invalid finished_attempts")?,
        processed_at: optional(&fields, "processed_at")
            .map(parse_timestamptz)
            .transpose()?,
        abandoned_at: optional(&fields, "abandoned_at")
            .map(parse_timestamptz)
            .transpose()?,
    })
}

fn required<'a>(
    fields: &HashMap<&str, Option<&'a str>>,
    name: &str,
) -> anyhow::Result<&'a str> {
    fields
        .get(name)
        .copied()
        .flatten()
        .with_context(|| format!("column {name} missing or null"))
}

fn optional<'a>(fields: &HashMap<&str, Option<&'a str>>, name: &str) -> Option<&'a str> {
    fields.get(name).copied().flatten()
}

/// PostgreSQL renders timestamptz as `2026-08-01 12:34:56.789+00` in text
/// format; ISO `T` separators show up via some poolers.
fn parse_timestamptz(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Ok(parsed.with_timezone(&Utc));
        }
    }
    bail!("unparseable timestamptz {raw:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_cstr(buf: &mut BytesMut, value: &str) {
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }

    fn relation_message(oid: u32, namespace: &str, name: &str, columns: &[&str]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(oid);
        put_cstr(&mut buf, namespace);
        put_cstr(&mut buf, name);
        buf.put_u8(b'd');
        buf.put_i16(columns.len() as i16);
        for column in columns {
            buf.put_u8(0);
            put_cstr(&mut buf, column);
            buf.put_u32(25); // text
            buf.put_i32(-1);
        }
        buf.freeze()
    }

    fn insert_message(oid: u32, values: &[Option<&str>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(oid);
        buf.put_u8(b'N');
        buf.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(value) => {
                    buf.put_u8(b't');
                    buf.put_i32(value.len() as i32);
                    buf.put_slice(value.as_bytes());
                }
                None => buf.put_u8(b'n'),
            }
        }
        buf.freeze()
    }

    const MESSAGE_COLUMNS: [&str; 14] = [
        "id",
        "aggregate_type",
        "aggregate_id",
        "message_type",
        "segment",
        "concurrency",
        "payload",
        "metadata",
        "created_at",
        "locked_until",
        "started_attempts",
        "finished_attempts",
        "processed_at",
        "abandoned_at",
    ];

    #[test]
    fn lsn_round_trip() {
        assert_eq!(format_lsn(0x1_0000_002A), "1/2A");
        assert_eq!(parse_lsn("1/2A"), Some(0x1_0000_002A));
        assert_eq!(parse_lsn("0/0"), Some(0));
        assert_eq!(parse_lsn("garbage"), None);
    }

    #[test]
    fn keepalive_frame_parses() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(42);
        buf.put_i64(0);
        buf.put_u8(1);

        match parse_frame(buf.freeze()).expect("frame") {
            ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
            } => {
                assert_eq!(wal_end, 42);
                assert!(reply_requested);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn xlogdata_frame_carries_payload() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(10);
        buf.put_u64(20);
        buf.put_i64(0);
        buf.put_slice(b"payload");

        match parse_frame(buf.freeze()).expect("frame") {
            ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                data,
            } => {
                assert_eq!(wal_start, 10);
                assert_eq!(wal_end, 20);
                assert_eq!(&data[..], b"payload");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn status_update_layout() {
        let update = encode_status_update(0xDEAD_BEEF, true);
        assert_eq!(update.len(), 34);
        assert_eq!(update[0], b'r');
        let mut written = [0u8; 8];
        written.copy_from_slice(&update[1..9]);
        assert_eq!(u64::from_be_bytes(written), 0xDEAD_BEEF);
        assert_eq!(update[33], 1);
    }

    #[test]
    fn decodes_insert_on_watched_table() {
        let mut decoder = PgOutputDecoder::new("public", "outbox");

        let relation = relation_message(1234, "public", "outbox", &MESSAGE_COLUMNS);
        assert!(decoder.decode(relation).expect("relation").is_none());

        let insert = insert_message(
            1234,
            &[
                Some("11111111-1111-1111-1111-111111111111"),
                Some("movie"),
                Some("42"),
                Some("movie_created"),
                None,
                Some("sequential"),
                Some(r#"{"t":1}"#),
                None,
                Some("2026-08-01 09:15:00.123456+00"),
                None,
                Some("0"),
                Some("0"),
                None,
                None,
            ],
        );

        let message = decoder
            .decode(insert)
            .expect("decode")
            .expect("watched insert");
        assert_eq!(
            message.id.to_string(),
            "11111111-1111-1111-1111-111111111111"
        );
        assert_eq!(message.aggregate_type, "movie");
        assert_eq!(message.message_type, "movie_created");
        assert_eq!(message.payload["t"], 1);
        assert_eq!(message.started_attempts, 0);
        assert!(message.processed_at.is_none());
    }

    #[test]
    fn ignores_inserts_on_other_tables() {
        let mut decoder = PgOutputDecoder::new("public", "outbox");
        let relation = relation_message(99, "public", "movies", &["id"]);
        decoder.decode(relation).expect("relation");

        let insert = insert_message(99, &[Some("1")]);
        assert!(decoder.decode(insert).expect("decode").is_none());
    }

    #[test]
    fn begin_and_commit_are_transparent() {
        let mut decoder = PgOutputDecoder::new("public", "outbox");

        let mut begin = BytesMut::new();
        begin.put_u8(b'B');
        begin.put_u64(7);
        begin.put_i64(0);
        begin.put_u32(1);
        assert!(decoder.decode(begin.freeze()).expect("begin").is_none());

        let mut commit = BytesMut::new();
        commit.put_u8(b'C');
        commit.put_u8(0);
        commit.put_u64(7);
        commit.put_u64(8);
        commit.put_i64(0);
        assert!(decoder.decode(commit.freeze()).expect("commit").is_none());
    }

    #[test]
    fn timestamptz_text_formats() {
        assert!(parse_timestamptz("2026-08-01 09:15:00+00").is_ok());
        assert!(parse_timestamptz("2026-08-01 09:15:00.123+02").is_ok());
        assert!(parse_timestamptz("2026-08-01T09:15:00.123456+00").is_ok());
        assert!(parse_timestamptz("not a timestamp").is_err());
    }
}
