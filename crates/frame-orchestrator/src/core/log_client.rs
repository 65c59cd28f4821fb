//! Append-only log abstraction (spec §4.1) over Redis Streams.
//!
//! `LogClient` is the seam between the consumption loop/dispatcher and the
//! actual transport. Streams are addressed by name and consumer groups are
//! created lazily; the orchestrator never assumes a particular Redis
//! deployment topology beyond a single `redis_url`.

use std::collections::HashMap;

use async_trait::async_trait;
use frame_proto::WireFields;
use redis::aio::ConnectionManager;
use redis::{RedisError, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogClientError {
    #[error("redis error: {0}")]
    Transient(#[from] RedisError),
    #[error("malformed stream reply: {0}")]
    Protocol(String),
}

/// Returned by [`LogClient::append_bounded`] when the target queue is already
/// at its capacity (spec §4.6 `queue_cap_multiplier`).
#[derive(Debug, Error)]
pub enum AppendError {
    #[error(transparent)]
    Transient(#[from] LogClientError),
    #[error("queue at capacity")]
    QueueFull,
}

/// One unread entry: its stream-assigned id plus the decoded field map.
pub type LogEntry = (String, WireFields);

#[async_trait]
pub trait LogClient: Send + Sync {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogClientError>;

    async fn append(&self, stream: &str, fields: &WireFields) -> Result<String, LogClientError>;

    async fn append_bounded(
        &self,
        stream: &str,
        cap: u64,
        fields: &WireFields,
    ) -> Result<String, AppendError>;

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>, LogClientError>;

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), LogClientError>;

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<LogEntry>, LogClientError>;

    /// Fetches a single entry by id, for admin replay (spec §5). Returns
    /// `None` if the entry has been trimmed or never existed.
    async fn read_by_id(&self, stream: &str, entry_id: &str) -> Result<Option<LogEntry>, LogClientError>;
}

/// Production [`LogClient`] backed by a single `redis::aio::ConnectionManager`
/// (auto-reconnecting, cheaply cloned, safe to share across tasks).
#[derive(Clone)]
pub struct RedisLogClient {
    conn: ConnectionManager,
}

impl RedisLogClient {
    pub async fn connect(url: &str) -> Result<Self, LogClientError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LogClient for RedisLogClient {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), LogClientError> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn append(&self, stream: &str, fields: &WireFields) -> Result<String, LogClientError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn append_bounded(
        &self,
        stream: &str,
        cap: u64,
        fields: &WireFields,
    ) -> Result<String, AppendError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(LogClientError::from)?;

        if len >= cap {
            return Err(AppendError::QueueFull);
        }

        self.append(stream, fields).await.map_err(AppendError::from)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<LogEntry>, LogClientError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        parse_streams_reply(&reply)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), LogClientError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<LogEntry>, LogClientError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let Value::Array(parts) = reply else {
            return Err(LogClientError::Protocol("XAUTOCLAIM reply is not an array".into()));
        };

        // [cursor, entries, deleted-ids] since Redis 7; tolerate the older
        // two-element shape too.
        let entries = parts
            .get(1)
            .ok_or_else(|| LogClientError::Protocol("XAUTOCLAIM reply missing entries".into()))?;
        parse_entry_list(entries)
    }

    async fn read_by_id(&self, stream: &str, entry_id: &str) -> Result<Option<LogEntry>, LogClientError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XRANGE")
            .arg(stream)
            .arg(entry_id)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;

        let entries = parse_entry_list(&reply)?;
        Ok(entries.into_iter().next())
    }
}

fn parse_streams_reply(value: &Value) -> Result<Vec<LogEntry>, LogClientError> {
    let Value::Array(streams) = value else {
        // BLOCK timeout with no new entries replies with nil.
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for stream_entry in streams {
        let Value::Array(pair) = stream_entry else {
            continue;
        };
        let Some(entries) = pair.get(1) else { continue };
        out.extend(parse_entry_list(entries)?);
    }
    Ok(out)
}

fn parse_entry_list(value: &Value) -> Result<Vec<LogEntry>, LogClientError> {
    let Value::Array(entries) = value else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(parts) = entry else {
            continue;
        };
        let Some(Value::BulkString(id_bytes)) = parts.first() else {
            continue;
        };
        let id = String::from_utf8_lossy(id_bytes).into_owned();

        let fields = match parts.get(1) {
            Some(Value::Array(kv)) => parse_field_pairs(kv)?,
            // Entries claimed-but-since-deleted carry a nil field list.
            _ => HashMap::new(),
        };

        out.push((id, fields));
    }
    Ok(out)
}

fn parse_field_pairs(kv: &[Value]) -> Result<WireFields, LogClientError> {
    let mut fields = HashMap::with_capacity(kv.len() / 2);
    let mut iter = kv.iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        let Value::BulkString(key) = key else {
            return Err(LogClientError::Protocol("stream field key not bulk string".into()));
        };
        let Value::BulkString(value) = value else {
            return Err(LogClientError::Protocol("stream field value not bulk string".into()));
        };
        fields.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_field_pairs_builds_map() {
        let kv = vec![
            Value::BulkString(b"frame_id".to_vec()),
            Value::BulkString(b"abc".to_vec()),
            Value::BulkString(b"width".to_vec()),
            Value::BulkString(b"1920".to_vec()),
        ];
        let fields = parse_field_pairs(&kv).unwrap();
        assert_eq!(fields.get("frame_id").map(String::as_str), Some("abc"));
        assert_eq!(fields.get("width").map(String::as_str), Some("1920"));
    }

    #[test]
    fn parse_entry_list_skips_deleted_entries() {
        let entries = Value::Array(vec![Value::Array(vec![
            Value::BulkString(b"1-0".to_vec()),
            Value::Nil,
        ])]);
        let parsed = parse_entry_list(&entries).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "1-0");
        assert!(parsed[0].1.is_empty());
    }

    #[test]
    fn parse_streams_reply_nil_on_block_timeout() {
        let parsed = parse_streams_reply(&Value::Nil).unwrap();
        assert!(parsed.is_empty());
    }
}
