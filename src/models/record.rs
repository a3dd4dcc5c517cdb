//! Represents a single chat event accepted from ingress, and the partition it
//! belongs to.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("timestamp {0} is outside the representable calendar range")]
    TimestampOutOfRange(i64),
}

/// Fields ingress decodes from a message body. The body itself is kept
/// verbatim as the record payload.
#[derive(Debug, Deserialize)]
pub struct MessageHeader {
    pub content_id: i64,
    pub client_id: i32,
    pub timestamp: i64,
}

/// An immutable chat event.
///
/// `payload` holds the exact bytes ingress received; it is what ends up in
/// the stored object.
#[derive(Clone, Debug)]
pub struct Record {
    content_id: i64,
    client_id: i32,
    timestamp_millis: i64,
    recorded_at: DateTime<Utc>,
    payload: Bytes,
}

impl Record {
    /// Build a record, rejecting timestamps that cannot be mapped to a date.
    pub fn new(
        content_id: i64,
        client_id: i32,
        timestamp_millis: i64,
        payload: impl Into<Bytes>,
    ) -> Result<Self, RecordError> {
        let recorded_at = DateTime::from_timestamp(timestamp_millis.div_euclid(1000), 0)
            .ok_or(RecordError::TimestampOutOfRange(timestamp_millis))?;

        Ok(Self {
            content_id,
            client_id,
            timestamp_millis,
            recorded_at,
            payload: payload.into(),
        })
    }

    /// Build a record from a decoded header and the raw body it came from.
    pub fn from_message(header: MessageHeader, body: Bytes) -> Result<Self, RecordError> {
        Self::new(header.content_id, header.client_id, header.timestamp, body)
    }

    pub fn content_id(&self) -> i64 {
        self.content_id
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Partition this record routes to when dates are cut at `offset`.
    pub fn partition_key(&self, offset: &FixedOffset) -> PartitionKey {
        let date = self
            .recorded_at
            .with_timezone(offset)
            .format("%Y-%m-%d")
            .to_string();
        PartitionKey(format!(
            "/chat/{date}/content_logs_{date}_{}",
            self.client_id
        ))
    }
}

/// Routing key of a partition: one client's records for one calendar day.
///
/// Before collision resolution it is also the desired storage location.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn record(client_id: i32, timestamp_millis: i64) -> Record {
        Record::new(3, client_id, timestamp_millis, &b"{\"test\": 1}"[..]).unwrap()
    }

    #[test]
    fn key_follows_chat_log_convention() {
        let key = record(2, 946_692_184).partition_key(&utc());
        // 946692 seconds after the epoch is 1970-01-11T22:58:12Z.
        assert_eq!(key.as_str(), "/chat/1970-01-11/content_logs_1970-01-11_2");
    }

    #[test]
    fn key_uses_configured_offset_for_the_calendar_date() {
        let east = FixedOffset::east_opt(2 * 3600).unwrap();
        let key = record(2, 946_692_184).partition_key(&east);
        assert_eq!(key.as_str(), "/chat/1970-01-12/content_logs_1970-01-12_2");
    }

    #[test]
    fn same_client_same_day_share_a_partition() {
        let day_start = 1_704_067_200_000; // 2024-01-01T00:00:00Z
        let a = record(5, day_start).partition_key(&utc());
        let b = record(5, day_start + 86_399_999).partition_key(&utc());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "/chat/2024-01-01/content_logs_2024-01-01_5");
    }

    #[test]
    fn different_client_or_day_split_partitions() {
        let day_start = 1_704_067_200_000;
        let base = record(5, day_start).partition_key(&utc());
        assert_ne!(base, record(6, day_start).partition_key(&utc()));
        assert_ne!(base, record(5, day_start + 86_400_000).partition_key(&utc()));
        assert_ne!(base, record(5, day_start - 1).partition_key(&utc()));
    }

    #[test]
    fn negative_timestamps_floor_to_the_previous_second() {
        let key = record(1, -1).partition_key(&utc());
        assert_eq!(key.as_str(), "/chat/1969-12-31/content_logs_1969-12-31_1");
    }

    #[test]
    fn out_of_range_timestamp_is_rejected() {
        let err = Record::new(1, 1, i64::MAX, Bytes::new()).unwrap_err();
        assert!(matches!(err, RecordError::TimestampOutOfRange(i64::MAX)));
    }

    #[test]
    fn header_decodes_from_message_body() {
        let body = Bytes::from_static(br#"{"content_id":3,"client_id":2,"timestamp":946692184}"#);
        let header: MessageHeader = serde_json::from_slice(&body).unwrap();
        let record = Record::from_message(header, body.clone()).unwrap();
        assert_eq!(record.content_id(), 3);
        assert_eq!(record.client_id(), 2);
        assert_eq!(record.timestamp_millis(), 946_692_184);
        assert_eq!(record.payload(), &body);
    }
}
