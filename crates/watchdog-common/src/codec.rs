//! Wire codec for persisted records
//!
//! Durable maps store prost messages with stable numeric tags. Tags are
//! append-only: new fields take fresh tags, and readers skip tags they do not
//! know, so state written by older builds stays readable.

use crate::error::{Error, Result};
use crate::ticks::Ticks;
use crate::types::{HealthCheck, MetricCheck, ScheduledItem};
use prost::Message;
use std::collections::HashMap;
use uuid::Uuid;

/// A record that can round-trip through a durable map
pub trait Persist: Sized {
    fn encode_bytes(&self) -> Vec<u8>;
    fn decode_bytes(buf: &[u8]) -> Result<Self>;
}

#[derive(Clone, PartialEq, Message)]
pub struct HealthCheckRecord {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub service_name: String,
    #[prost(string, optional, tag = "3")]
    pub partition: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub endpoint: Option<String>,
    #[prost(string, tag = "5")]
    pub suffix_path: String,
    #[prost(string, tag = "6")]
    pub method: String,
    #[prost(string, optional, tag = "7")]
    pub content: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub media_type: Option<String>,
    #[prost(uint64, tag = "9")]
    pub frequency_secs: u64,
    #[prost(uint64, tag = "10")]
    pub expected_duration_ms: u64,
    #[prost(uint64, tag = "11")]
    pub maximum_duration_ms: u64,
    #[prost(map = "string, string", tag = "12")]
    pub headers: HashMap<String, String>,
    #[prost(uint32, repeated, tag = "13")]
    pub warning_status_codes: Vec<u32>,
    #[prost(uint32, repeated, tag = "14")]
    pub error_status_codes: Vec<u32>,
    #[prost(int64, optional, tag = "15")]
    pub last_attempt_ticks: Option<i64>,
    #[prost(uint32, tag = "16")]
    pub failure_count: u32,
    #[prost(uint32, tag = "17")]
    pub result_code: u32,
    #[prost(int64, tag = "18")]
    pub duration_ms: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ScheduledItemRecord {
    #[prost(int64, tag = "1")]
    pub execution_ticks: i64,
    #[prost(string, tag = "2")]
    pub key: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct MetricCheckRecord {
    #[prost(string, repeated, tag = "1")]
    pub metric_names: Vec<String>,
    #[prost(string, tag = "2")]
    pub application: String,
    #[prost(string, optional, tag = "3")]
    pub service: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub partition: Option<String>,
}

fn parse_partition(value: Option<&String>) -> Result<Option<Uuid>> {
    value
        .map(|s| {
            Uuid::parse_str(s)
                .map_err(|e| Error::Serialization(format!("bad partition id '{}': {}", s, e)))
        })
        .transpose()
}

fn parse_status_codes(values: &[u32]) -> Result<std::collections::BTreeSet<u16>> {
    values
        .iter()
        .map(|&c| {
            u16::try_from(c)
                .map_err(|_| Error::Serialization(format!("status code {} out of range", c)))
        })
        .collect()
}

impl Persist for HealthCheck {
    fn encode_bytes(&self) -> Vec<u8> {
        let record = HealthCheckRecord {
            name: self.name.clone(),
            service_name: self.service_name.clone(),
            partition: self.partition.map(|p| p.to_string()),
            endpoint: self.endpoint.clone(),
            suffix_path: self.suffix_path.clone(),
            method: self.method.clone(),
            content: self.content.clone(),
            media_type: self.media_type.clone(),
            frequency_secs: self.frequency_secs,
            expected_duration_ms: self.expected_duration_ms,
            maximum_duration_ms: self.maximum_duration_ms,
            headers: self.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            warning_status_codes: self.warning_status_codes.iter().map(|&c| c as u32).collect(),
            error_status_codes: self.error_status_codes.iter().map(|&c| c as u32).collect(),
            last_attempt_ticks: self.last_attempt.map(Ticks::as_i64),
            failure_count: self.failure_count,
            result_code: self.result_code as u32,
            duration_ms: self.duration_ms,
        };
        record.encode_to_vec()
    }

    fn decode_bytes(buf: &[u8]) -> Result<Self> {
        let record = HealthCheckRecord::decode(buf)?;
        Ok(HealthCheck {
            partition: parse_partition(record.partition.as_ref())?,
            warning_status_codes: parse_status_codes(&record.warning_status_codes)?,
            error_status_codes: parse_status_codes(&record.error_status_codes)?,
            result_code: u16::try_from(record.result_code)
                .map_err(|_| Error::Serialization("result code out of range".into()))?,
            name: record.name,
            service_name: record.service_name,
            endpoint: record.endpoint,
            suffix_path: record.suffix_path,
            method: record.method,
            content: record.content,
            media_type: record.media_type,
            frequency_secs: record.frequency_secs,
            expected_duration_ms: record.expected_duration_ms,
            maximum_duration_ms: record.maximum_duration_ms,
            headers: record.headers.into_iter().collect(),
            last_attempt: record.last_attempt_ticks.map(Ticks),
            failure_count: record.failure_count,
            duration_ms: record.duration_ms,
        })
    }
}

impl Persist for ScheduledItem {
    fn encode_bytes(&self) -> Vec<u8> {
        ScheduledItemRecord {
            execution_ticks: self.execution_ticks.as_i64(),
            key: self.key.clone(),
        }
        .encode_to_vec()
    }

    fn decode_bytes(buf: &[u8]) -> Result<Self> {
        let record = ScheduledItemRecord::decode(buf)?;
        Ok(ScheduledItem {
            execution_ticks: Ticks(record.execution_ticks),
            key: record.key,
        })
    }
}

impl Persist for MetricCheck {
    fn encode_bytes(&self) -> Vec<u8> {
        MetricCheckRecord {
            metric_names: self.metric_names.iter().cloned().collect(),
            application: self.application.clone(),
            service: self.service.clone(),
            partition: self.partition.map(|p| p.to_string()),
        }
        .encode_to_vec()
    }

    fn decode_bytes(buf: &[u8]) -> Result<Self> {
        let record = MetricCheckRecord::decode(buf)?;
        Ok(MetricCheck {
            partition: parse_partition(record.partition.as_ref())?,
            metric_names: record.metric_names.into_iter().collect(),
            application: record.application,
            service: record.service,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn full_check() -> HealthCheck {
        HealthCheck {
            name: "hc1".into(),
            service_name: "fabric:/A/B".into(),
            partition: Some(Uuid::new_v4()),
            endpoint: Some("admin".into()),
            suffix_path: "api/values".into(),
            method: "POST".into(),
            content: Some(r#"{"ping":true}"#.into()),
            media_type: Some("application/json".into()),
            frequency_secs: 30,
            expected_duration_ms: 150,
            maximum_duration_ms: 2_000,
            headers: BTreeMap::from([("x-probe".to_string(), "watchdog".to_string())]),
            warning_status_codes: BTreeSet::from([400, 401, 403]),
            error_status_codes: BTreeSet::from([500, 503]),
            last_attempt: Some(Ticks(638_000_000_000_000_000)),
            failure_count: 2,
            result_code: 403,
            duration_ms: 87,
        }
    }

    #[test]
    fn health_check_round_trip_full() {
        let hc = full_check();
        let decoded = HealthCheck::decode_bytes(&hc.encode_bytes()).unwrap();
        assert_eq!(decoded, hc);
    }

    #[test]
    fn health_check_round_trip_minimal() {
        let hc = HealthCheck {
            partition: None,
            endpoint: None,
            content: None,
            media_type: None,
            headers: BTreeMap::new(),
            warning_status_codes: BTreeSet::new(),
            error_status_codes: BTreeSet::new(),
            last_attempt: None,
            failure_count: 0,
            result_code: 0,
            duration_ms: 0,
            ..full_check()
        };
        let decoded = HealthCheck::decode_bytes(&hc.encode_bytes()).unwrap();
        assert_eq!(decoded, hc);
        assert!(decoded.last_attempt.is_none());
    }

    #[test]
    fn scheduled_item_round_trip() {
        let item = ScheduledItem {
            execution_ticks: Ticks(638_000_123_456_789_012),
            key: "/A/B/p1".into(),
        };
        assert_eq!(
            ScheduledItem::decode_bytes(&item.encode_bytes()).unwrap(),
            item
        );
    }

    #[test]
    fn metric_check_round_trip() {
        for (service, partition) in [
            (None, None),
            (Some("Svc".to_string()), None),
            (Some("Svc".to_string()), Some(Uuid::new_v4())),
        ] {
            let mc = MetricCheck {
                metric_names: BTreeSet::from(["reads".to_string(), "writes".to_string()]),
                application: "App".into(),
                service,
                partition,
            };
            assert_eq!(MetricCheck::decode_bytes(&mc.encode_bytes()).unwrap(), mc);
        }
    }

    #[test]
    fn unknown_tags_are_skipped() {
        // A future writer appending a field the current reader does not know:
        // tag 63 varint, payload 1.
        let mut bytes = full_check().encode_bytes();
        bytes.extend_from_slice(&[0xF8, 0x03, 0x01]);
        let decoded = HealthCheck::decode_bytes(&bytes).unwrap();
        assert_eq!(decoded.name, "hc1");
    }

    #[test]
    fn corrupt_partition_is_a_serialization_error() {
        let record = MetricCheckRecord {
            metric_names: vec!["reads".into()],
            application: "App".into(),
            service: Some("Svc".into()),
            partition: Some("not-a-uuid".into()),
        };
        let err = MetricCheck::decode_bytes(&record.encode_to_vec()).unwrap_err();
        assert_eq!(err.category(), "serialization");
    }
}
