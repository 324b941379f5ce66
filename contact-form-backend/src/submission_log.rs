use crate::key_value::KeyValueStore;
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};
use tracing::warn;

const LOG_NAMESPACE: &str = "ip-logs";
const NOT_AVAILABLE: &str = "N/A";
const MESSAGE_PREVIEW_CHARS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Success,
    Blocked,
    RecaptchaFailed,
}

/// The parts of a submission worth keeping. Absent fields are logged as `N/A`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmissionSummary<'a> {
    pub email: Option<&'a str>,
    pub name: Option<&'a str>,
    pub service: Option<&'a str>,
    pub message: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub status: SubmissionStatus,
    pub email: String,
    pub name: String,
    pub service: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        ip: &str,
        status: SubmissionStatus,
        summary: SubmissionSummary,
    ) -> Self {
        fn or_not_available(value: Option<&str>) -> String {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(NOT_AVAILABLE)
                .to_string()
        }
        Self {
            timestamp,
            ip: ip.into(),
            status,
            email: or_not_available(summary.email),
            name: or_not_available(summary.name),
            service: or_not_available(summary.service),
            message: or_not_available(
                summary
                    .message
                    .map(|message| preview(message, MESSAGE_PREVIEW_CHARS)),
            ),
        }
    }

    fn key(&self) -> String {
        format!(
            "{}-{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.ip
        )
    }
}

fn preview(message: &str, max_chars: usize) -> &str {
    match message.char_indices().nth(max_chars) {
        Some((index, _)) => &message[..index],
        None => message,
    }
}

/// An append-only record of submission outcomes per sender IP.
#[derive(Clone)]
pub struct SubmissionLog {
    store: Arc<dyn KeyValueStore>,
}

impl SubmissionLog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Best effort: a failure is logged and otherwise ignored.
    pub async fn record(
        &self,
        ip: &str,
        status: SubmissionStatus,
        summary: SubmissionSummary<'_>,
    ) {
        let record = LogRecord::new(Utc::now(), ip, status, summary);
        if let Err(error) = self.append(&record).await {
            warn!("Could not record {status:?} submission from {ip}: {error:#}");
        }
    }

    async fn append(&self, record: &LogRecord) -> anyhow::Result<()> {
        let value = serde_json::to_string(record)?;
        self.store
            .set(LOG_NAMESPACE, &record.key(), &value)
            .await
            .context("Error writing submission log")
    }

    /// All readable records, newest first.
    pub async fn recent(&self) -> anyhow::Result<Vec<LogRecord>> {
        let keys = self
            .store
            .list(LOG_NAMESPACE)
            .await
            .context("Error listing submission logs")?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read(&key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(error) => warn!("Skipping submission log {key}: {error:#}"),
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<LogRecord>> {
        let Some(value) = self.store.get(LOG_NAMESPACE, key).await? else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_str(&value).context("Malformed submission log")?,
        ))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub total: usize,
    pub successful: usize,
    pub blocked: usize,
    pub recaptcha_failed: usize,
    pub unique_ips: usize,
}

impl LogStats {
    pub fn from_records(records: &[LogRecord]) -> Self {
        let count = |status: SubmissionStatus| {
            records
                .iter()
                .filter(|record| record.status == status)
                .count()
        };
        Self {
            total: records.len(),
            successful: count(SubmissionStatus::Success),
            blocked: count(SubmissionStatus::Blocked),
            recaptcha_failed: count(SubmissionStatus::RecaptchaFailed),
            unique_ips: records
                .iter()
                .map(|record| record.ip.as_str())
                .collect::<HashSet<_>>()
                .len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        LogRecord, LogStats, SubmissionLog, SubmissionStatus, SubmissionSummary, LOG_NAMESPACE,
    };
    use crate::key_value::test_support::InMemoryKeyValueStore;
    use chrono::{TimeZone, Utc};
    use googletest::prelude::*;
    use std::sync::Arc;

    fn record_at(seconds: i64, ip: &str, status: SubmissionStatus) -> LogRecord {
        LogRecord::new(
            Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(),
            ip,
            status,
            SubmissionSummary::default(),
        )
    }

    #[googletest::test]
    fn fills_absent_fields_with_not_available() {
        let record = record_at(0, "192.0.2.1", SubmissionStatus::Blocked);

        expect_that!(record.email, eq("N/A"));
        expect_that!(record.name, eq("N/A"));
        expect_that!(record.service, eq("N/A"));
        expect_that!(record.message, eq("N/A"));
    }

    #[test]
    fn keeps_first_hundred_characters_of_message() -> Result<()> {
        let message = "é".repeat(150);
        let record = LogRecord::new(
            Utc::now(),
            "192.0.2.1",
            SubmissionStatus::Success,
            SubmissionSummary {
                message: Some(&message),
                ..Default::default()
            },
        );

        verify_that!(record.message.chars().count(), eq(100))
    }

    #[test]
    fn serializes_status_in_upper_case() -> Result<()> {
        let record = record_at(0, "192.0.2.1", SubmissionStatus::RecaptchaFailed);

        verify_that!(
            serde_json::to_string(&record).unwrap(),
            contains_substring(r#""status":"RECAPTCHA_FAILED""#)
        )
    }

    #[googletest::test]
    #[tokio::test]
    async fn stores_record_under_timestamp_and_ip() {
        let store = Arc::new(InMemoryKeyValueStore::default());
        let subject = SubmissionLog::new(store.clone());

        subject
            .record(
                "192.0.2.1",
                SubmissionStatus::Success,
                SubmissionSummary {
                    email: Some("visitor@example.com"),
                    ..Default::default()
                },
            )
            .await;

        let keys = store.keys(LOG_NAMESPACE);
        expect_that!(keys.len(), eq(1));
        expect_that!(keys[0], ends_with("Z-192.0.2.1"));
    }

    #[tokio::test]
    async fn returns_records_newest_first() -> Result<()> {
        let subject = SubmissionLog::new(Arc::new(InMemoryKeyValueStore::default()));
        subject
            .append(&record_at(10, "192.0.2.2", SubmissionStatus::Blocked))
            .await
            .unwrap();
        subject
            .append(&record_at(20, "192.0.2.3", SubmissionStatus::Success))
            .await
            .unwrap();
        subject
            .append(&record_at(0, "192.0.2.1", SubmissionStatus::Success))
            .await
            .unwrap();

        let records = subject.recent().await.unwrap();

        verify_that!(
            records.iter().map(|r| r.ip.as_str()).collect::<Vec<_>>(),
            elements_are![eq("192.0.2.3"), eq("192.0.2.2"), eq("192.0.2.1")]
        )
    }

    #[tokio::test]
    async fn skips_malformed_records() -> Result<()> {
        use crate::key_value::KeyValueStore;
        let store = Arc::new(InMemoryKeyValueStore::default());
        store
            .set(LOG_NAMESPACE, "garbage", "not json")
            .await
            .unwrap();
        let subject = SubmissionLog::new(store);
        subject
            .append(&record_at(0, "192.0.2.1", SubmissionStatus::Success))
            .await
            .unwrap();

        verify_that!(subject.recent().await.unwrap().len(), eq(1))
    }

    #[tokio::test]
    async fn ignores_store_failure_when_recording() -> Result<()> {
        let store = Arc::new(InMemoryKeyValueStore::default());
        store.set_unavailable(true);
        let subject = SubmissionLog::new(store.clone());

        subject
            .record(
                "192.0.2.1",
                SubmissionStatus::Blocked,
                SubmissionSummary::default(),
            )
            .await;

        verify_that!(store.keys(LOG_NAMESPACE), empty())
    }

    #[test]
    fn counts_statuses_and_unique_ips() -> Result<()> {
        let records = vec![
            record_at(0, "192.0.2.1", SubmissionStatus::Success),
            record_at(1, "192.0.2.1", SubmissionStatus::Blocked),
            record_at(2, "192.0.2.2", SubmissionStatus::RecaptchaFailed),
            record_at(3, "192.0.2.3", SubmissionStatus::Success),
        ];

        verify_that!(
            LogStats::from_records(&records),
            eq(LogStats {
                total: 4,
                successful: 2,
                blocked: 1,
                recaptcha_failed: 1,
                unique_ips: 3,
            })
        )
    }
}
