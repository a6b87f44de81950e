//! Tracing setup and the external log sink.
//!
//! `init_tracing` installs the JSON subscriber used by the binary. `LogSink`
//! is a fire-and-forget side-channel for forwarding delivery events to an
//! external collector; it must never slow down or fail message handling.

use std::time::Duration;

use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str =
    "herald_worker=info,herald_broker=info,herald_notifier=info,herald_common=info";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .json()
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// A structured event forwarded to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

pub trait LogSink: Send + Sync {
    /// Hand the event off without waiting for delivery.
    fn emit(&self, event: LogEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl LogSink for NoopSink {
    fn emit(&self, _event: LogEvent) {}
}

/// Posts events to a Fluentd HTTP input at `{base_url}/{service}.{level}`.
#[derive(Debug, Clone)]
pub struct FluentdSink {
    client: reqwest::Client,
    base_url: String,
    service: String,
    environment: String,
}

impl FluentdSink {
    const TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(
        base_url: impl Into<String>,
        service: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service: service.into(),
            environment: environment.into(),
        }
    }

    pub fn tag_url(&self, level: LogLevel) -> String {
        format!("{}/{}.{}", self.base_url, self.service, level.as_str())
    }

    fn record(&self, event: LogEvent) -> serde_json::Value {
        let mut record = serde_json::json!({
            "service": self.service,
            "environment": self.environment,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let (Some(record), Ok(serde_json::Value::Object(event))) =
            (record.as_object_mut(), serde_json::to_value(event))
        {
            record.extend(event);
        }
        record
    }
}

impl LogSink for FluentdSink {
    fn emit(&self, event: LogEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let url = self.tag_url(event.level);
        let body = self.record(event);
        let client = self.client.clone();

        handle.spawn(async move {
            let result = client
                .post(&url)
                .json(&body)
                .timeout(Self::TIMEOUT)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                tracing::debug!(error = %e, url = %url, "Log sink delivery failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_url() {
        let sink = FluentdSink::new("http://fluentd:9880/", "herald-worker", "dev");
        assert_eq!(
            sink.tag_url(LogLevel::Warning),
            "http://fluentd:9880/herald-worker.warning"
        );
    }

    #[test]
    fn test_record_flattens_fields() {
        let sink = FluentdSink::new("http://fluentd:9880", "herald-worker", "prod");
        let event = LogEvent::new(LogLevel::Info, "Notification sent")
            .with_field("channel", "email")
            .with_field("retry_count", 2);
        let record = sink.record(event);
        assert_eq!(record["service"], "herald-worker");
        assert_eq!(record["environment"], "prod");
        assert_eq!(record["level"], "info");
        assert_eq!(record["message"], "Notification sent");
        assert_eq!(record["channel"], "email");
        assert_eq!(record["retry_count"], 2);
    }

    #[test]
    fn test_emit_outside_runtime_is_dropped() {
        let sink = FluentdSink::new("http://127.0.0.1:9", "svc", "dev");
        sink.emit(LogEvent::new(LogLevel::Error, "ignored"));
    }

    #[tokio::test]
    async fn test_emit_to_unreachable_collector_does_not_fail() {
        let sink = FluentdSink::new("http://127.0.0.1:9", "svc", "dev");
        sink.emit(LogEvent::new(LogLevel::Error, "ignored"));
        NoopSink.emit(LogEvent::new(LogLevel::Info, "ignored"));
    }
}
