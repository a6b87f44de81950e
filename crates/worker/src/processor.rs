//! Delivery Processor: expands one request into channel sends and records
//! each outcome.
//!
//! Single-channel requests fail as a whole. Multi-channel requests deliver
//! every channel that has both a destination and a message; channels that
//! already succeeded on an earlier attempt are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use herald_broker::EnvelopeHeaders;
use herald_common::store::RecordStore;
use herald_common::telemetry::{LogEvent, LogLevel, LogSink, NoopSink};
use herald_common::types::{ChannelKind, DeliveryRequest, DeliveryTarget, NewNotificationRecord};
use herald_notifier::{Channel, ChannelError, ChannelRegistry};

/// One channel that failed during an attempt.
#[derive(Debug)]
pub struct ChannelFailure {
    pub channel: String,
    pub error: ChannelError,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Malformed delivery request: {0}")]
    Decode(String),

    #[error("Delivery via {channel} failed: {source}")]
    Channel {
        channel: String,
        #[source]
        source: ChannelError,
    },

    #[error("{} channel(s) failed: {}", .failures.len(), describe(.failures))]
    Partial {
        failures: Vec<ChannelFailure>,
        delivered: Vec<ChannelKind>,
    },
}

fn describe(failures: &[ChannelFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.channel, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DeliveryError {
    /// A multi-channel failure is retried when any failed channel could
    /// still succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Decode(_) => false,
            DeliveryError::Channel { source, .. } => source.is_retryable(),
            DeliveryError::Partial { failures, .. } => {
                failures.iter().any(|f| f.error.is_retryable())
            }
        }
    }
}

/// Per-message progress, read from and written back to envelope headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryState {
    pub retry_count: u32,
    /// No retry will follow this attempt.
    pub final_attempt: bool,
    pub completed: BTreeSet<String>,
    pub record_ids: BTreeMap<String, Uuid>,
}

impl DeliveryState {
    pub fn from_headers(headers: &EnvelopeHeaders, max_retries: u32) -> Self {
        Self {
            retry_count: headers.retry_count,
            final_attempt: headers.retry_count >= max_retries,
            completed: headers.completed_channels.clone(),
            record_ids: headers.record_ids.clone(),
        }
    }

    pub fn apply_to(&self, headers: &mut EnvelopeHeaders) {
        headers.completed_channels = self.completed.clone();
        headers.record_ids = self.record_ids.clone();
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<ChannelKind>,
    /// Channels already delivered on an earlier attempt.
    pub skipped: Vec<ChannelKind>,
}

enum Attempt {
    Delivered(ChannelKind),
    Skipped(ChannelKind),
}

pub struct DeliveryProcessor {
    registry: ChannelRegistry,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn LogSink>,
    default_channel: ChannelKind,
    send_timeout: Duration,
}

impl DeliveryProcessor {
    pub fn new(
        registry: ChannelRegistry,
        store: Arc<dyn RecordStore>,
        default_channel: ChannelKind,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            sink: Arc::new(NoopSink),
            default_channel,
            send_timeout,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn decode(body: &[u8]) -> Result<DeliveryRequest, DeliveryError> {
        DeliveryRequest::from_slice(body).map_err(|e| DeliveryError::Decode(e.to_string()))
    }

    /// Run one attempt of `request`, updating `state` with completed
    /// channels and record ids.
    pub async fn process(
        &self,
        request: &DeliveryRequest,
        state: &mut DeliveryState,
    ) -> Result<DeliveryReport, DeliveryError> {
        let targets = request.targets(self.default_channel);
        if targets.is_empty() {
            tracing::warn!(
                user_id = request.user_id(),
                "Multi-channel request has no channel with both a destination and a message"
            );
            return Ok(DeliveryReport::default());
        }

        let mut report = DeliveryReport::default();
        let mut failures = Vec::new();

        for target in &targets {
            match self.deliver(request.user_id(), target, state).await {
                Ok(Attempt::Delivered(kind)) => report.delivered.push(kind),
                Ok(Attempt::Skipped(kind)) => report.skipped.push(kind),
                Err(failure) => failures.push(failure),
            }
        }

        if failures.is_empty() {
            return Ok(report);
        }

        if !request.is_multi_channel()
            && let Some(failure) = failures.pop()
        {
            return Err(DeliveryError::Channel {
                channel: failure.channel,
                source: failure.error,
            });
        }

        Err(DeliveryError::Partial {
            failures,
            delivered: report.delivered,
        })
    }

    async fn deliver(
        &self,
        user_id: &str,
        target: &DeliveryTarget<'_>,
        state: &mut DeliveryState,
    ) -> Result<Attempt, ChannelFailure> {
        let failure = |error| ChannelFailure {
            channel: target.channel_id.clone(),
            error,
        };

        let kind: ChannelKind = match target.channel_id.parse() {
            Ok(kind) => kind,
            Err(_) => {
                let error = ChannelError::UnknownChannel(target.channel_id.clone());
                tracing::warn!(channel = %target.channel_id, "Unknown channel");
                return Err(failure(error));
            }
        };

        if state.completed.contains(kind.as_str()) {
            tracing::debug!(channel = %kind, "Channel already delivered, skipping");
            return Ok(Attempt::Skipped(kind));
        }

        let record_id = self.ensure_record(user_id, kind, target, state).await;

        let result = match self.registry.resolve(kind.as_str()) {
            Ok(channel) => self.attempt(channel.as_ref(), target).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                state.completed.insert(kind.as_str().to_string());
                if let Some(id) = record_id
                    && let Err(e) = self.store.mark_sent(id).await
                {
                    tracing::warn!(record_id = %id, error = %e, "Failed to mark notification sent");
                }

                tracing::info!(
                    channel = %kind,
                    retry_count = state.retry_count,
                    "Notification delivered"
                );
                self.emit(
                    LogEvent::new(LogLevel::Info, "Notification delivered"),
                    kind,
                    record_id,
                    state.retry_count,
                );
                Ok(Attempt::Delivered(kind))
            }
            Err(error) => {
                let will_retry = error.is_retryable() && !state.final_attempt;
                if let Some(id) = record_id {
                    let reason = error.to_string();
                    let written = if will_retry {
                        self.store
                            .record_retry(id, state.retry_count + 1, &reason)
                            .await
                    } else {
                        self.store.mark_failed(id, &reason).await
                    };
                    if let Err(e) = written {
                        tracing::warn!(record_id = %id, error = %e, "Failed to update notification record");
                    }
                }

                tracing::warn!(
                    channel = %kind,
                    retry_count = state.retry_count,
                    will_retry,
                    error = %error,
                    "Notification delivery failed"
                );
                self.emit(
                    LogEvent::new(LogLevel::Error, "Notification delivery failed")
                        .with_field("error", error.to_string()),
                    kind,
                    record_id,
                    state.retry_count,
                );
                Err(failure(error))
            }
        }
    }

    async fn attempt(
        &self,
        channel: &dyn Channel,
        target: &DeliveryTarget<'_>,
    ) -> Result<(), ChannelError> {
        channel.validate_destination(target.destination)?;

        let send = channel.send(target.destination, target.message, target.subject);
        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(self.send_timeout)),
        }
    }

    /// Reuse the record from an earlier attempt or create a pending one.
    /// Store failures never block delivery.
    async fn ensure_record(
        &self,
        user_id: &str,
        kind: ChannelKind,
        target: &DeliveryTarget<'_>,
        state: &mut DeliveryState,
    ) -> Option<Uuid> {
        if let Some(id) = state.record_ids.get(kind.as_str()) {
            return Some(*id);
        }

        let record = NewNotificationRecord {
            user_id: user_id.to_string(),
            channel: kind,
            destination: target.destination.to_string(),
            subject: target.subject.map(str::to_string),
            message: target.message.to_string(),
            retry_count: state.retry_count,
        };

        match self.store.create_pending(&record).await {
            Ok(id) => {
                state.record_ids.insert(kind.as_str().to_string(), id);
                Some(id)
            }
            Err(e) => {
                tracing::warn!(channel = %kind, error = %e, "Failed to create notification record");
                None
            }
        }
    }

    fn emit(&self, event: LogEvent, kind: ChannelKind, record_id: Option<Uuid>, retry_count: u32) {
        let mut event = event
            .with_field("channel", kind.as_str())
            .with_field("retry_count", retry_count);
        if let Some(id) = record_id {
            event = event.with_field("record_id", id.to_string());
        }
        self.sink.emit(event);
    }
}
