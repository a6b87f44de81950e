use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// User id recorded when a request does not name one.
pub const SYSTEM_USER_ID: &str = "system";

/// Notification channel identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
    WhatsApp,
    Push,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Email,
        ChannelKind::Sms,
        ChannelKind::WhatsApp,
        ChannelKind::Push,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
            ChannelKind::WhatsApp => "whatsapp",
            ChannelKind::Push => "push",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = AppError;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(ChannelKind::Email),
            "sms" => Ok(ChannelKind::Sms),
            "whatsapp" => Ok(ChannelKind::WhatsApp),
            "push" => Ok(ChannelKind::Push),
            other => Err(AppError::Validation(format!(
                "Unsupported channel '{}'. Valid channels: email, sms, whatsapp, push",
                other
            ))),
        }
    }
}

/// Notification delivery status.
///
/// The worker only ever writes `Pending`, `Sent` and `Failed`; `Scheduled` and
/// `Cancelled` belong to the scheduling side and exist so their rows still decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Scheduled,
    Cancelled,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Scheduled => write!(f, "scheduled"),
            DeliveryStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A persisted notification record, one per (logical request, channel).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: String,
    pub channel: ChannelKind,
    pub destination: String,
    pub subject: Option<String>,
    pub message: String,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub cost: Option<String>,
}

/// Fields supplied when a pending record is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotificationRecord {
    pub user_id: String,
    pub channel: ChannelKind,
    pub destination: String,
    pub subject: Option<String>,
    pub message: String,
    pub retry_count: u32,
}

/// Single-channel request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleChannelRequest {
    /// Channel identifier; the worker's default channel applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub destination: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(
        default,
        rename = "userId",
        alias = "user_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
}

/// Message content of a multi-channel request: one text per channel, or a
/// single text shared by every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Shared(String),
    PerChannel(BTreeMap<String, Option<String>>),
}

impl MessageBody {
    /// Non-empty message for `channel_id`, if any.
    pub fn for_channel(&self, channel_id: &str) -> Option<&str> {
        let text = match self {
            MessageBody::Shared(text) => Some(text.as_str()),
            MessageBody::PerChannel(map) => map.get(channel_id).and_then(|v| v.as_deref()),
        };
        text.filter(|t| !t.trim().is_empty())
    }
}

/// Multi-channel (fan-out) request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiChannelRequest {
    pub destination: BTreeMap<String, Option<String>>,
    pub message: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(
        default,
        rename = "userId",
        alias = "user_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
}

/// The broker message body consumed by the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeliveryRequest {
    Single(SingleChannelRequest),
    Multi(MultiChannelRequest),
}

/// One channel send derived from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget<'a> {
    /// Raw channel identifier as written by the producer (or the default).
    pub channel_id: String,
    pub destination: &'a str,
    pub message: &'a str,
    pub subject: Option<&'a str>,
}

impl DeliveryRequest {
    /// Decode a broker body. A `destination` object selects multi-channel form.
    pub fn from_slice(body: &[u8]) -> Result<Self, AppError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| AppError::Decode(format!("Body is not valid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, AppError> {
        let is_multi = match value.get("destination") {
            Some(serde_json::Value::Object(_)) => true,
            Some(_) => false,
            None if value.is_object() => {
                return Err(AppError::Decode("Missing 'destination' field".to_string()));
            }
            None => return Err(AppError::Decode("Body must be a JSON object".to_string())),
        };

        if is_multi {
            serde_json::from_value(value)
                .map(DeliveryRequest::Multi)
                .map_err(|e| AppError::Decode(format!("Invalid multi-channel request: {}", e)))
        } else {
            serde_json::from_value(value)
                .map(DeliveryRequest::Single)
                .map_err(|e| AppError::Decode(format!("Invalid single-channel request: {}", e)))
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(self).map_err(|e| AppError::Internal(e.to_string()))
    }

    pub fn is_multi_channel(&self) -> bool {
        matches!(self, DeliveryRequest::Multi(_))
    }

    pub fn user_id(&self) -> &str {
        let user_id = match self {
            DeliveryRequest::Single(r) => r.user_id.as_deref(),
            DeliveryRequest::Multi(r) => r.user_id.as_deref(),
        };
        user_id.unwrap_or(SYSTEM_USER_ID)
    }

    /// Expand the request into the channel sends it asks for.
    ///
    /// Multi-channel entries are kept only when both the destination and the
    /// message for that channel are present and non-empty.
    pub fn targets(&self, default_channel: ChannelKind) -> Vec<DeliveryTarget<'_>> {
        match self {
            DeliveryRequest::Single(r) => vec![DeliveryTarget {
                channel_id: r
                    .channel
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| default_channel.as_str().to_string()),
                destination: &r.destination,
                message: &r.message,
                subject: r.subject.as_deref(),
            }],
            DeliveryRequest::Multi(r) => r
                .destination
                .iter()
                .filter_map(|(channel_id, destination)| {
                    let destination = destination.as_deref().filter(|d| !d.trim().is_empty())?;
                    let message = r.message.for_channel(channel_id)?;
                    Some(DeliveryTarget {
                        channel_id: channel_id.clone(),
                        destination,
                        message,
                        subject: r.subject.as_deref(),
                    })
                })
                .collect(),
        }
    }
}
