//! Envelope headers carried on every message (broker metadata, not body).
//!
//! Wire names:
//! - `x-retry-count`: ladder step the message is on (absent means 0)
//! - `x-final-failure`: set on dead-lettered messages
//! - `x-completed-channels`: comma-separated channels already delivered
//! - `x-record-ids`: JSON object, channel to notification record id
//! - `x-failure-reason`: last failure, for inspection of dead letters

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

pub const RETRY_COUNT: &str = "x-retry-count";
pub const FINAL_FAILURE: &str = "x-final-failure";
pub const COMPLETED_CHANNELS: &str = "x-completed-channels";
pub const RECORD_IDS: &str = "x-record-ids";
pub const FAILURE_REASON: &str = "x-failure-reason";

/// Upper bound in bytes on `x-failure-reason`; provider error bodies can be
/// large and headers must fit in one AMQP frame.
pub const MAX_FAILURE_REASON_LEN: usize = 1024;

/// Cut `reason` to at most [`MAX_FAILURE_REASON_LEN`] bytes on a char boundary.
pub fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_FAILURE_REASON_LEN {
        return reason.to_string();
    }
    let mut end = MAX_FAILURE_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Transport-neutral header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl HeaderValue {
    fn as_u32(&self) -> Option<u32> {
        match self {
            HeaderValue::Int(n) => Some((*n).clamp(0, u32::MAX as i64) as u32),
            HeaderValue::Str(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .map(|n| n.clamp(0, u32::MAX as i64) as u32),
            HeaderValue::Bool(_) => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(b) => Some(*b),
            HeaderValue::Int(n) => Some(*n != 0),
            HeaderValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeHeaders {
    pub retry_count: u32,
    pub final_failure: bool,
    pub completed_channels: BTreeSet<String>,
    pub record_ids: BTreeMap<String, Uuid>,
    pub failure_reason: Option<String>,
}

impl EnvelopeHeaders {
    pub fn with_retry_count(retry_count: u32) -> Self {
        Self {
            retry_count,
            ..Default::default()
        }
    }

    /// Decode from raw header pairs. Unknown names are ignored and
    /// unreadable values fall back to defaults.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, HeaderValue)>,
    {
        let mut headers = Self::default();
        for (name, value) in pairs {
            match name {
                RETRY_COUNT => headers.retry_count = value.as_u32().unwrap_or(0),
                FINAL_FAILURE => headers.final_failure = value.as_bool().unwrap_or(false),
                COMPLETED_CHANNELS => {
                    if let Some(list) = value.as_str() {
                        headers.completed_channels = list
                            .split(',')
                            .map(str::trim)
                            .filter(|c| !c.is_empty())
                            .map(str::to_string)
                            .collect();
                    }
                }
                RECORD_IDS => {
                    if let Some(json) = value.as_str() {
                        match serde_json::from_str(json) {
                            Ok(ids) => headers.record_ids = ids,
                            Err(e) => {
                                tracing::warn!(error = %e, "Ignoring unreadable x-record-ids header")
                            }
                        }
                    }
                }
                FAILURE_REASON => headers.failure_reason = value.as_str().map(str::to_string),
                _ => {}
            }
        }
        headers
    }

    /// Encode as header pairs. Defaults are omitted except `x-retry-count`.
    pub fn to_pairs(&self) -> Vec<(&'static str, HeaderValue)> {
        let mut pairs = vec![(RETRY_COUNT, HeaderValue::Int(self.retry_count as i64))];
        if self.final_failure {
            pairs.push((FINAL_FAILURE, HeaderValue::Bool(true)));
        }
        if !self.completed_channels.is_empty() {
            let list: Vec<&str> = self.completed_channels.iter().map(String::as_str).collect();
            pairs.push((COMPLETED_CHANNELS, HeaderValue::Str(list.join(","))));
        }
        if !self.record_ids.is_empty()
            && let Ok(json) = serde_json::to_string(&self.record_ids)
        {
            pairs.push((RECORD_IDS, HeaderValue::Str(json)));
        }
        if let Some(reason) = &self.failure_reason {
            pairs.push((FAILURE_REASON, HeaderValue::Str(reason.clone())));
        }
        pairs
    }
}
