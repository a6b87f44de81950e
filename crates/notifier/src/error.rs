use std::time::Duration;

use thiserror::Error;

/// Errors raised by a notification channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Destination failed the channel's format check.
    #[error("Invalid destination: {0}")]
    Validation(String),

    /// Provider call failed (network error or non-2xx response).
    #[error("{provider} request failed{}: {message}", status_suffix(.status))]
    Transport {
        provider: &'static str,
        status: Option<u16>,
        message: String,
    },

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// Identifier names no known channel.
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    /// Known channel without provider settings.
    #[error("Channel '{0}' is not configured")]
    NotConfigured(String),

    #[error("Channel configuration error: {0}")]
    Configuration(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {}", s))
        .unwrap_or_default()
}

impl ChannelError {
    pub fn transport(provider: &'static str, err: reqwest::Error) -> Self {
        ChannelError::Transport {
            provider,
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ChannelError::UnknownChannel(_)
                | ChannelError::NotConfigured(_)
                | ChannelError::Configuration(_)
        )
    }
}

/// Map a provider response to `Ok` on 2xx, otherwise a `Transport` error
/// carrying the status and response body.
pub(crate) async fn check_response(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ChannelError::Transport {
        provider,
        status: Some(status.as_u16()),
        message: body,
    })
}
