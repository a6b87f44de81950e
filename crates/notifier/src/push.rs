//! Push notifications through Firebase Cloud Messaging (HTTP v1).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use herald_common::config::PushSettings;
use herald_common::types::ChannelKind;

use crate::error::check_response;
use crate::{Channel, ChannelError, DEFAULT_SUBJECT};

const DEFAULT_API_BASE: &str = "https://fcm.googleapis.com";

/// Shortest device token accepted.
const MIN_TOKEN_LEN: usize = 10;

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: Option<String>,
}

pub struct PushChannel {
    client: reqwest::Client,
    settings: PushSettings,
}

impl PushChannel {
    pub fn new(client: reqwest::Client, settings: PushSettings) -> Self {
        Self { client, settings }
    }

    fn endpoint(&self) -> String {
        let base = self
            .settings
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/');
        format!(
            "{}/v1/projects/{}/messages:send",
            base, self.settings.project_id
        )
    }
}

#[async_trait]
impl Channel for PushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn validate_destination(&self, destination: &str) -> Result<(), ChannelError> {
        if destination.trim().len() < MIN_TOKEN_LEN {
            return Err(ChannelError::Validation(format!(
                "Device token must be at least {} characters",
                MIN_TOKEN_LEN
            )));
        }
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        message: &str,
        subject: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.validate_destination(destination)?;
        let token = destination.trim();

        let body = json!({
            "message": {
                "token": token,
                "notification": {
                    "title": subject.unwrap_or(DEFAULT_SUBJECT),
                    "body": message,
                },
            }
        });

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.settings.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::transport("fcm", e))?;
        let response = check_response("fcm", response).await?;
        let sent: SendResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::transport("fcm", e))?;

        let prefix: String = token.chars().take(20).collect();
        tracing::info!(token = %prefix, name = ?sent.name, "Push notification sent via FCM");
        Ok(())
    }
}
