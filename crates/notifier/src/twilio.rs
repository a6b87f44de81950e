//! Twilio Messages API client shared by the SMS and WhatsApp channels.

use serde::Deserialize;

use herald_common::config::TwilioSettings;

use crate::error::{ChannelError, check_response};

const DEFAULT_API_BASE: &str = "https://api.twilio.com";

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TwilioClient {
    client: reqwest::Client,
    settings: TwilioSettings,
}

impl TwilioClient {
    pub fn new(client: reqwest::Client, settings: TwilioSettings) -> Self {
        Self { client, settings }
    }

    pub fn from_number(&self) -> &str {
        &self.settings.from_number
    }

    fn messages_url(&self) -> String {
        let base = self
            .settings
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/');
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            base, self.settings.account_sid
        )
    }

    /// Create a message resource. Returns the message SID when Twilio reports one.
    pub async fn send_message(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<Option<String>, ChannelError> {
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.settings.account_sid, Some(&self.settings.auth_token))
            .form(&[("To", to), ("From", from), ("Body", body)])
            .send()
            .await
            .map_err(|e| ChannelError::transport("twilio", e))?;

        let response = check_response("twilio", response).await?;
        let resource: MessageResource = response
            .json()
            .await
            .map_err(|e| ChannelError::transport("twilio", e))?;
        Ok(resource.sid)
    }
}
