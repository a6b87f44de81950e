//! Email channel over the SendGrid v3 or Resend HTTP APIs.
//!
//! Message text is sent as HTML content; the subject falls back to
//! [`DEFAULT_SUBJECT`](crate::DEFAULT_SUBJECT).

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use herald_common::config::{EmailProvider, EmailSettings};
use herald_common::types::ChannelKind;

use crate::error::check_response;
use crate::{Channel, ChannelError, DEFAULT_SUBJECT};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

pub struct EmailChannel {
    client: reqwest::Client,
    settings: EmailSettings,
}

impl EmailChannel {
    pub fn new(client: reqwest::Client, settings: EmailSettings) -> Self {
        Self { client, settings }
    }

    fn provider_name(&self) -> &'static str {
        match self.settings.provider {
            EmailProvider::SendGrid => "sendgrid",
            EmailProvider::Resend => "resend",
        }
    }

    fn endpoint(&self) -> String {
        let (default_base, path) = match self.settings.provider {
            EmailProvider::SendGrid => ("https://api.sendgrid.com", "/v3/mail/send"),
            EmailProvider::Resend => ("https://api.resend.com", "/emails"),
        };
        let base = self
            .settings
            .api_base
            .as_deref()
            .unwrap_or(default_base)
            .trim_end_matches('/');
        format!("{}{}", base, path)
    }

    fn payload(&self, destination: &str, message: &str, subject: &str) -> serde_json::Value {
        match self.settings.provider {
            EmailProvider::SendGrid => json!({
                "personalizations": [{ "to": [{ "email": destination }] }],
                "from": {
                    "email": self.settings.from_email,
                    "name": self.settings.from_name,
                },
                "subject": subject,
                "content": [{ "type": "text/html", "value": message }],
            }),
            EmailProvider::Resend => json!({
                "from": format!("{} <{}>", self.settings.from_name, self.settings.from_email),
                "to": [destination],
                "subject": subject,
                "html": message,
            }),
        }
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn validate_destination(&self, destination: &str) -> Result<(), ChannelError> {
        if !EMAIL.is_match(destination) {
            return Err(ChannelError::Validation(format!(
                "Invalid email address: {}",
                destination
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
        let subject = subject.unwrap_or(DEFAULT_SUBJECT);
        let provider = self.provider_name();

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.settings.api_key)
            .json(&self.payload(destination, message, subject))
            .send()
            .await
            .map_err(|e| ChannelError::transport(provider, e))?;
        check_response(provider, response).await?;

        tracing::info!(to = %destination, provider, "Email sent");
        Ok(())
    }
}
