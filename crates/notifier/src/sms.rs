use async_trait::async_trait;

use herald_common::config::TwilioSettings;
use herald_common::types::ChannelKind;

use crate::twilio::TwilioClient;
use crate::{Channel, ChannelError, normalize_phone};

/// SMS through Twilio.
pub struct SmsChannel {
    twilio: TwilioClient,
}

impl SmsChannel {
    pub fn new(client: reqwest::Client, settings: TwilioSettings) -> Self {
        Self {
            twilio: TwilioClient::new(client, settings),
        }
    }
}

#[async_trait]
impl Channel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    fn validate_destination(&self, destination: &str) -> Result<(), ChannelError> {
        normalize_phone(destination).map(|_| ())
    }

    async fn send(
        &self,
        destination: &str,
        message: &str,
        _subject: Option<&str>,
    ) -> Result<(), ChannelError> {
        let to = normalize_phone(destination)?;
        let sid = self
            .twilio
            .send_message(self.twilio.from_number(), &to, message)
            .await?;

        tracing::info!(to = %to, sid = ?sid, "SMS sent via Twilio");
        Ok(())
    }
}
