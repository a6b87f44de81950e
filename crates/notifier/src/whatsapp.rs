use async_trait::async_trait;

use herald_common::config::TwilioSettings;
use herald_common::types::ChannelKind;

use crate::twilio::TwilioClient;
use crate::{Channel, ChannelError, normalize_phone};

const PREFIX: &str = "whatsapp:";

/// Normalise a WhatsApp address to `whatsapp:+<digits>`. The `whatsapp:`
/// prefix is optional on input.
pub fn whatsapp_address(destination: &str) -> Result<String, ChannelError> {
    let number = destination.trim();
    let number = number.strip_prefix(PREFIX).unwrap_or(number);
    let number = normalize_phone(number)?;
    if number.starts_with('+') {
        Ok(format!("{}{}", PREFIX, number))
    } else {
        Ok(format!("{}+{}", PREFIX, number))
    }
}

/// WhatsApp through Twilio.
pub struct WhatsAppChannel {
    twilio: TwilioClient,
    from: String,
}

impl WhatsAppChannel {
    pub fn new(client: reqwest::Client, settings: TwilioSettings) -> Result<Self, ChannelError> {
        let from = whatsapp_address(&settings.from_number).map_err(|_| {
            ChannelError::Configuration(format!(
                "Invalid WhatsApp sender number: {}",
                settings.from_number
            ))
        })?;
        Ok(Self {
            twilio: TwilioClient::new(client, settings),
            from,
        })
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WhatsApp
    }

    fn validate_destination(&self, destination: &str) -> Result<(), ChannelError> {
        whatsapp_address(destination).map(|_| ())
    }

    async fn send(
        &self,
        destination: &str,
        message: &str,
        _subject: Option<&str>,
    ) -> Result<(), ChannelError> {
        let to = whatsapp_address(destination)?;
        let sid = self.twilio.send_message(&self.from, &to, message).await?;

        tracing::info!(to = %to, sid = ?sid, "WhatsApp message sent via Twilio");
        Ok(())
    }
}
