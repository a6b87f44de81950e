//! Notification channels.
//!
//! Every channel validates a destination format and sends one message through
//! its provider's HTTP API:
//! - Email (SendGrid or Resend)
//! - SMS (Twilio)
//! - WhatsApp (Twilio)
//! - Push (Firebase Cloud Messaging)
//!
//! [`ChannelRegistry`] binds each configured [`ChannelKind`] to its
//! implementation once at startup.

pub mod email;
pub mod error;
pub mod push;
pub mod registry;
pub mod sms;
pub mod twilio;
pub mod whatsapp;

use async_trait::async_trait;

use herald_common::types::ChannelKind;

pub use error::ChannelError;
pub use registry::ChannelRegistry;

#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Format check only. Accepts anything unless the channel overrides it.
    fn validate_destination(&self, _destination: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Deliver one message. Returns only after the provider accepted it.
    async fn send(
        &self,
        destination: &str,
        message: &str,
        subject: Option<&str>,
    ) -> Result<(), ChannelError>;
}

/// Title used when a request carries no subject.
pub const DEFAULT_SUBJECT: &str = "Notification";

/// Strip everything but digits and `+`, then require an E.164-like number.
pub fn normalize_phone(destination: &str) -> Result<String, ChannelError> {
    use std::sync::LazyLock;

    static PHONE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"^\+?[1-9]\d{1,14}$").expect("valid phone regex"));

    let cleaned: String = destination
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    if !PHONE.is_match(&cleaned) {
        return Err(ChannelError::Validation(format!(
            "Invalid phone number: {}",
            destination
        )));
    }
    Ok(cleaned)
}
