//! Channel registry: the configured channel implementation per [`ChannelKind`].

use std::collections::BTreeMap;
use std::sync::Arc;

use herald_common::config::ChannelsConfig;
use herald_common::types::ChannelKind;

use crate::email::EmailChannel;
use crate::push::PushChannel;
use crate::sms::SmsChannel;
use crate::whatsapp::WhatsAppChannel;
use crate::{Channel, ChannelError};

/// Read-only after startup; cloned cheaply into message handlers.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<ChannelKind, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every channel that has provider settings. All channels share `client`.
    pub fn from_config(
        config: &ChannelsConfig,
        client: reqwest::Client,
    ) -> Result<Self, ChannelError> {
        let mut registry = Self::new();

        if let Some(settings) = &config.email {
            registry.register(Arc::new(EmailChannel::new(client.clone(), settings.clone())));
        }
        if let Some(settings) = &config.sms {
            registry.register(Arc::new(SmsChannel::new(client.clone(), settings.clone())));
        }
        if let Some(settings) = &config.whatsapp {
            registry.register(Arc::new(WhatsAppChannel::new(
                client.clone(),
                settings.clone(),
            )?));
        }
        if let Some(settings) = &config.push {
            registry.register(Arc::new(PushChannel::new(client, settings.clone())));
        }

        for kind in ChannelKind::ALL {
            if registry.contains(kind) {
                tracing::info!(channel = %kind, "Channel configured");
            } else {
                tracing::warn!(channel = %kind, "Channel not configured, deliveries to it will be dead-lettered");
            }
        }

        Ok(registry)
    }

    /// Bind `channel` to its kind, replacing any previous binding.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.kind(), channel);
    }

    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.register(channel);
        self
    }

    pub fn contains(&self, kind: ChannelKind) -> bool {
        self.channels.contains_key(&kind)
    }

    pub fn configured(&self) -> Vec<ChannelKind> {
        self.channels.keys().copied().collect()
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn Channel>> {
        self.channels.get(&kind).cloned()
    }

    /// Resolve a raw channel identifier. Unknown identifiers and known but
    /// unconfigured channels both fail.
    pub fn resolve(&self, channel_id: &str) -> Result<Arc<dyn Channel>, ChannelError> {
        let kind: ChannelKind = channel_id
            .parse()
            .map_err(|_| ChannelError::UnknownChannel(channel_id.to_string()))?;
        self.get(kind)
            .ok_or_else(|| ChannelError::NotConfigured(kind.to_string()))
    }
}
