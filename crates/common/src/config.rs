use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::ChannelKind;

/// Routing type of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            other => Err(AppError::Config(format!(
                "Unsupported exchange type '{}' (expected direct, topic or fanout)",
                other
            ))),
        }
    }
}

/// Bounded retry ladder: one delay per retry step, step 1 first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_secs(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_secs).collect())
    }

    /// A policy that dead-letters on the first failure.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn max_retries(&self) -> u32 {
        self.delays.len() as u32
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Delay for retry step `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        attempt
            .checked_sub(1)
            .and_then(|idx| self.delays.get(idx as usize))
            .copied()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(&[5, 30, 120])
    }
}

/// Broker entity names and routing parameters.
///
/// Derived names follow the `E` / `Q` convention: `E.dlx`, `Q.dlq`,
/// `E.retry.{i}` and `Q.retry.{i}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_kind: ExchangeKind,
}

impl TopologyConfig {
    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.exchange)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.queue)
    }

    pub fn retry_exchange(&self, step: u32) -> String {
        format!("{}.retry.{}", self.exchange, step)
    }

    pub fn retry_queue(&self, step: u32) -> String {
        format!("{}.retry.{}", self.queue, step)
    }

    /// Routing key used when publishing to the dead-letter exchange.
    pub fn dead_letter_routing_key(&self) -> &str {
        match self.dead_letter_kind {
            ExchangeKind::Fanout => "",
            _ => &self.routing_key,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            exchange: "notifications.exchange".to_string(),
            exchange_kind: ExchangeKind::Direct,
            queue: "notifications.queue".to_string(),
            routing_key: "notifications.key".to_string(),
            dead_letter_kind: ExchangeKind::Fanout,
        }
    }
}

/// Email provider HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    SendGrid,
    Resend,
}

impl FromStr for EmailProvider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sendgrid" => Ok(EmailProvider::SendGrid),
            "resend" => Ok(EmailProvider::Resend),
            other => Err(AppError::Config(format!(
                "Unsupported email provider '{}' (expected sendgrid or resend)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSettings {
    pub provider: EmailProvider,
    pub api_key: String,
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Overrides the provider's API base URL.
    #[serde(default)]
    pub api_base: Option<String>,
}

fn default_from_name() -> String {
    "Notifications Service".to_string()
}

/// Twilio credentials shared by the SMS and WhatsApp channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwilioSettings {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Firebase Cloud Messaging (HTTP v1) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSettings {
    pub project_id: String,
    /// OAuth2 bearer token for the FCM service account.
    pub access_token: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Per-channel provider configuration. `None` leaves the channel unconfigured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelsConfig {
    pub email: Option<EmailSettings>,
    pub sms: Option<TwilioSettings>,
    pub whatsapp: Option<TwilioSettings>,
    pub push: Option<PushSettings>,
}

impl ChannelsConfig {
    pub fn is_configured(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Email => self.email.is_some(),
            ChannelKind::Sms => self.sms.is_some(),
            ChannelKind::WhatsApp => self.whatsapp.is_some(),
            ChannelKind::Push => self.push.is_some(),
        }
    }

    /// Apply a stored channel row: disabled rows remove the channel, a config
    /// object replaces the settings taken from the environment.
    pub fn apply_override(
        &mut self,
        kind: ChannelKind,
        enabled: bool,
        config: Option<serde_json::Value>,
    ) -> Result<(), AppError> {
        if !enabled {
            match kind {
                ChannelKind::Email => self.email = None,
                ChannelKind::Sms => self.sms = None,
                ChannelKind::WhatsApp => self.whatsapp = None,
                ChannelKind::Push => self.push = None,
            }
            return Ok(());
        }

        let Some(config) = config else {
            return Ok(());
        };
        let invalid =
            |e: serde_json::Error| AppError::Config(format!("Invalid {} channel config: {}", kind, e));

        match kind {
            ChannelKind::Email => self.email = Some(serde_json::from_value(config).map_err(invalid)?),
            ChannelKind::Sms => self.sms = Some(serde_json::from_value(config).map_err(invalid)?),
            ChannelKind::WhatsApp => {
                self.whatsapp = Some(serde_json::from_value(config).map_err(invalid)?)
            }
            ChannelKind::Push => self.push = Some(serde_json::from_value(config).map_err(invalid)?),
        }
        Ok(())
    }
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// AMQP broker URL
    pub amqp_url: String,

    /// Exchange / queue names and routing
    pub topology: TopologyConfig,

    /// Retry ladder shape
    pub retry: RetryPolicy,

    /// Declare the topology at startup (and retry through TTL queues)
    pub declare_infra: bool,

    /// Maximum number of unacknowledged deliveries in flight
    pub prefetch: u16,

    /// Upper bound on a single channel send
    pub send_timeout: Duration,

    /// How long shutdown waits for in-flight deliveries to settle
    pub shutdown_grace: Duration,

    /// Channel used when a single-channel request omits `channel`
    pub default_channel: ChannelKind,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Bind address of the health endpoint
    pub health_addr: SocketAddr,

    /// Service name attached to forwarded log records
    pub service_name: String,

    /// Deployment environment attached to forwarded log records
    pub service_env: String,

    /// Fluentd HTTP input; log forwarding is off when unset
    pub fluentd_http_url: Option<String>,

    /// Provider settings per channel
    pub channels: ChannelsConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let var_or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let amqp_url = match var("AMQP_URL") {
            Some(url) => url,
            None => {
                let vhost = var_or("RABBITMQ_VHOST", "foro");
                let vhost = if vhost == "/" { "%2F".to_string() } else { vhost };
                format!(
                    "amqp://{}:{}@{}:{}/{}",
                    var_or("RABBITMQ_USERNAME", "admin"),
                    var_or("RABBITMQ_PASSWORD", "admin"),
                    var_or("RABBITMQ_HOST", "localhost"),
                    parse_var::<u16>(&var, "RABBITMQ_PORT", 5672)?,
                    vhost
                )
            }
        };

        let topology = TopologyConfig {
            exchange: var_or("AMQP_EXCHANGE", "notifications.exchange"),
            exchange_kind: var_or("AMQP_EXCHANGE_TYPE", "direct").parse()?,
            queue: var_or("AMQP_QUEUE", "notifications.queue"),
            routing_key: var_or("AMQP_ROUTING_KEY", "notifications.key"),
            dead_letter_kind: var_or("AMQP_DLX_TYPE", "fanout").parse()?,
        };

        let declare_infra = parse_bool(&var, "WORKER_DECLARE_INFRA", true)?;
        let retry = retry_policy_from(&var)?;

        let prefetch = parse_var::<u16>(&var, "WORKER_PREFETCH", 10)?;
        if prefetch == 0 {
            return Err(AppError::env("WORKER_PREFETCH", "greater than zero"));
        }

        Ok(Self {
            amqp_url,
            topology,
            retry,
            declare_infra,
            prefetch,
            send_timeout: Duration::from_secs(parse_var(&var, "WORKER_SEND_TIMEOUT_SECS", 30)?),
            shutdown_grace: Duration::from_secs(parse_var(&var, "WORKER_SHUTDOWN_GRACE_SECS", 30)?),
            default_channel: var_or("DEFAULT_CHANNEL", "email").parse().map_err(|_| {
                AppError::env("DEFAULT_CHANNEL", "one of email, sms, whatsapp, push")
            })?,
            database_url: var("DATABASE_URL").ok_or_else(|| {
                AppError::Config("DATABASE_URL environment variable is required".to_string())
            })?,
            db_max_connections: parse_var(&var, "DB_MAX_CONNECTIONS", 10)?,
            health_addr: var_or("HEALTH_ADDR", "0.0.0.0:8081")
                .parse()
                .map_err(|_| AppError::env("HEALTH_ADDR", "a socket address"))?,
            service_name: var_or("SERVICE_NAME", "herald-worker"),
            service_env: var_or("SERVICE_ENV", "dev"),
            fluentd_http_url: var("FLUENTD_HTTP_URL"),
            channels: channels_from(&var)?,
        })
    }
}

fn parse_var<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::env(key, &format!("a valid {}", std::any::type_name::<T>()))),
        None => Ok(default),
    }
}

fn parse_bool(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, AppError> {
    match var(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes") => Ok(true),
        Some(v) if matches!(v.as_str(), "false" | "0" | "no") => Ok(false),
        Some(_) => Err(AppError::env(key, "true or false")),
    }
}

/// `WORKER_RETRY_DELAYS` wins; otherwise `WORKER_RETRY_DELAY_1..N` are read in
/// order until the first gap; otherwise the default ladder applies.
fn retry_policy_from(var: &impl Fn(&str) -> Option<String>) -> Result<RetryPolicy, AppError> {
    let mut delays: Vec<u64> = match var("WORKER_RETRY_DELAYS") {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse()
                    .map_err(|_| AppError::env("WORKER_RETRY_DELAYS", "a comma-separated list of seconds"))
            })
            .collect::<Result<_, _>>()?,
        None => {
            let mut numbered = Vec::new();
            for step in 1.. {
                let key = format!("WORKER_RETRY_DELAY_{}", step);
                match var(&key) {
                    Some(raw) => numbered.push(
                        raw.trim()
                            .parse()
                            .map_err(|_| AppError::env(&key, "a number of seconds"))?,
                    ),
                    None => break,
                }
            }
            numbered
        }
    };

    let explicit_list = !delays.is_empty();
    if !explicit_list {
        delays = RetryPolicy::default()
            .delays()
            .iter()
            .map(Duration::as_secs)
            .collect();
    }

    match var("WORKER_MAX_RETRIES") {
        None => Ok(RetryPolicy::from_secs(&delays)),
        Some(raw) => {
            let max_retries: usize = raw
                .trim()
                .parse()
                .map_err(|_| AppError::env("WORKER_MAX_RETRIES", "a non-negative integer"))?;
            if max_retries == 0 {
                return Ok(RetryPolicy::none());
            }
            if !explicit_list && max_retries <= delays.len() {
                delays.truncate(max_retries);
            }
            if max_retries != delays.len() {
                return Err(AppError::Config(format!(
                    "WORKER_MAX_RETRIES ({}) does not match the number of retry delays ({})",
                    max_retries,
                    delays.len()
                )));
            }
            Ok(RetryPolicy::from_secs(&delays))
        }
    }
}

fn channels_from(var: &impl Fn(&str) -> Option<String>) -> Result<ChannelsConfig, AppError> {
    let email = match var("EMAIL_API_KEY") {
        Some(api_key) => Some(EmailSettings {
            provider: var("EMAIL_PROVIDER")
                .map(|p| p.parse())
                .transpose()?
                .unwrap_or(EmailProvider::SendGrid),
            api_key,
            from_email: var("EMAIL_FROM").ok_or_else(|| {
                AppError::Config("EMAIL_FROM is required when EMAIL_API_KEY is set".to_string())
            })?,
            from_name: var("EMAIL_FROM_NAME").unwrap_or_else(default_from_name),
            api_base: var("EMAIL_API_BASE"),
        }),
        None => None,
    };

    let twilio = |from_var: &str| match (
        var("TWILIO_ACCOUNT_SID"),
        var("TWILIO_AUTH_TOKEN"),
        var(from_var),
    ) {
        (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioSettings {
            account_sid,
            auth_token,
            from_number,
            api_base: var("TWILIO_API_BASE"),
        }),
        _ => None,
    };

    let push = match (var("FCM_PROJECT_ID"), var("FCM_ACCESS_TOKEN")) {
        (Some(project_id), Some(access_token)) => Some(PushSettings {
            project_id,
            access_token,
            api_base: var("FCM_API_BASE"),
        }),
        _ => None,
    };

    Ok(ChannelsConfig {
        email,
        sms: twilio("SMS_FROM_NUMBER"),
        whatsapp: twilio("WHATSAPP_FROM_NUMBER"),
        push,
    })
}
