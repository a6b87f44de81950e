//! Notification record store.
//!
//! The worker writes one record per (request, channel): created `pending` on the
//! first attempt, then moved to `sent` or `failed`. Callers treat every write as
//! best-effort and only log failures.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ChannelsConfig;
use crate::error::AppError;
use crate::types::{ChannelKind, DeliveryStatus, NewNotificationRecord, NotificationRecord};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a `pending` record and return its id.
    async fn create_pending(&self, record: &NewNotificationRecord) -> Result<Uuid, AppError>;

    async fn mark_sent(&self, id: Uuid) -> Result<(), AppError>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), AppError>;

    /// Keep the record `pending` while noting the retry step and the last error.
    async fn record_retry(&self, id: Uuid, retry_count: u32, error: &str) -> Result<(), AppError>;
}

/// PostgreSQL-backed record store over the `notifications` table.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<NotificationRecord>, AppError> {
        let record = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT id, user_id, channel, destination, subject, message, status,
                   created_at, sent_at, retry_count, error_message, cost
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    fn ensure_updated(result: sqlx::postgres::PgQueryResult, id: Uuid) -> Result<(), AppError> {
        if result.rows_affected() == 0 {
            return Err(AppError::RecordStore(format!("Notification {} not found", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_pending(&self, record: &NewNotificationRecord) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, user_id, channel, destination, subject, message, status, retry_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(&record.user_id)
        .bind(record.channel)
        .bind(&record.destination)
        .bind(&record.subject)
        .bind(&record.message)
        .bind(DeliveryStatus::Pending)
        .bind(record.retry_count as i32)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE notifications SET status = $2, sent_at = $3, error_message = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(DeliveryStatus::Sent)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(result, id)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        let result =
            sqlx::query("UPDATE notifications SET status = $2, error_message = $3 WHERE id = $1")
                .bind(id)
                .bind(DeliveryStatus::Failed)
                .bind(error)
                .execute(&self.pool)
                .await?;

        Self::ensure_updated(result, id)
    }

    async fn record_retry(&self, id: Uuid, retry_count: u32, error: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE notifications SET retry_count = $2, error_message = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(retry_count as i32)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(result, id)
    }
}

/// In-memory record store for tests and local runs without PostgreSQL.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<Uuid, NotificationRecord>>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (for exercising best-effort paths).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn get(&self, id: Uuid) -> Option<NotificationRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// All records, oldest first.
    pub async fn records(&self) -> Vec<NotificationRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError::RecordStore("record store unavailable".to_string()));
        }
        Ok(())
    }

    async fn update<F>(&self, id: Uuid, apply: F) -> Result<(), AppError>
    where
        F: FnOnce(&mut NotificationRecord) + Send,
    {
        self.check_available()?;
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| AppError::RecordStore(format!("Notification {} not found", id)))?;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_pending(&self, record: &NewNotificationRecord) -> Result<Uuid, AppError> {
        self.check_available()?;
        let id = Uuid::new_v4();
        let stored = NotificationRecord {
            id,
            user_id: record.user_id.clone(),
            channel: record.channel,
            destination: record.destination.clone(),
            subject: record.subject.clone(),
            message: record.message.clone(),
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
            sent_at: None,
            retry_count: record.retry_count as i32,
            error_message: None,
            cost: None,
        };
        self.records.write().await.insert(id, stored);
        Ok(id)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<(), AppError> {
        self.update(id, |r| {
            r.status = DeliveryStatus::Sent;
            r.sent_at = Some(Utc::now());
            r.error_message = None;
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        let error = error.to_string();
        self.update(id, move |r| {
            r.status = DeliveryStatus::Failed;
            r.error_message = Some(error);
        })
        .await
    }

    async fn record_retry(&self, id: Uuid, retry_count: u32, error: &str) -> Result<(), AppError> {
        let error = error.to_string();
        self.update(id, move |r| {
            r.retry_count = retry_count as i32;
            r.error_message = Some(error);
        })
        .await
    }
}

/// A row of the `notification_channels` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChannelConfigRow {
    pub name: String,
    pub enabled: bool,
    pub config: Option<serde_json::Value>,
}

pub async fn load_channel_rows(pool: &PgPool) -> Result<Vec<ChannelConfigRow>, AppError> {
    let rows = sqlx::query_as::<_, ChannelConfigRow>(
        "SELECT name, enabled, config FROM notification_channels ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Merge stored channel rows into env-derived settings. Rows naming an
/// unknown channel are skipped with a warning.
pub fn apply_channel_rows(
    channels: &mut ChannelsConfig,
    rows: Vec<ChannelConfigRow>,
) -> Result<(), AppError> {
    for row in rows {
        let kind: ChannelKind = match row.name.parse() {
            Ok(kind) => kind,
            Err(_) => {
                tracing::warn!(name = %row.name, "Ignoring unknown channel in notification_channels");
                continue;
            }
        };
        channels.apply_override(kind, row.enabled, row.config)?;
        tracing::info!(channel = %kind, enabled = row.enabled, "Applied stored channel settings");
    }
    Ok(())
}
