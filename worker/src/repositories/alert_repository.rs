use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use domain::{Alert, AlertConditions, AlertHistoryEntry, NotificationTarget};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::{RepoResult, RepositoryError};

#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Active alerts whose last trigger is strictly older than `now - cooldown`,
    /// oldest `created_at` first.
    async fn list_eligible_alerts(
        &self,
        now: DateTime<Utc>,
        cooldown: ChronoDuration,
    ) -> RepoResult<Vec<Alert>>;
    async fn insert_alert_history(&self, entry: &AlertHistoryEntry) -> RepoResult<()>;
    /// Returns `false` when the alert no longer exists.
    async fn mark_alert_triggered(&self, alert_id: Uuid, now: DateTime<Utc>) -> RepoResult<bool>;
}

#[derive(Clone)]
pub struct PostgresAlertRepository {
    pool: PgPool,
}

impl PostgresAlertRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn alert_from_row(row: &PgRow) -> RepoResult<Alert> {
    let kind: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    let conditions: serde_json::Value = row.try_get("conditions")?;
    let notification: serde_json::Value = row.try_get("notification")?;
    Ok(Alert {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        r#type: kind
            .parse()
            .map_err(|err| RepositoryError::Corrupt(format!("{err}")))?,
        status: status
            .parse()
            .map_err(|err| RepositoryError::Corrupt(format!("{err}")))?,
        target: row.try_get("target")?,
        conditions: serde_json::from_value::<AlertConditions>(conditions)
            .map_err(|err| RepositoryError::Corrupt(format!("conditions: {err}")))?,
        notification: serde_json::from_value::<NotificationTarget>(notification)
            .map_err(|err| RepositoryError::Corrupt(format!("notification: {err}")))?,
        last_triggered_at: row.try_get("last_triggered_at")?,
        trigger_count: row.try_get("trigger_count")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl AlertRepository for PostgresAlertRepository {
    async fn list_eligible_alerts(
        &self,
        now: DateTime<Utc>,
        cooldown: ChronoDuration,
    ) -> RepoResult<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT id, user_id, type, status, target, conditions, notification,
                    last_triggered_at, trigger_count, created_at
             FROM alerts
             WHERE status = 'active'
               AND (last_triggered_at IS NULL OR last_triggered_at < $1)
             ORDER BY created_at ASC, id ASC",
        )
        .bind(now - cooldown)
        .fetch_all(&self.pool)
        .await?;

        // one malformed row must not hide every other alert from evaluation
        let mut alerts = Vec::with_capacity(rows.len());
        for row in &rows {
            match alert_from_row(row) {
                Ok(alert) => alerts.push(alert),
                Err(err) => {
                    let id: Option<Uuid> = row.try_get("id").ok();
                    warn!(error = %err, alert_id = ?id, "skipping unreadable alert row");
                }
            }
        }
        Ok(alerts)
    }

    async fn insert_alert_history(&self, entry: &AlertHistoryEntry) -> RepoResult<()> {
        sqlx::query(
            "INSERT INTO alert_history (
                id, alert_id, triggered_at, conditions_snapshot, triggered_value,
                notification_sent, notification_error
             ) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id)
        .bind(entry.alert_id)
        .bind(entry.triggered_at)
        .bind(&entry.conditions_snapshot)
        .bind(entry.triggered_value)
        .bind(entry.notification_sent)
        .bind(entry.notification_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_alert_triggered(&self, alert_id: Uuid, now: DateTime<Utc>) -> RepoResult<bool> {
        let res = sqlx::query(
            "UPDATE alerts
             SET last_triggered_at = $2,
                 trigger_count = trigger_count + 1,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(alert_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }
}
