use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use domain::{Alert, AlertConditions, AlertStatus, AlertType, Comparator, NotificationChannel};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Strict comparison: an observation equal to the threshold never fires, and
/// neither does NaN.
pub fn condition_holds(conditions: &AlertConditions, observed: f64) -> bool {
    match conditions.comparator {
        Comparator::Above => observed > conditions.threshold,
        Comparator::Below => observed < conditions.threshold,
    }
}

/// An alert is eligible when it is active and its last trigger happened strictly
/// before `now - cooldown`. Sitting exactly on the boundary keeps it cooling down.
pub fn is_eligible(alert: &Alert, now: DateTime<Utc>, cooldown: ChronoDuration) -> bool {
    if alert.status != AlertStatus::Active {
        return false;
    }
    match alert.last_triggered_at {
        None => true,
        Some(last) => last < now - cooldown,
    }
}

/// Body handed to notification dispatchers; webhook destinations receive it as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub alert_id: Uuid,
    pub user_id: Uuid,
    pub alert_type: AlertType,
    pub target: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub observed: f64,
    pub triggered_at: DateTime<Utc>,
    pub message: String,
}

impl AlertPayload {
    pub fn new(alert: &Alert, observed: f64, triggered_at: DateTime<Utc>) -> Self {
        let label = match alert.r#type {
            AlertType::Price => "price",
            AlertType::Apr => "APY",
            AlertType::Allowance => "allowance",
        };
        let message = format!(
            "{} {} {:.4} is {} {:.4}",
            alert.target, label, observed, alert.conditions.comparator, alert.conditions.threshold
        );
        Self {
            alert_id: alert.id,
            user_id: alert.user_id,
            alert_type: alert.r#type,
            target: alert.target.clone(),
            comparator: alert.conditions.comparator,
            threshold: alert.conditions.threshold,
            observed,
            triggered_at,
            message,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("channel {0} is not configured")]
    ChannelUnavailable(NotificationChannel),
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("delivery rejected with status {0}")]
    Rejected(u16),
    #[error("delivery failed: {0}")]
    Transport(String),
    #[error("delivery cancelled")]
    Cancelled,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(
        &self,
        channel: NotificationChannel,
        destination: &str,
        payload: &AlertPayload,
    ) -> Result<(), NotificationError>;
}

#[derive(Clone, Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl NotificationDispatcher for LoggingNotifier {
    async fn send(
        &self,
        channel: NotificationChannel,
        destination: &str,
        payload: &AlertPayload,
    ) -> Result<(), NotificationError> {
        info!(
            alert_id = %payload.alert_id,
            %channel,
            destination,
            message = %payload.message,
            "alert notification"
        );
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no {kind} recorded for {target}")]
    Missing { kind: &'static str, target: String },
    #[error("{0} alerts have no resolver configured")]
    Unsupported(AlertType),
    #[error("resolver backend failed: {0}")]
    Backend(String),
}

/// Supplies the current allowance for `allowance` alerts. On-chain lookups live
/// outside the worker; deployments plug their own implementation in here.
#[async_trait]
pub trait AllowanceResolver: Send + Sync {
    async fn resolve(&self, alert: &Alert) -> Result<f64, ResolveError>;
}

#[derive(Clone, Debug, Default)]
pub struct UnconfiguredAllowanceResolver;

#[async_trait]
impl AllowanceResolver for UnconfiguredAllowanceResolver {
    async fn resolve(&self, _alert: &Alert) -> Result<f64, ResolveError> {
        Err(ResolveError::Unsupported(AlertType::Allowance))
    }
}
