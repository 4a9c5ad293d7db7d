use std::sync::Arc;

use alert_engine::{
    condition_holds, AlertPayload, AllowanceResolver, NotificationDispatcher, ResolveError,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use domain::{Alert, AlertHistoryEntry, AlertType};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cancel::{CancelToken, Cancelled},
    error::{JobError, RepositoryError},
    repositories::{AlertRepository, TokenRepository, YieldPoolRepository},
    scheduler::Job,
};

pub const ALERT_EVALUATION_JOB: &str = "alert_evaluation";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertEvaluationReport {
    pub evaluated: usize,
    pub triggered: usize,
    pub failed: usize,
    pub notifications_failed: usize,
    /// Triggers whose state update failed; those alerts fire again next pass.
    pub unmarked: usize,
}

/// Per-alert failure. Logged and counted, never fatal to the pass.
#[derive(Debug, Error)]
enum EvaluationError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("evaluation cancelled")]
    Cancelled,
}

impl From<Cancelled> for EvaluationError {
    fn from(_: Cancelled) -> Self {
        EvaluationError::Cancelled
    }
}

enum Outcome {
    Quiet,
    Fired { notified: bool, marked: bool },
}

#[derive(Clone)]
pub struct AlertEvaluator<R, T, L, N>
where
    R: AlertRepository + 'static,
    T: TokenRepository + 'static,
    L: YieldPoolRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    alert_repo: Arc<R>,
    token_repo: Arc<T>,
    pool_repo: Arc<L>,
    allowance: Arc<dyn AllowanceResolver>,
    notifier: Arc<N>,
    cooldown: ChronoDuration,
}

impl<R, T, L, N> AlertEvaluator<R, T, L, N>
where
    R: AlertRepository + 'static,
    T: TokenRepository + 'static,
    L: YieldPoolRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    pub fn new(
        alert_repo: Arc<R>,
        token_repo: Arc<T>,
        pool_repo: Arc<L>,
        allowance: Arc<dyn AllowanceResolver>,
        notifier: Arc<N>,
        cooldown: ChronoDuration,
    ) -> Self {
        Self {
            alert_repo,
            token_repo,
            pool_repo,
            allowance,
            notifier,
            cooldown,
        }
    }

    pub async fn run_once(&self, ctx: &CancelToken) -> Result<AlertEvaluationReport, JobError> {
        self.run_at(ctx, Utc::now()).await
    }

    /// Evaluates every eligible alert as of `now`, oldest first.
    pub async fn run_at(
        &self,
        ctx: &CancelToken,
        now: DateTime<Utc>,
    ) -> Result<AlertEvaluationReport, JobError> {
        let alerts = self
            .alert_repo
            .list_eligible_alerts(now, self.cooldown)
            .await?;
        let mut report = AlertEvaluationReport::default();

        for alert in &alerts {
            ctx.check()?;
            report.evaluated += 1;
            match self.evaluate(ctx, alert, now).await {
                Ok(Outcome::Quiet) => {}
                Ok(Outcome::Fired { notified, marked }) => {
                    report.triggered += 1;
                    if !notified {
                        report.notifications_failed += 1;
                    }
                    if !marked {
                        report.unmarked += 1;
                    }
                }
                Err(EvaluationError::Cancelled) => return Err(JobError::Cancelled),
                Err(err) => {
                    warn!(error = %err, alert_id = %alert.id, "alert evaluation failed");
                    report.failed += 1;
                }
            }
        }

        metrics::counter!("worker_alerts_triggered_total").increment(report.triggered as u64);
        Ok(report)
    }

    async fn evaluate(
        &self,
        ctx: &CancelToken,
        alert: &Alert,
        now: DateTime<Utc>,
    ) -> Result<Outcome, EvaluationError> {
        let observed = self.observe(ctx, alert).await?;
        if !condition_holds(&alert.conditions, observed) {
            debug!(alert_id = %alert.id, observed, "condition not met");
            return Ok(Outcome::Quiet);
        }

        let payload = AlertPayload::new(alert, observed, now);
        let delivery = ctx
            .guard(self.notifier.send(
                alert.notification.channel,
                &alert.notification.destination,
                &payload,
            ))
            .await?;
        if let Err(err) = &delivery {
            warn!(error = %err, alert_id = %alert.id, channel = %alert.notification.channel, "notification failed");
        }

        let entry = AlertHistoryEntry {
            id: Uuid::new_v4(),
            alert_id: alert.id,
            triggered_at: now,
            conditions_snapshot: json!({
                "type": alert.r#type,
                "target": alert.target,
                "comparator": alert.conditions.comparator,
                "threshold": alert.conditions.threshold,
            }),
            triggered_value: observed,
            notification_sent: delivery.is_ok(),
            notification_error: delivery.as_ref().err().map(ToString::to_string),
        };
        // without a history row the trigger is not recorded, so the alert stays
        // untouched and is evaluated again next pass
        self.alert_repo.insert_alert_history(&entry).await?;

        let marked = match self.alert_repo.mark_alert_triggered(alert.id, now).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(alert_id = %alert.id, "alert disappeared before it could be marked");
                false
            }
            Err(err) => {
                warn!(error = %err, alert_id = %alert.id, "failed to mark alert triggered; it will fire again");
                false
            }
        };
        info!(
            alert_id = %alert.id,
            user_id = %alert.user_id,
            target = %alert.target,
            observed,
            notified = delivery.is_ok(),
            "alert triggered"
        );
        Ok(Outcome::Fired {
            notified: delivery.is_ok(),
            marked,
        })
    }

    async fn observe(&self, ctx: &CancelToken, alert: &Alert) -> Result<f64, EvaluationError> {
        let missing = |kind: &'static str| ResolveError::Missing {
            kind,
            target: alert.target.clone(),
        };
        let value = match alert.r#type {
            AlertType::Price => self
                .token_repo
                .token_price_usd(&alert.target)
                .await?
                .ok_or_else(|| missing("price"))?,
            AlertType::Apr => self
                .pool_repo
                .pool_apy(&alert.target)
                .await?
                .ok_or_else(|| missing("apy"))?,
            AlertType::Allowance => ctx.guard(self.allowance.resolve(alert)).await??,
        };
        Ok(value)
    }
}

#[async_trait]
impl<R, T, L, N> Job for AlertEvaluator<R, T, L, N>
where
    R: AlertRepository + 'static,
    T: TokenRepository + 'static,
    L: YieldPoolRepository + 'static,
    N: NotificationDispatcher + 'static,
{
    fn name(&self) -> &'static str {
        ALERT_EVALUATION_JOB
    }

    async fn run(&self, ctx: &CancelToken) -> Result<(), JobError> {
        let report = self.run_once(ctx).await?;
        info!(
            evaluated = report.evaluated,
            triggered = report.triggered,
            failed = report.failed,
            notifications_failed = report.notifications_failed,
            unmarked = report.unmarked,
            "alert evaluation finished"
        );
        Ok(())
    }
}
