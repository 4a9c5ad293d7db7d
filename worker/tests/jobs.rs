use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use alert_engine::{
    AlertPayload, NotificationDispatcher, NotificationError, UnconfiguredAllowanceResolver,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use domain::{
    Alert, AlertConditions, AlertStatus, AlertType, Comparator, NotificationChannel,
    NotificationTarget, PricePoint, ProtocolTvl, TokenPrice, YieldPoolSnapshot,
};
use uuid::Uuid;
use worker::{
    cancel::{CancelSource, CancelToken},
    clients::{PriceSource, YieldPoolSource},
    error::{FetchError, JobError, RepositoryError},
    repositories::{InMemoryStore, Operation, TokenRepository},
    services::{AlertEvaluator, PriceRefresher},
};

struct StubPrices {
    prices: HashMap<String, f64>,
    failing_calls: HashSet<usize>,
    calls: AtomicUsize,
    requested: Mutex<Vec<Vec<String>>>,
}

impl StubPrices {
    fn new(prices: &[(&str, f64)]) -> Self {
        Self {
            prices: prices.iter().map(|(id, p)| (id.to_string(), *p)).collect(),
            failing_calls: HashSet::new(),
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(mut self, call: usize) -> Self {
        self.failing_calls.insert(call);
        self
    }
}

#[async_trait]
impl PriceSource for StubPrices {
    async fn fetch_token_prices(
        &self,
        ctx: &CancelToken,
        ids: &[String],
    ) -> Result<HashMap<String, TokenPrice>, FetchError> {
        ctx.check()?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(ids.to_vec());
        if self.failing_calls.contains(&call) {
            return Err(FetchError::Upstream {
                provider: "coingecko",
                status: reqwest::StatusCode::TOO_MANY_REQUESTS,
            });
        }
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.prices.get(id).map(|p| {
                    (
                        id.clone(),
                        TokenPrice {
                            id: id.clone(),
                            usd_price: *p,
                            change_24h: Some(1.5),
                        },
                    )
                })
            })
            .collect())
    }

    async fn fetch_price_history(
        &self,
        _ctx: &CancelToken,
        _id: &str,
        _days: u32,
    ) -> Result<Vec<PricePoint>, FetchError> {
        Ok(Vec::new())
    }
}

struct StubPools {
    pools: Option<Vec<YieldPoolSnapshot>>,
    calls: AtomicUsize,
}

impl StubPools {
    fn new(pools: Option<Vec<YieldPoolSnapshot>>) -> Self {
        Self {
            pools,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl YieldPoolSource for StubPools {
    async fn fetch_yield_pools(
        &self,
        ctx: &CancelToken,
    ) -> Result<Vec<YieldPoolSnapshot>, FetchError> {
        ctx.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pools.clone().ok_or(FetchError::InvalidFormat {
            provider: "defillama",
            message: "pools status `error`".to_string(),
        })
    }

    async fn fetch_protocol_tvl(
        &self,
        _ctx: &CancelToken,
        protocol_slug: &str,
    ) -> Result<ProtocolTvl, FetchError> {
        Ok(ProtocolTvl {
            name: protocol_slug.to_string(),
            tvl: 0.0,
        })
    }
}

fn snapshot(id: &str, apy: f64) -> YieldPoolSnapshot {
    YieldPoolSnapshot {
        pool_id: id.to_string(),
        protocol: "aave-v3".to_string(),
        chain: "Ethereum".to_string(),
        symbol: "USDC".to_string(),
        tvl_usd: 5e8,
        apy,
        apy_base: Some(apy),
        apy_reward: None,
        il_7d: None,
        is_stable: true,
    }
}

fn ctx() -> CancelToken {
    CancelSource::new().token()
}

type StubRefresher = PriceRefresher<StubPrices, StubPools, InMemoryStore, InMemoryStore>;

fn refresher(
    prices: StubPrices,
    pools: StubPools,
    store: &Arc<InMemoryStore>,
    batch_size: usize,
) -> (StubRefresher, Arc<StubPrices>, Arc<StubPools>) {
    let prices = Arc::new(prices);
    let pools = Arc::new(pools);
    let job = PriceRefresher::new(
        prices.clone(),
        pools.clone(),
        store.clone(),
        store.clone(),
        batch_size,
    );
    (job, prices, pools)
}

#[tokio::test]
async fn failed_batch_does_not_stop_later_batches() {
    let store = Arc::new(InMemoryStore::new());
    for id in ["ethereum", "bitcoin", "usd-coin", "tether", "dai"] {
        store.track_token(id).await;
    }
    let prices = StubPrices::new(&[
        ("ethereum", 2650.0),
        ("bitcoin", 64000.0),
        ("usd-coin", 1.0),
        ("tether", 1.0),
        ("dai", 1.0),
    ])
    .failing_on(1);
    let (job, prices, _) = refresher(prices, StubPools::new(Some(vec![])), &store, 2);

    let report = job.run_once(&ctx()).await.unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.prices_upserted, 3);
    let requested = prices.requested.lock().unwrap().clone();
    assert_eq!(
        requested,
        vec![
            vec!["ethereum".to_string(), "bitcoin".to_string()],
            vec!["usd-coin".to_string(), "tether".to_string()],
            vec!["dai".to_string()],
        ]
    );
    assert_eq!(store.token_price("ethereum").await.unwrap().price_usd, 2650.0);
    assert_eq!(store.token_price("dai").await.unwrap().change_24h, Some(1.5));
    assert!(store.token_price("usd-coin").await.is_none());
    assert!(store.token_price("tether").await.is_none());
}

#[tokio::test]
async fn tracked_list_failure_aborts_the_run() {
    let store = Arc::new(InMemoryStore::new());
    store.track_token("ethereum").await;
    store.fail(Operation::ListTrackedTokens).await;
    let (job, prices, _) = refresher(
        StubPrices::new(&[("ethereum", 1.0)]),
        StubPools::new(Some(vec![])),
        &store,
        50,
    );

    let err = job.run_once(&ctx()).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::Repository(RepositoryError::Unavailable(_))
    ));
    assert_eq!(prices.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn run_fails_only_when_nothing_was_refreshed() {
    let store = Arc::new(InMemoryStore::new());
    store.track_token("ethereum").await;
    let (job, _, _) = refresher(
        StubPrices::new(&[("ethereum", 1.0)]).failing_on(0),
        StubPools::new(None),
        &store,
        50,
    );
    let err = job.run_once(&ctx()).await.unwrap_err();
    assert!(matches!(err, JobError::Fetch(FetchError::Upstream { .. })));
}

#[tokio::test]
async fn row_upsert_failure_is_isolated() {
    let store = Arc::new(InMemoryStore::new());
    store.track_token("ethereum").await;
    store.track_token("bitcoin").await;
    store.fail_token_upsert("ethereum").await;
    let (job, _, _) = refresher(
        StubPrices::new(&[("ethereum", 2650.0), ("bitcoin", 64000.0)]),
        StubPools::new(Some(vec![])),
        &store,
        50,
    );

    let report = job.run_once(&ctx()).await.unwrap();
    assert_eq!(report.prices_upserted, 1);
    assert_eq!(report.price_upserts_failed, 1);
    assert!(store.token_price("bitcoin").await.is_some());
}

#[tokio::test]
async fn only_tracked_pools_are_upserted() {
    let store = Arc::new(InMemoryStore::new());
    store.track_pool("pool-a").await;
    store.track_pool("pool-missing").await;
    let (job, _, pools) = refresher(
        StubPrices::new(&[]),
        StubPools::new(Some(vec![snapshot("pool-a", 4.2), snapshot("pool-b", 9.9)])),
        &store,
        50,
    );

    let report = job.run_once(&ctx()).await.unwrap();
    assert_eq!(pools.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.pools_upserted, 1);
    assert_eq!(store.pool("pool-a").await.unwrap().snapshot.apy, 4.2);
    assert!(store.pool("pool-b").await.is_none());
    assert!(store.pool("pool-missing").await.is_none());
}

#[tokio::test]
async fn pool_fetch_is_skipped_without_tracked_pools() {
    let store = Arc::new(InMemoryStore::new());
    store.track_token("ethereum").await;
    let (job, _, pools) = refresher(
        StubPrices::new(&[("ethereum", 2650.0)]),
        StubPools::new(Some(vec![snapshot("pool-a", 4.2)])),
        &store,
        50,
    );
    job.run_once(&ctx()).await.unwrap();
    assert_eq!(pools.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pool_lookup_failure_keeps_token_prices() {
    let store = Arc::new(InMemoryStore::new());
    store.track_token("ethereum").await;
    store.track_pool("pool-a").await;
    store.fail(Operation::ListTrackedPools).await;
    let (job, _, pools) = refresher(
        StubPrices::new(&[("ethereum", 2650.0)]),
        StubPools::new(Some(vec![snapshot("pool-a", 4.2)])),
        &store,
        50,
    );

    let report = job.run_once(&ctx()).await.unwrap();
    assert_eq!(report.prices_upserted, 1);
    assert!(report.pool_fetch_failed);
    assert_eq!(pools.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.token_price("ethereum").await.unwrap().price_usd, 2650.0);
    assert!(store.pool("pool-a").await.is_none());
}

#[tokio::test]
async fn pool_lookup_failure_without_token_progress_fails_the_run() {
    let store = Arc::new(InMemoryStore::new());
    store.fail(Operation::ListTrackedPools).await;
    let (job, _, _) = refresher(
        StubPrices::new(&[]),
        StubPools::new(Some(vec![])),
        &store,
        50,
    );

    let err = job.run_once(&ctx()).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::Repository(RepositoryError::Unavailable(_))
    ));
}

#[tokio::test]
async fn cancelled_refresh_stops_between_batches() {
    let store = Arc::new(InMemoryStore::new());
    store.track_token("ethereum").await;
    let (job, prices, _) = refresher(
        StubPrices::new(&[("ethereum", 2650.0)]),
        StubPools::new(Some(vec![])),
        &store,
        50,
    );
    let source = CancelSource::new();
    source.cancel();

    let err = job.run_once(&source.token()).await.unwrap_err();
    assert!(matches!(err, JobError::Cancelled));
    assert_eq!(prices.calls.load(Ordering::SeqCst), 0);
    assert!(store.token_price("ethereum").await.is_none());
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(NotificationChannel, String, AlertPayload)>>,
    failing_destinations: HashSet<String>,
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn send(
        &self,
        channel: NotificationChannel,
        destination: &str,
        payload: &AlertPayload,
    ) -> Result<(), NotificationError> {
        if self.failing_destinations.contains(destination) {
            return Err(NotificationError::Rejected(502));
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel, destination.to_string(), payload.clone()));
        Ok(())
    }
}

fn price_alert(target: &str, comparator: Comparator, threshold: f64, hook: &str) -> Alert {
    Alert {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        r#type: AlertType::Price,
        status: AlertStatus::Active,
        target: target.to_string(),
        conditions: AlertConditions {
            comparator,
            threshold,
        },
        notification: NotificationTarget {
            channel: NotificationChannel::Webhook,
            destination: hook.to_string(),
        },
        last_triggered_at: None,
        trigger_count: 0,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

fn evaluator(
    store: &Arc<InMemoryStore>,
    notifier: &Arc<RecordingNotifier>,
) -> AlertEvaluator<InMemoryStore, InMemoryStore, InMemoryStore, RecordingNotifier> {
    AlertEvaluator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(UnconfiguredAllowanceResolver),
        notifier.clone(),
        ChronoDuration::hours(1),
    )
}

#[tokio::test]
async fn price_above_threshold_fires_once_per_cooldown() {
    let store = Arc::new(InMemoryStore::new());
    store.upsert_token_price("ethereum", 2650.0, None).await.unwrap();
    let alert = price_alert("ethereum", Comparator::Above, 2600.0, "https://hooks.local/a");
    store.insert_alert(alert.clone()).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let job = evaluator(&store, &notifier);
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    let report = job.run_at(&ctx(), t0).await.unwrap();
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.triggered, 1);

    let history = store.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].alert_id, alert.id);
    assert_eq!(history[0].triggered_value, 2650.0);
    assert!(history[0].notification_sent);
    assert_eq!(history[0].conditions_snapshot["threshold"], 2600.0);
    let stored = store.alert(alert.id).await.unwrap();
    assert_eq!(stored.trigger_count, 1);
    assert_eq!(stored.last_triggered_at, Some(t0));

    let sent = notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "https://hooks.local/a");
    assert_eq!(sent[0].2.observed, 2650.0);

    // exactly one cooldown later the alert is still cooling down
    let report = job.run_at(&ctx(), t0 + ChronoDuration::hours(1)).await.unwrap();
    assert_eq!(report.evaluated, 0);

    let report = job
        .run_at(&ctx(), t0 + ChronoDuration::hours(1) + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.triggered, 1);
    assert_eq!(store.alert(alert.id).await.unwrap().trigger_count, 2);
    assert_eq!(store.history().await.len(), 2);
}

#[tokio::test]
async fn refreshed_price_drives_the_next_evaluation() {
    let store = Arc::new(InMemoryStore::new());
    store.track_token("ethereum").await;
    let alert = price_alert("ethereum", Comparator::Above, 2600.0, "https://hooks.local/e2e");
    store.insert_alert(alert.clone()).await;
    let (refresh, _, _) = refresher(
        StubPrices::new(&[("ethereum", 2650.0)]),
        StubPools::new(Some(vec![])),
        &store,
        50,
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let evaluate = evaluator(&store, &notifier);
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    assert_eq!(store.alert(alert.id).await.unwrap().trigger_count, 0);
    let refreshed = refresh.run_once(&ctx()).await.unwrap();
    assert_eq!(refreshed.prices_upserted, 1);
    let evaluated = evaluate.run_at(&ctx(), now).await.unwrap();
    assert_eq!(evaluated.triggered, 1);

    let history = store.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].alert_id, alert.id);
    assert_eq!(history[0].triggered_value, 2650.0);
    assert!(history[0].notification_sent);
    let stored = store.alert(alert.id).await.unwrap();
    assert_eq!(stored.trigger_count, 1);
    assert_eq!(stored.last_triggered_at, Some(now));
    assert_eq!(notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn observation_equal_to_threshold_does_not_fire() {
    let store = Arc::new(InMemoryStore::new());
    store.upsert_token_price("ethereum", 2600.0, None).await.unwrap();
    store
        .insert_alert(price_alert("ethereum", Comparator::Above, 2600.0, "https://h/a"))
        .await;
    store
        .insert_alert(price_alert("ethereum", Comparator::Below, 2600.0, "https://h/b"))
        .await;
    let notifier = Arc::new(RecordingNotifier::default());

    let report = evaluator(&store, &notifier).run_once(&ctx()).await.unwrap();
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.triggered, 0);
    assert!(store.history().await.is_empty());
}

#[tokio::test]
async fn one_failing_alert_does_not_block_the_rest() {
    let store = Arc::new(InMemoryStore::new());
    store.upsert_token_price("ethereum", 2650.0, None).await.unwrap();
    let mut first = price_alert("ethereum", Comparator::Above, 2000.0, "https://down.local");
    first.created_at = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
    let unknown = price_alert("no-such-token", Comparator::Above, 1.0, "https://h/x");
    let last = price_alert("ethereum", Comparator::Above, 2500.0, "https://up.local");
    for a in [first.clone(), unknown.clone(), last.clone()] {
        store.insert_alert(a).await;
    }
    let notifier = Arc::new(RecordingNotifier {
        failing_destinations: HashSet::from(["https://down.local".to_string()]),
        ..Default::default()
    });

    let report = evaluator(&store, &notifier).run_once(&ctx()).await.unwrap();
    assert_eq!(report.evaluated, 3);
    assert_eq!(report.triggered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.notifications_failed, 1);

    let history = store.history().await;
    assert_eq!(history.len(), 2);
    let failed = history.iter().find(|h| h.alert_id == first.id).unwrap();
    assert!(!failed.notification_sent);
    assert_eq!(
        failed.notification_error.as_deref(),
        Some("delivery rejected with status 502")
    );
    // failed delivery still starts the cooldown
    assert_eq!(store.alert(first.id).await.unwrap().trigger_count, 1);
    assert_eq!(store.alert(last.id).await.unwrap().trigger_count, 1);
    assert_eq!(store.alert(unknown.id).await.unwrap().trigger_count, 0);
}

#[tokio::test]
async fn unmarked_trigger_fires_again_next_pass() {
    let store = Arc::new(InMemoryStore::new());
    store.upsert_token_price("ethereum", 2650.0, None).await.unwrap();
    let alert = price_alert("ethereum", Comparator::Above, 2600.0, "https://h/a");
    store.insert_alert(alert.clone()).await;
    store.fail(Operation::MarkAlertTriggered).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let job = evaluator(&store, &notifier);

    let report = job.run_once(&ctx()).await.unwrap();
    assert_eq!(report.triggered, 1);
    assert_eq!(report.unmarked, 1);
    let report = job.run_once(&ctx()).await.unwrap();
    assert_eq!(report.triggered, 1);

    assert_eq!(store.history().await.len(), 2);
    assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    assert_eq!(store.alert(alert.id).await.unwrap().trigger_count, 0);
}

#[tokio::test]
async fn history_failure_leaves_alert_unmarked() {
    let store = Arc::new(InMemoryStore::new());
    store.upsert_token_price("ethereum", 2650.0, None).await.unwrap();
    let alert = price_alert("ethereum", Comparator::Above, 2600.0, "https://h/a");
    store.insert_alert(alert.clone()).await;
    store.fail(Operation::InsertAlertHistory).await;
    let notifier = Arc::new(RecordingNotifier::default());

    let report = evaluator(&store, &notifier).run_once(&ctx()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.triggered, 0);
    let stored = store.alert(alert.id).await.unwrap();
    assert_eq!(stored.trigger_count, 0);
    assert!(stored.last_triggered_at.is_none());
}

#[tokio::test]
async fn eligible_alert_lookup_failure_fails_the_run() {
    let store = Arc::new(InMemoryStore::new());
    store.fail(Operation::ListEligibleAlerts).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let err = evaluator(&store, &notifier).run_once(&ctx()).await.unwrap_err();
    assert!(matches!(err, JobError::Repository(_)));
}
