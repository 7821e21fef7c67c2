//! Bulk scan orchestration.
//!
//! A job walks its targets in order-preserving batches. Each batch drains
//! through the bounded worker pool, every pricing call waits on the rate
//! governor first, and throttled calls are retried with backoff. Cancellation
//! is cooperative: the flag is read between batches, never mid-call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, API_CLASS_ITEM_OFFERS, PROGRESS_CHANNEL_CAPACITY};
use crate::db::scans::CancelOutcome;
use crate::db::ScanStore;
use crate::error::{AppError, Result};
use crate::governor::RateGovernor;
use crate::pool::{partition_batches, run_bounded, PoolProgress, RetryPolicy};
use crate::scan::job::{ScanProgress, ScanRequest, ScanStatus};
use crate::scan::latency::PricingLatency;
use crate::scan::pricing::{competitor_offers, summarize_offers, PricingClient};
use crate::types::{CompetitiveSummary, ItemKey};

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub cooldown: Duration,
    /// Governor class every pricing call is charged against.
    pub api_class: String,
    pub retry: RetryPolicy,
}

impl ScanSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.scan_batch_size,
            concurrency: cfg.scan_concurrency,
            cooldown: Duration::from_millis(cfg.scan_batch_cooldown_ms),
            api_class: API_CLASS_ITEM_OFFERS.to_string(),
            retry: cfg.scan_retry_policy(),
        }
    }
}

/// Response to `POST /scan`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCreated {
    pub job_id: String,
    pub total_items: usize,
    /// Seconds, assuming every call waits out the full governor delay.
    pub estimated_duration: u64,
}

/// Shared between the items of one run.
#[derive(Default)]
struct RunState {
    abort: AtomicBool,
    fatal_error: Mutex<Option<String>>,
}

impl RunState {
    fn trip(&self, err: &AppError) {
        self.abort.store(true, Ordering::Relaxed);
        if let Ok(mut slot) = self.fatal_error.lock() {
            slot.get_or_insert_with(|| err.to_string());
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    fn error_message(&self) -> Option<String> {
        self.fatal_error.lock().ok().and_then(|slot| slot.clone())
    }
}

pub struct ScanOrchestrator {
    store: ScanStore,
    client: Arc<dyn PricingClient>,
    governor: Arc<RateGovernor>,
    settings: ScanSettings,
    latency: Arc<PricingLatency>,
    channels: DashMap<String, broadcast::Sender<ScanProgress>>,
}

impl ScanOrchestrator {
    pub fn new(
        store: ScanStore,
        client: Arc<dyn PricingClient>,
        governor: Arc<RateGovernor>,
        settings: ScanSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            governor,
            settings,
            latency: Arc::new(PricingLatency::new()),
            channels: DashMap::new(),
        })
    }

    /// Governor wait and call latency of every pricing request made so far.
    pub fn latency(&self) -> &PricingLatency {
        &self.latency
    }

    /// Create the job and start it in the background.
    pub async fn submit(self: &Arc<Self>, req: ScanRequest) -> Result<ScanCreated> {
        let (created, items) = self.create(req).await?;

        let this = Arc::clone(self);
        let job_id = created.job_id.clone();
        tokio::spawn(async move { this.run_to_end(job_id, items).await });

        Ok(created)
    }

    /// Resolve targets and insert a `pending` job. Returns the targets in scan order.
    pub async fn create(&self, req: ScanRequest) -> Result<(ScanCreated, Vec<ItemKey>)> {
        let items = self
            .store
            .resolve_targets(req.source, req.filter, req.max_items)
            .await?;
        let job_id = uuid::Uuid::new_v4().to_string();
        self.store
            .create_job(&job_id, req.source, req.filter, items.len() as i64)
            .await?;

        let (tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        self.channels.insert(job_id.clone(), tx);

        info!(
            job_id = %job_id,
            source = %req.source,
            filter = %req.filter,
            total_items = items.len(),
            "scan job created"
        );

        let created = ScanCreated {
            estimated_duration: self.estimate_secs(items.len()),
            total_items: items.len(),
            job_id,
        };
        Ok((created, items))
    }

    /// Seconds a scan of `n` items should take when every call is rate limited.
    pub fn estimate_secs(&self, n: usize) -> u64 {
        if n == 0 {
            return 0;
        }
        let per_call = self.governor.min_delay(&self.settings.api_class).as_millis() as u64;
        let batches = n.div_ceil(self.settings.batch_size.max(1)) as u64;
        let cooldowns = batches.saturating_sub(1) * self.settings.cooldown.as_millis() as u64;
        (n as u64 * per_call + cooldowns).div_ceil(1_000)
    }

    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        match self.store.request_cancel(job_id).await? {
            CancelOutcome::NotFound => Err(AppError::NotFound(format!("scan job {job_id}"))),
            outcome => {
                info!(job_id, ?outcome, "scan cancellation requested");
                Ok(outcome)
            }
        }
    }

    /// Progress channel for a job that is still live.
    pub fn subscribe(&self, job_id: &str) -> Option<broadcast::Receiver<ScanProgress>> {
        self.channels.get(job_id).map(|tx| tx.subscribe())
    }

    async fn run_to_end(&self, job_id: String, items: Vec<ItemKey>) {
        match self.run(&job_id, items).await {
            Ok(status) => info!(job_id = %job_id, %status, "scan job finished"),
            Err(e) => {
                error!(job_id = %job_id, "Scan job error: {e}");
                let (succeeded, failed) = match self.store.get_job(&job_id).await {
                    Ok(Some(job)) => (job.successful_items as u64, job.failed_items as u64),
                    _ => (0, 0),
                };
                if let Err(e2) = self
                    .store
                    .finish(&job_id, ScanStatus::Failed, succeeded, failed, Some(&e.to_string()))
                    .await
                {
                    error!(job_id = %job_id, "Failed to mark scan job failed: {e2}");
                }
                self.channels.remove(&job_id);
            }
        }
    }

    /// Drive a pending job to a terminal state.
    pub async fn run(&self, job_id: &str, items: Vec<ItemKey>) -> Result<ScanStatus> {
        if !self.store.mark_running(job_id).await? {
            return Err(AppError::BadRequest(format!("scan job {job_id} is not pending")));
        }

        let total = items.len() as u64;
        let batches = partition_batches(&items, self.settings.batch_size);
        let total_batches = batches.len();
        let state = RunState::default();
        let (mut succeeded, mut failed) = (0u64, 0u64);
        let mut status = ScanStatus::Completed;

        for (index, batch) in batches.into_iter().enumerate() {
            let cooldown = index > 0 && !self.settings.cooldown.is_zero();
            if cooldown && !self.store.is_cancel_requested(job_id).await? {
                tokio::time::sleep(self.settings.cooldown).await;
            }
            if self.store.is_cancel_requested(job_id).await? {
                info!(job_id, batch = index, succeeded, failed, "scan cancelled between batches");
                status = ScanStatus::Cancelled;
                break;
            }

            self.emit(
                job_id,
                ScanProgress::BatchStarted {
                    job_id: job_id.to_string(),
                    batch: index,
                    total_batches,
                    batch_size: batch.len(),
                },
            );

            let (base_ok, base_failed) = (succeeded, failed);
            let state_ref = &state;
            let result = run_bounded(
                batch,
                move |key| self.process_item(job_id, key, state_ref),
                self.settings.concurrency,
                |p: PoolProgress| {
                    if !state_ref.aborted() {
                        self.emit(
                            job_id,
                            ScanProgress::Progress {
                                job_id: job_id.to_string(),
                                processed: base_ok + base_failed + p.processed,
                                succeeded: base_ok + p.succeeded,
                                failed: base_failed + p.failed,
                                total,
                            },
                        );
                    }
                },
            )
            .await;

            // Items skipped after an abort are not counted either way.
            let skipped = result
                .outcomes
                .iter()
                .filter(|o| matches!(o.result, Err(AppError::Aborted)))
                .count() as u64;
            succeeded += result.succeeded;
            failed += result.failed - skipped;
            self.store.update_counts(job_id, succeeded, failed).await?;
            debug!(
                job_id,
                batch = index,
                processed = result.processed - skipped,
                succeeded,
                failed,
                "scan batch done"
            );

            if state.aborted() {
                status = ScanStatus::Failed;
                break;
            }
        }

        debug_assert!(ScanStatus::Running.can_transition_to(status));
        let error_message = state.error_message();
        if let Some(msg) = &error_message {
            warn!(job_id, succeeded, failed, "scan aborted: {msg}");
        }
        self.store
            .finish(job_id, status, succeeded, failed, error_message.as_deref())
            .await?;

        self.emit(
            job_id,
            ScanProgress::Finished {
                job_id: job_id.to_string(),
                status,
                succeeded,
                failed,
            },
        );
        self.channels.remove(job_id);
        Ok(status)
    }

    async fn process_item(
        &self,
        job_id: &str,
        key: ItemKey,
        state: &RunState,
    ) -> Result<CompetitiveSummary> {
        if state.aborted() {
            return Err(AppError::Aborted);
        }

        let (governor, client, latency, class, key_ref) = (
            &self.governor,
            &self.client,
            &self.latency,
            self.settings.api_class.as_str(),
            &key,
        );
        let label = format!("fetch offers {key}");
        let fetched = self
            .settings
            .retry
            .run(&label, AppError::is_transient_throttle, move |_| async move {
                let queued = Instant::now();
                governor.acquire(class).await;
                latency.record_wait(class, queued.elapsed());

                let started = Instant::now();
                let offers = client.fetch_offers(key_ref).await;
                latency.record_call(class, started.elapsed());
                offers
            })
            .await;

        let offers = match fetched {
            Ok(offers) => offers,
            Err(e) => {
                if e.is_job_fatal() {
                    error!(job_id, %key, "job-fatal pricing error: {e}");
                    state.trip(&e);
                } else {
                    warn!(job_id, %key, "item failed: {e}");
                }
                return Err(e);
            }
        };

        let summary = summarize_offers(&offers);
        let competitors = serde_json::to_string(&competitor_offers(&offers))?;
        if !self
            .store
            .insert_result(job_id, &key, &summary, &competitors)
            .await?
        {
            warn!(job_id, %key, "result already captured, keeping the first");
        }
        Ok(summary)
    }

    fn emit(&self, job_id: &str, event: ScanProgress) {
        if let Some(tx) = self.channels.get(job_id) {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::scan::job::{ScanFilter, ScanSource};
    use crate::scan::pricing::Offer;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    type Behavior = Box<dyn Fn(usize, &ItemKey) -> Result<Vec<Offer>> + Send + Sync>;

    struct FakeClient {
        calls: AtomicUsize,
        behavior: Behavior,
        /// Request cancellation of the job once this many calls were made.
        cancel_at: Mutex<Option<(ScanStore, String, usize)>>,
    }

    impl FakeClient {
        fn new(
            behavior: impl Fn(usize, &ItemKey) -> Result<Vec<Offer>> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behavior: Box::new(behavior),
                cancel_at: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PricingClient for FakeClient {
        async fn fetch_offers(&self, key: &ItemKey) -> Result<Vec<Offer>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let hook = self.cancel_at.lock().unwrap().clone();
            if let Some((store, job_id, at)) = hook {
                if n == at {
                    store.request_cancel(&job_id).await?;
                }
            }
            (self.behavior)(n, key)
        }
    }

    fn offers_ok() -> Result<Vec<Offer>> {
        Ok(vec![
            Offer {
                seller_id: "me".into(),
                price: 10.0,
                shipping: 0.0,
                is_buy_box_winner: true,
                is_prime: true,
                is_own: true,
            },
            Offer {
                seller_id: "them".into(),
                price: 11.0,
                shipping: 0.0,
                is_buy_box_winner: false,
                is_prime: false,
                is_own: false,
            },
        ])
    }

    fn settings(batch_size: usize) -> ScanSettings {
        ScanSettings {
            batch_size,
            concurrency: 1,
            cooldown: Duration::ZERO,
            api_class: API_CLASS_ITEM_OFFERS.to_string(),
            retry: RetryPolicy {
                max_retries: 5,
                base_ms: 1,
                cap_ms: 10,
                jitter_ms: 1,
                attempt_timeout: None,
            },
        }
    }

    async fn seed_catalog(store: &ScanStore, n: usize) {
        let entries: Vec<(ItemKey, bool)> = (0..n)
            .map(|i| {
                let key = ItemKey {
                    item_id: format!("ITEM{i:04}"),
                    marketplace: "US".to_string(),
                };
                (key, true)
            })
            .collect();
        store.upsert_catalog(&entries).await.unwrap();
    }

    fn catalog_request() -> ScanRequest {
        ScanRequest {
            source: ScanSource::Catalog,
            filter: ScanFilter::All,
            max_items: None,
        }
    }

    #[tokio::test]
    async fn completes_and_records_results() {
        let store = ScanStore::new(memory_pool().await);
        seed_catalog(&store, 7).await;
        let client = FakeClient::new(|_, _| offers_ok());
        let orch = ScanOrchestrator::new(
            store.clone(),
            client.clone(),
            RateGovernor::new(vec![], 0),
            settings(3),
        );

        let (created, items) = orch.create(catalog_request()).await.unwrap();
        assert_eq!(created.total_items, 7);
        let mut rx = orch.subscribe(&created.job_id).unwrap();

        let status = orch.run(&created.job_id, items).await.unwrap();
        assert_eq!(status, ScanStatus::Completed);
        assert_eq!(client.calls(), 7);

        let job = store.get_job(&created.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, "completed");
        assert_eq!((job.successful_items, job.failed_items), (7, 0));
        assert_eq!(store.list_results(&created.job_id).await.unwrap().len(), 7);

        let mut batches = 0;
        let mut last = None;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, ScanProgress::BatchStarted { .. }) {
                batches += 1;
            }
            last = Some(ev);
        }
        assert_eq!(batches, 3);
        assert!(matches!(
            last,
            Some(ScanProgress::Finished { status: ScanStatus::Completed, succeeded: 7, .. })
        ));
        assert!(orch.subscribe(&created.job_id).is_none());

        let latency = orch.latency().snapshot();
        assert_eq!(latency.len(), 1);
        assert_eq!(latency[0].api_class, API_CLASS_ITEM_OFFERS);
        assert_eq!(latency[0].call.samples, 7);
        assert_eq!(latency[0].governor_wait.samples, 7);
    }

    #[tokio::test]
    async fn cancellation_stops_at_batch_boundary() {
        let store = ScanStore::new(memory_pool().await);
        seed_catalog(&store, 100).await;
        let client = FakeClient::new(|_, _| offers_ok());
        let orch = ScanOrchestrator::new(
            store.clone(),
            client.clone(),
            RateGovernor::new(vec![], 0),
            settings(10),
        );

        let (created, items) = orch.create(catalog_request()).await.unwrap();
        *client.cancel_at.lock().unwrap() = Some((store.clone(), created.job_id.clone(), 40));

        let status = orch.run(&created.job_id, items).await.unwrap();
        assert_eq!(status, ScanStatus::Cancelled);
        assert_eq!(client.calls(), 40);

        let job = store.get_job(&created.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, "cancelled");
        assert_eq!(job.successful_items + job.failed_items, 40);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_skips_the_pending_cooldown() {
        let store = ScanStore::new(memory_pool().await);
        seed_catalog(&store, 20).await;
        let client = FakeClient::new(|_, _| offers_ok());
        let mut s = settings(10);
        s.cooldown = Duration::from_secs(3_600);
        let orch = ScanOrchestrator::new(
            store.clone(),
            client.clone(),
            RateGovernor::new(vec![], 0),
            s,
        );

        let (created, items) = orch.create(catalog_request()).await.unwrap();
        *client.cancel_at.lock().unwrap() = Some((store.clone(), created.job_id.clone(), 5));

        let status = tokio::time::timeout(Duration::from_secs(10), orch.run(&created.job_id, items))
            .await
            .expect("cancelled job waited out the cooldown")
            .unwrap();
        assert_eq!(status, ScanStatus::Cancelled);
        assert_eq!(client.calls(), 10);
    }

    #[tokio::test]
    async fn throttled_item_recovers() {
        let store = ScanStore::new(memory_pool().await);
        seed_catalog(&store, 3).await;
        // The second item is throttled four times before it goes through.
        let client = FakeClient::new(|n, _| {
            if (2..=5).contains(&n) {
                Err(AppError::Throttled("429".into()))
            } else {
                offers_ok()
            }
        });
        let orch = ScanOrchestrator::new(
            store.clone(),
            client.clone(),
            RateGovernor::new(vec![], 0),
            settings(10),
        );

        let (created, items) = orch.create(catalog_request()).await.unwrap();
        let status = orch.run(&created.job_id, items).await.unwrap();

        assert_eq!(status, ScanStatus::Completed);
        assert_eq!(client.calls(), 7);
        let job = store.get_job(&created.job_id).await.unwrap().unwrap();
        assert_eq!((job.successful_items, job.failed_items), (3, 0));
    }

    #[tokio::test]
    async fn non_retryable_failure_is_isolated() {
        let store = ScanStore::new(memory_pool().await);
        seed_catalog(&store, 4).await;
        let client = FakeClient::new(|_, key| {
            if key.item_id == "ITEM0001" {
                Err(AppError::NotFound(key.to_string()))
            } else {
                offers_ok()
            }
        });
        let orch = ScanOrchestrator::new(
            store.clone(),
            client.clone(),
            RateGovernor::new(vec![], 0),
            settings(2),
        );

        let (created, items) = orch.create(catalog_request()).await.unwrap();
        let status = orch.run(&created.job_id, items).await.unwrap();

        assert_eq!(status, ScanStatus::Completed);
        assert_eq!(client.calls(), 4);
        let job = store.get_job(&created.job_id).await.unwrap().unwrap();
        assert_eq!((job.successful_items, job.failed_items), (3, 1));
    }

    #[tokio::test]
    async fn auth_failure_fails_the_job() {
        let store = ScanStore::new(memory_pool().await);
        seed_catalog(&store, 10).await;
        let client = FakeClient::new(|n, _| {
            if n == 4 {
                Err(AppError::Auth("token revoked".into()))
            } else {
                offers_ok()
            }
        });
        let orch = ScanOrchestrator::new(
            store.clone(),
            client.clone(),
            RateGovernor::new(vec![], 0),
            settings(5),
        );

        let (created, items) = orch.create(catalog_request()).await.unwrap();
        let status = orch.run(&created.job_id, items).await.unwrap();

        assert_eq!(status, ScanStatus::Failed);
        assert_eq!(client.calls(), 4, "remaining items are skipped");

        let job = store.get_job(&created.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!((job.successful_items, job.failed_items), (3, 1));
        assert!(job.error_message.unwrap().contains("token revoked"));
        assert_eq!(store.list_results(&created.job_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let store = ScanStore::new(memory_pool().await);
        let orch = ScanOrchestrator::new(
            store,
            FakeClient::new(|_, _| offers_ok()),
            RateGovernor::new(vec![], 0),
            settings(5),
        );
        assert!(matches!(orch.cancel("missing").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn estimate_accounts_for_delay_and_cooldown() {
        let store = ScanStore::new(memory_pool().await);
        let mut s = settings(10);
        s.cooldown = Duration::from_millis(5_000);
        let orch = ScanOrchestrator::new(
            store,
            FakeClient::new(|_, _| offers_ok()),
            RateGovernor::new(vec![(API_CLASS_ITEM_OFFERS.to_string(), 2_000)], 1_000),
            s,
        );
        // 25 calls at 2s plus two 5s cooldowns.
        assert_eq!(orch.estimate_secs(25), 60);
        assert_eq!(orch.estimate_secs(0), 0);
    }
}
