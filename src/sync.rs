//! Keeps the [`SpecStore`] up to date.
//!
//! [`SpecsSyncer::refresh_once`] runs one fetch-parse-apply cycle. Calls made while a cycle is in
//! flight join it instead of starting another fetch.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::runtime::Handle;
use url::Url;

use crate::{
    background::{jitter, BackgroundTask, TaskSlot},
    network::NetworkClient,
    observability::OpsStats,
    output_logger::OutputLogger,
    spec_store::{ApplyOutcome, SpecStore},
    Result, StatsigError,
};

const TAG: &str = "SpecsSyncer";

/// Minimum delay between two scheduled syncs.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(1_000);
const SYNC_JITTER: Duration = Duration::from_millis(100);

/// Where a refresh got its values from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Network(ApplyOutcome),
    DataStore(ApplyOutcome),
}

impl SyncOutcome {
    pub fn apply_outcome(&self) -> ApplyOutcome {
        match self {
            SyncOutcome::Network(outcome) | SyncOutcome::DataStore(outcome) => *outcome,
        }
    }
}

type InFlight = Shared<BoxFuture<'static, Result<SyncOutcome>>>;

/// Single-flight fetcher and background poller of specification payloads.
pub struct SpecsSyncer {
    inner: Arc<SyncerInner>,
    task: TaskSlot,
}

struct SyncerInner {
    store: Arc<SpecStore>,
    network: NetworkClient,
    specs_url: String,
    sdk_key: String,
    in_flight: Mutex<Option<InFlight>>,
    ops: OpsStats,
    logger: OutputLogger,
}

impl SpecsSyncer {
    pub(crate) fn new(
        store: Arc<SpecStore>,
        network: NetworkClient,
        specs_url: String,
        sdk_key: String,
        ops: OpsStats,
        logger: OutputLogger,
    ) -> SpecsSyncer {
        SpecsSyncer {
            inner: Arc::new(SyncerInner {
                store,
                network,
                specs_url,
                sdk_key,
                in_flight: Mutex::new(None),
                ops,
                logger,
            }),
            task: TaskSlot::default(),
        }
    }

    /// Run one refresh cycle, or join the one already in flight.
    pub async fn refresh_once(&self) -> Result<SyncOutcome> {
        SyncerInner::refresh_once(&self.inner).await
    }

    /// Start refreshing every `interval` on `runtime`. Replaces a previously started task.
    ///
    /// With `refresh_now` the first refresh runs immediately instead of after one interval.
    /// Stopping the task abandons a refresh that is still waiting on the network.
    pub(crate) fn start(&self, runtime: &Handle, interval: Duration, refresh_now: bool) {
        let interval = interval.max(MIN_SYNC_INTERVAL);
        let inner = Arc::clone(&self.inner);
        let task = BackgroundTask::spawn(runtime, "statsig-specs-sync", move |mut stop| {
            async move {
                let mut refresh_now = refresh_now;
                loop {
                    if !std::mem::take(&mut refresh_now)
                        && stop.sleep(jitter(interval, SYNC_JITTER)).await
                    {
                        return;
                    }
                    match stop.run(SyncerInner::refresh_once(&inner)).await {
                        Some(Ok(_)) => {}
                        Some(Err(err)) => inner.report_failure(&err),
                        None => return,
                    }
                }
            }
        });
        self.task.set(task);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Stop the background task and wait for it to exit. Idempotent.
    pub(crate) async fn stop(&self) -> Result<()> {
        self.task.stop().await
    }

    /// Drop the background task without waiting for it.
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

impl SyncerInner {
    async fn refresh_once(inner: &Arc<SyncerInner>) -> Result<SyncOutcome> {
        let in_flight = {
            let mut slot = inner.lock_in_flight();
            match slot.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let worker = Arc::clone(inner);
                    let future = async move {
                        let result = worker.sync().await;
                        *worker.lock_in_flight() = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };
        in_flight.await
    }

    async fn sync(&self) -> Result<SyncOutcome> {
        if self.store.data_store_supports_polling().await {
            match self.store.load_from_data_store().await {
                Ok(Some(outcome @ ApplyOutcome::Applied { .. })) => {
                    return Ok(SyncOutcome::DataStore(outcome));
                }
                // Stale or unchanged data store values; the network may know better.
                Ok(_) => {}
                Err(err) => {
                    self.logger
                        .warn(TAG, format_args!("failed to poll data store: {err}"));
                }
            }
        }

        self.fetch_from_network().await.map(SyncOutcome::Network)
    }

    async fn fetch_from_network(&self) -> Result<ApplyOutcome> {
        let url = self.url()?;
        let response = self.network.get(url.as_str(), HashMap::new()).await?;
        let data = response
            .data
            .ok_or_else(|| StatsigError::network(Some(response.status), "empty response body"))?;

        let outcome = self.store.apply_network_payload(&data).await?;
        let lcut = self.store.lcut();
        log::debug!(target: "statsig", lcut; "synced specs: {outcome:?}");
        Ok(outcome)
    }

    fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{}/{}.json",
            self.specs_url.trim_end_matches('/'),
            self.sdk_key
        ))?;
        match self.store.lcut() {
            0 => {}
            lcut => {
                url.query_pairs_mut()
                    .append_pair("sinceTime", &lcut.to_string());
            }
        }
        Ok(url)
    }

    fn report_failure(&self, err: &StatsigError) {
        self.logger
            .warn(TAG, format_args!("failed to sync specs, will retry: {err}"));
        self.ops.error(TAG, err);
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::{
        data_store::tests::MemoryDataStore,
        network::{tests::MockNetwork, NetworkResponse},
        spec_store::SpecsSource,
    };

    const SPECS_URL: &str = "https://specs.test/v2/download_config_specs";

    fn payload(time: u64) -> NetworkResponse {
        NetworkResponse::ok(
            json!({"feature_gates": {}, "dynamic_configs": {}, "layer_configs": {}, "time": time})
                .to_string(),
        )
    }

    fn syncer(network: Arc<MockNetwork>) -> (Arc<SpecStore>, SpecsSyncer) {
        let store = Arc::new(SpecStore::new("secret-key"));
        let client = NetworkClient::new("secret-key", network, false, OpsStats::default());
        let syncer = SpecsSyncer::new(
            store.clone(),
            client,
            SPECS_URL.to_owned(),
            "secret-key".to_owned(),
            OpsStats::default(),
            OutputLogger::disabled(),
        );
        (store, syncer)
    }

    #[tokio::test]
    async fn refresh_applies_network_values() {
        let network = Arc::new(MockNetwork::replying(payload(1000)));
        let (store, syncer) = syncer(network.clone());

        let outcome = syncer.refresh_once().await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Network(ApplyOutcome::Applied {
                previous_lcut: 0,
                lcut: 1000
            })
        );
        assert_eq!(store.source(), SpecsSource::Network);
        let requests = network.requests.lock().unwrap();
        assert_eq!(requests[0].url, format!("{SPECS_URL}/secret-key.json"));
    }

    #[tokio::test]
    async fn later_refresh_asks_for_changes_since_lcut() {
        let network = Arc::new(MockNetwork::replying(payload(1000)));
        let (_store, syncer) = syncer(network.clone());

        syncer.refresh_once().await.unwrap();
        syncer.refresh_once().await.unwrap();

        let requests = network.requests.lock().unwrap();
        assert_eq!(
            requests[1].url,
            format!("{SPECS_URL}/secret-key.json?sinceTime=1000")
        );
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_fetch() {
        let network = Arc::new(MockNetwork {
            delay: Some(Duration::from_millis(50)),
            ..MockNetwork::replying(payload(1000))
        });
        let (_store, syncer) = syncer(network.clone());

        let results = futures::future::join_all((0..10).map(|_| syncer.refresh_once())).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(network.calls.load(Ordering::SeqCst), 1);

        // The finished cycle is not reused.
        syncer.refresh_once().await.unwrap();
        assert_eq!(network.call_count(), 2);
    }

    #[tokio::test]
    async fn stale_response_keeps_newer_values() {
        let network = Arc::new(MockNetwork::default());
        network.push_response(payload(1000));
        network.push_response(payload(900));
        let (store, syncer) = syncer(network);

        syncer.refresh_once().await.unwrap();
        let outcome = syncer.refresh_once().await.unwrap();

        assert!(matches!(
            outcome.apply_outcome(),
            ApplyOutcome::Stale {
                current_lcut: 1000,
                offered_lcut: 900
            }
        ));
        assert_eq!(store.lcut(), 1000);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_last_good_values() {
        let network = Arc::new(MockNetwork::default());
        network.push_response(payload(1000));
        network.push_response(NetworkResponse {
            status: 503,
            ..Default::default()
        });
        network.push_response(NetworkResponse::ok("{not json"));
        let (store, syncer) = syncer(network);

        syncer.refresh_once().await.unwrap();
        assert!(syncer.refresh_once().await.is_err());
        assert!(syncer.refresh_once().await.is_err());

        assert_eq!(store.lcut(), 1000);
    }

    #[tokio::test]
    async fn invalid_specs_url_is_reported() {
        let network = Arc::new(MockNetwork::replying(payload(1000)));
        let store = Arc::new(SpecStore::new("secret-key"));
        let client = NetworkClient::new("secret-key", network.clone(), false, OpsStats::default());
        let syncer = SpecsSyncer::new(
            store,
            client,
            "not a url".to_owned(),
            "secret-key".to_owned(),
            OpsStats::default(),
            OutputLogger::disabled(),
        );

        let result = syncer.refresh_once().await;

        assert!(matches!(result, Err(StatsigError::InvalidUrl(_))));
        assert_eq!(network.call_count(), 0);
    }

    #[tokio::test]
    async fn polls_data_store_when_supported() {
        let data_store = Arc::new(MemoryDataStore {
            polling: true,
            ..Default::default()
        });
        let store = Arc::new(SpecStore::with_components(
            "secret-key",
            Some(data_store.clone()),
            OpsStats::default(),
            OutputLogger::disabled(),
        ));
        data_store.values.lock().unwrap().insert(
            crate::data_store::specs_data_store_key("secret-key"),
            crate::data_store::DataStoreResponse {
                result: json!({"time": 2000}).to_string(),
                time: Some(2000),
            },
        );
        let network = Arc::new(MockNetwork::replying(payload(1000)));
        let client = NetworkClient::new("secret-key", network.clone(), false, OpsStats::default());
        let syncer = SpecsSyncer::new(
            store.clone(),
            client,
            SPECS_URL.to_owned(),
            "secret-key".to_owned(),
            OpsStats::default(),
            OutputLogger::disabled(),
        );

        let outcome = syncer.refresh_once().await.unwrap();

        assert!(matches!(outcome, SyncOutcome::DataStore(_)));
        assert_eq!(store.source(), SpecsSource::DataStore);
        assert_eq!(network.call_count(), 0);
    }

    #[tokio::test]
    async fn stale_data_store_falls_back_to_network() {
        let data_store = Arc::new(MemoryDataStore {
            polling: true,
            ..Default::default()
        });
        data_store.values.lock().unwrap().insert(
            crate::data_store::specs_data_store_key("secret-key"),
            crate::data_store::DataStoreResponse {
                result: json!({"time": 500}).to_string(),
                time: Some(500),
            },
        );
        let store = Arc::new(SpecStore::with_components(
            "secret-key",
            Some(data_store),
            OpsStats::default(),
            OutputLogger::disabled(),
        ));
        store
            .bootstrap(&json!({"time": 800}).to_string())
            .unwrap();
        let network = Arc::new(MockNetwork::replying(payload(1000)));
        let client = NetworkClient::new("secret-key", network.clone(), false, OpsStats::default());
        let syncer = SpecsSyncer::new(
            store.clone(),
            client,
            SPECS_URL.to_owned(),
            "secret-key".to_owned(),
            OpsStats::default(),
            OutputLogger::disabled(),
        );

        let outcome = syncer.refresh_once().await.unwrap();

        assert_eq!(network.call_count(), 1);
        assert_eq!(
            outcome,
            SyncOutcome::Network(ApplyOutcome::Applied {
                previous_lcut: 800,
                lcut: 1000
            })
        );
        assert_eq!(store.source(), SpecsSource::Network);
    }

    #[tokio::test]
    async fn immediate_start_refreshes_before_first_interval() {
        let network = Arc::new(MockNetwork::replying(payload(1000)));
        let (store, syncer) = syncer(network.clone());

        syncer.start(&Handle::current(), Duration::from_secs(60), true);
        for _ in 0..100 {
            if store.lcut() == 1000 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(store.lcut(), 1000);
        syncer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_abandons_slow_refresh() {
        let network = Arc::new(MockNetwork {
            delay: Some(Duration::from_secs(30)),
            ..MockNetwork::replying(payload(1000))
        });
        let (store, syncer) = syncer(network.clone());

        syncer.start(&Handle::current(), Duration::from_secs(60), true);
        for _ in 0..100 {
            if network.call_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::timeout(Duration::from_secs(1), syncer.stop())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(network.call_count(), 1);
        assert_eq!(store.lcut(), 0);
    }

    #[tokio::test]
    async fn background_sync_runs_and_stops() {
        let network = Arc::new(MockNetwork::replying(payload(1000)));
        let (store, syncer) = syncer(network.clone());

        syncer.start(&Handle::current(), Duration::from_millis(1), false);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(syncer.is_running());
        syncer.stop().await.unwrap();
        syncer.stop().await.unwrap();

        assert!(!syncer.is_running());
        assert_eq!(store.lcut(), 1000);
        let calls = network.call_count();
        assert!(calls >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(network.call_count(), calls);
    }
}
