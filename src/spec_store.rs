//! A thread-safe in-memory storage for the currently active specification. [`SpecStore`] gives
//! evaluators lock-free access to an immutable [`SpecSnapshot`] while a single writer at a time
//! replaces it.
use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::{
    data_store::{specs_data_store_key, DataStore},
    observability::{metrics, OpsStats},
    output_logger::OutputLogger,
    specs::SpecsResponse,
    Result,
};

const TAG: &str = "SpecStore";

/// Where the active snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SpecsSource {
    NoValues,
    Bootstrap,
    DataStore,
    Network,
}

impl fmt::Display for SpecsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpecsSource::NoValues => "NoValues",
            SpecsSource::Bootstrap => "Bootstrap",
            SpecsSource::DataStore => "DataStore",
            SpecsSource::Network => "Network",
        })
    }
}

/// Immutable specification snapshot.
///
/// Snapshots are never modified after creation. Evaluators hold an `Arc` to the snapshot for the
/// duration of one evaluation, so a concurrent swap never produces a torn read.
#[derive(Debug, Clone)]
pub struct SpecSnapshot {
    pub source: SpecsSource,
    /// Last config update time, milliseconds since epoch.
    pub lcut: u64,
    /// When this SDK instance received the values, milliseconds since epoch.
    pub received_at: Option<u64>,
    pub values: SpecsResponse,
}

impl SpecSnapshot {
    /// Snapshot served before any values are available.
    pub fn empty() -> SpecSnapshot {
        SpecSnapshot {
            source: SpecsSource::NoValues,
            lcut: 0,
            received_at: None,
            values: SpecsResponse::empty(),
        }
    }

    pub fn new(values: SpecsResponse, source: SpecsSource) -> SpecSnapshot {
        SpecSnapshot {
            source,
            lcut: values.time,
            received_at: Some(now_ms()),
            values,
        }
    }
}

/// Result of offering a snapshot to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The snapshot is now active.
    Applied { previous_lcut: u64, lcut: u64 },
    /// The snapshot is older than the active one and was discarded.
    Stale { current_lcut: u64, offered_lcut: u64 },
    /// The server reported that nothing changed.
    NoUpdates,
}

/// Holds the active [`SpecSnapshot`].
pub struct SpecStore {
    current: ArcSwap<SpecSnapshot>,
    // Serializes writers; readers never take it.
    write_lock: std::sync::Mutex<()>,
    data_store: Option<Arc<dyn DataStore>>,
    data_store_key: String,
    ops: OpsStats,
    logger: OutputLogger,
}

impl SpecStore {
    pub fn new(sdk_key: &str) -> SpecStore {
        SpecStore::with_components(sdk_key, None, OpsStats::default(), OutputLogger::default())
    }

    pub(crate) fn with_components(
        sdk_key: &str,
        data_store: Option<Arc<dyn DataStore>>,
        ops: OpsStats,
        logger: OutputLogger,
    ) -> SpecStore {
        SpecStore {
            current: ArcSwap::from_pointee(SpecSnapshot::empty()),
            write_lock: std::sync::Mutex::new(()),
            data_store,
            data_store_key: specs_data_store_key(sdk_key),
            ops,
            logger,
        }
    }

    /// Get the active snapshot. Never blocks.
    pub fn get_snapshot(&self) -> Arc<SpecSnapshot> {
        self.current.load_full()
    }

    pub fn lcut(&self) -> u64 {
        self.current.load().lcut
    }

    pub fn source(&self) -> SpecsSource {
        self.current.load().source
    }

    pub fn has_values(&self) -> bool {
        self.source() != SpecsSource::NoValues
    }

    /// Make `snapshot` active unless it is older than the active one.
    pub fn apply(&self, snapshot: SpecSnapshot) -> ApplyOutcome {
        // A poisoned lock only means another writer panicked; the swap itself is still atomic.
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = self.current.load();
        if snapshot.lcut < current.lcut {
            self.logger.debug(
                TAG,
                format_args!(
                    "discarding {} values with lcut {} older than active lcut {}",
                    snapshot.source, snapshot.lcut, current.lcut
                ),
            );
            return ApplyOutcome::Stale {
                current_lcut: current.lcut,
                offered_lcut: snapshot.lcut,
            };
        }

        let previous_lcut = current.lcut;
        let lcut = snapshot.lcut;
        let source = snapshot.source;
        drop(current);
        self.current.store(Arc::new(snapshot));

        self.ops.dist(
            metrics::CONFIG_PROPAGATION_DIFF,
            now_ms().saturating_sub(lcut) as f64,
            &[
                ("source", source.to_string()),
                ("lcut", lcut.to_string()),
                ("prev_lcut", previous_lcut.to_string()),
            ],
        );
        log::debug!(target: "statsig", lcut, previous_lcut; "applied {source} values");

        ApplyOutcome::Applied {
            previous_lcut,
            lcut,
        }
    }

    /// Parse `data` and apply it as coming from `source`. On parse failure the active snapshot
    /// stays in place.
    pub fn apply_raw(&self, data: &[u8], source: SpecsSource) -> Result<ApplyOutcome> {
        let values = SpecsResponse::from_slice(data).map_err(|err| {
            self.logger.error(
                TAG,
                format_args!("failed to parse {source} values: {err}"),
            );
            err
        })?;

        if !values.has_updates {
            self.ops
                .increment(metrics::CONFIG_NO_UPDATE, 1.0, &[("source", source.to_string())]);
            return Ok(ApplyOutcome::NoUpdates);
        }

        let unparsed = values.unparsed_count();
        if unparsed > 0 {
            self.logger.warn(
                TAG,
                format_args!("{unparsed} definitions from {source} could not be parsed"),
            );
        }

        Ok(self.apply(SpecSnapshot::new(values, source)))
    }

    /// Apply a caller-provided payload before (or instead of) the first network fetch.
    pub fn bootstrap(&self, payload: &str) -> Result<ApplyOutcome> {
        self.apply_raw(payload.as_bytes(), SpecsSource::Bootstrap)
    }

    /// Apply a payload fetched from the network and write it back to the data store.
    pub async fn apply_network_payload(&self, data: &[u8]) -> Result<ApplyOutcome> {
        let outcome = self.apply_raw(data, SpecsSource::Network)?;

        if let (ApplyOutcome::Applied { lcut, .. }, Some(data_store)) = (outcome, &self.data_store)
        {
            let value = String::from_utf8_lossy(data);
            if let Err(err) = data_store.set(&self.data_store_key, &value, Some(lcut)).await {
                self.logger.warn(
                    TAG,
                    format_args!("failed to write values to data store: {err}"),
                );
                self.ops.error(TAG, &err);
            }
        }

        Ok(outcome)
    }

    /// Read values from the data store, if one is configured and holds any.
    pub async fn load_from_data_store(&self) -> Result<Option<ApplyOutcome>> {
        let Some(data_store) = &self.data_store else {
            return Ok(None);
        };
        match data_store.get(&self.data_store_key).await? {
            Some(response) => self
                .apply_raw(response.result.as_bytes(), SpecsSource::DataStore)
                .map(Some),
            None => Ok(None),
        }
    }

    pub(crate) async fn data_store_supports_polling(&self) -> bool {
        match &self.data_store {
            Some(data_store) => {
                data_store
                    .support_polling_updates_for(&self.data_store_key)
                    .await
            }
            None => false,
        }
    }

    pub(crate) fn data_store(&self) -> Option<&Arc<dyn DataStore>> {
        self.data_store.as_ref()
    }
}

pub(crate) fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
