use std::{
    collections::{HashMap, VecDeque},
    io::Write,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use flate2::{write::GzEncoder, Compression};
use serde::Serialize;
use tokio::{runtime::Handle, sync::Notify};

use crate::{
    background::{BackgroundTask, TaskSlot},
    events::{queue::EventQueue, StatsigEvent},
    metadata::StatsigMetadata,
    network::{NetworkClient, HEADER_EVENT_COUNT},
    observability::{metrics, OpsStats},
    output_logger::OutputLogger,
    Result, StatsigError,
};

const TAG: &str = "EventLogger";

/// A failed batch is retried on this many later flushes before it is dropped.
pub(crate) const MAX_FLUSH_RETRIES: u32 = 5;

/// Configuration for [`EventLogger`].
#[derive(Debug, Clone)]
pub struct EventLoggerConfig {
    pub log_event_url: String,
    pub flush_interval: Duration,
    pub max_queue_size: usize,
}

impl EventLoggerConfig {
    pub const DEFAULT_LOG_EVENT_URL: &'static str = "https://prodregistryv2.org/v1/log_event";
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1_000);
    pub const DEFAULT_MAX_QUEUE_SIZE: usize = 2_000;
}

impl Default for EventLoggerConfig {
    fn default() -> EventLoggerConfig {
        EventLoggerConfig {
            log_event_url: EventLoggerConfig::DEFAULT_LOG_EVENT_URL.to_owned(),
            flush_interval: EventLoggerConfig::DEFAULT_FLUSH_INTERVAL,
            max_queue_size: EventLoggerConfig::DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEventRequest<'a> {
    events: &'a [StatsigEvent],
    statsig_metadata: &'a StatsigMetadata,
}

struct FailedBatch {
    events: Vec<StatsigEvent>,
    attempts: u32,
}

/// Queues events and ships them to the log event endpoint in gzip-compressed batches.
///
/// Events are flushed on a timer, when the queue fills up, on [`EventLogger::flush`], and one
/// final time on [`EventLogger::shutdown`].
pub struct EventLogger {
    config: EventLoggerConfig,
    queue: EventQueue,
    failed_batches: Mutex<VecDeque<FailedBatch>>,
    network: NetworkClient,
    metadata: StatsigMetadata,
    // Serializes flushes so a second caller waits for the first network attempt to finish and
    // then finds whatever was queued in the meantime.
    flush_lock: tokio::sync::Mutex<()>,
    flush_requested: Notify,
    flush_task: TaskSlot,
    ops: OpsStats,
    logger: OutputLogger,
}

impl EventLogger {
    pub(crate) fn new(
        config: EventLoggerConfig,
        network: NetworkClient,
        metadata: StatsigMetadata,
        ops: OpsStats,
        logger: OutputLogger,
    ) -> EventLogger {
        EventLogger {
            queue: EventQueue::new(config.max_queue_size),
            config,
            failed_batches: Mutex::new(VecDeque::new()),
            network,
            metadata,
            flush_lock: tokio::sync::Mutex::new(()),
            flush_requested: Notify::new(),
            flush_task: TaskSlot::default(),
            ops,
            logger,
        }
    }

    pub fn metadata(&self) -> &StatsigMetadata {
        &self.metadata
    }

    /// Queue `event` for delivery. Never blocks on the network.
    ///
    /// Events enqueued after shutdown has started are dropped.
    pub fn enqueue(&self, event: StatsigEvent) {
        let Some(dropped) = self.queue.push(event) else {
            log::debug!(target: "statsig", "dropping event enqueued after shutdown");
            return;
        };

        if dropped > 0 {
            self.ops.increment(
                metrics::EVENTS_DROPPED,
                dropped as f64,
                &[("reason", "queue_full".to_owned())],
            );
            self.logger.warn(
                TAG,
                format_args!("event queue is full, dropped {dropped} oldest event(s)"),
            );
        }

        if self.queue.len() >= self.queue.max_size() {
            self.flush_requested.notify_one();
        }
    }

    /// Events not yet delivered: queued ones plus those kept for retry.
    pub fn pending_events(&self) -> usize {
        let retained: usize = self.lock_failed().iter().map(|b| b.events.len()).sum();
        self.queue.len() + retained
    }

    /// Send everything queued at call time as one batch, and retry batches that failed earlier.
    ///
    /// Resolves once the network attempts have completed. Returns the first delivery error, if
    /// any; failed batches are kept for the next flush. If the returned future is dropped before
    /// it completes, the batches it had not finished with are kept as well.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let mut result = Ok(());

        let mut in_flight = InFlightBatches {
            logger: self,
            batches: self.lock_failed().drain(..).collect(),
        };
        let events = self.queue.drain();
        if !events.is_empty() {
            in_flight.batches.push_back(FailedBatch {
                events,
                attempts: 0,
            });
        }

        while let Some(batch) = in_flight.batches.front_mut() {
            batch.attempts += 1;
            let sent = self.send_batch(&batch.events).await;
            let Some(batch) = in_flight.batches.pop_front() else {
                break;
            };
            if let Err(err) = sent {
                self.retain_failed(batch, &err);
                result = result.and(Err(err));
            }
        }

        let pending = self.lock_failed().len();
        self.ops
            .gauge(metrics::PENDING_FAILED_BATCHES, pending as f64, &[]);
        result
    }

    /// Start the periodic flush task on `runtime`.
    pub(crate) fn start_background_flush(self: &Arc<Self>, runtime: &Handle) {
        let weak = Arc::downgrade(self);
        let interval = self.config.flush_interval;
        let task = BackgroundTask::spawn(runtime, "statsig-event-flush", move |mut stop| {
            async move {
                loop {
                    let Some(wakeup) = weak.upgrade() else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = wakeup.flush_requested.notified() => {}
                        _ = stop.stopped() => return,
                    }
                    drop(wakeup);
                    run_scheduled_flush(&weak).await;
                }
            }
        });
        self.flush_task.set(task);
    }

    /// Stop the periodic flush task and wait for it to exit.
    pub(crate) async fn stop_background_flush(&self) -> Result<()> {
        self.flush_task.stop().await
    }

    pub(crate) fn abort_background_flush(&self) {
        self.flush_task.abort();
    }

    /// Stop accepting events, stop the timer and flush everything still queued.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.close();
        let stopped = self.stop_background_flush().await;
        let flushed = self.flush().await;
        stopped.and(flushed)
    }

    async fn send_batch(&self, events: &[StatsigEvent]) -> Result<()> {
        let body = serde_json::to_vec(&LogEventRequest {
            events,
            statsig_metadata: &self.metadata,
        })
        .map_err(|err| StatsigError::JsonParse("log event request", Arc::new(err)))?;
        let body = gzip(&body)?;

        let headers = HashMap::from([
            ("Content-Type".to_owned(), "application/json".to_owned()),
            ("Content-Encoding".to_owned(), "gzip".to_owned()),
            (HEADER_EVENT_COUNT.to_owned(), events.len().to_string()),
        ]);

        self.network
            .post(&self.config.log_event_url, headers, body)
            .await?;

        self.ops
            .increment(metrics::EVENTS_SENT, events.len() as f64, &[]);
        log::debug!(target: "statsig", count = events.len(); "flushed events");
        Ok(())
    }

    fn retain_failed(&self, batch: FailedBatch, err: &StatsigError) {
        let count = batch.events.len();
        let retryable = !matches!(err, StatsigError::NetworkDisabled | StatsigError::Gzip(_));
        if !retryable || batch.attempts >= MAX_FLUSH_RETRIES {
            self.ops.increment(
                metrics::EVENTS_DROPPED,
                count as f64,
                &[("reason", err.name().to_owned())],
            );
            self.logger.warn(
                TAG,
                format_args!("dropping {count} event(s) after failed delivery: {err}"),
            );
            return;
        }

        self.logger.debug(
            TAG,
            format_args!("failed to deliver {count} event(s), will retry: {err}"),
        );
        let mut failed = self.lock_failed();
        failed.push_back(batch);
        // Keep retained events within the queue budget.
        let mut retained: usize = failed.iter().map(|b| b.events.len()).sum();
        while retained > self.queue.max_size() && failed.len() > 1 {
            if let Some(oldest) = failed.pop_front() {
                retained -= oldest.events.len();
                self.ops.increment(
                    metrics::EVENTS_DROPPED,
                    oldest.events.len() as f64,
                    &[("reason", "retry_queue_full".to_owned())],
                );
            }
        }
    }

    fn lock_failed(&self) -> std::sync::MutexGuard<'_, VecDeque<FailedBatch>> {
        self.failed_batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Batches taken by a flush that has not finished with them. Dropping it hands the remaining
/// batches back to the retry list.
struct InFlightBatches<'a> {
    logger: &'a EventLogger,
    batches: VecDeque<FailedBatch>,
}

impl Drop for InFlightBatches<'_> {
    fn drop(&mut self) {
        if self.batches.is_empty() {
            return;
        }
        let mut failed = self.logger.lock_failed();
        while let Some(batch) = self.batches.pop_back() {
            failed.push_front(batch);
        }
    }
}

async fn run_scheduled_flush(weak: &Weak<EventLogger>) {
    let Some(logger) = weak.upgrade() else {
        return;
    };
    if let Err(err) = logger.flush().await {
        logger
            .logger
            .warn(TAG, format_args!("scheduled flush failed: {err}"));
        logger.ops.error(TAG, &err);
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
