//! The shipping pipeline
//!
//! ```text
//!  resolve range ─▶ windows ─▶ producer ──[handles]──▶ assembler ──[payloads]──▶ senders × N ─▶ remote
//!                              (blocking)  cap N+1     (blocking)    cap N+1       (async)
//! ```
//!
//! Both queues are bounded, so a slow remote stalls the assembler, which
//! stalls the producer. The first fatal error in any unit cancels a shared
//! token; every unit then stops, and dropping queue ends unblocks whoever is
//! waiting on them. Fetch handles left in flight are released on drop.

use crate::ship::convert::{BatchAssembler, LabelCollision, SealedBatch};
use crate::ship::encode::{self, encode_batch, CompressedPayload};
use crate::ship::error::{ShipError, ShipResult};
use crate::ship::fetch::produce_windows;
use crate::ship::range::resolve_time_range;
use crate::ship::sender::{spawn_senders, RemoteWriteClient};
use crate::ship::window::windows;
use crate::storage::{FetchHandle, Store};
use reqwest::Url;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Settings for one shipping run
#[derive(Debug, Clone)]
pub struct ShipOptions {
    pub url: Url,
    /// Requested lower bound, inclusive, in milliseconds
    pub mint: i64,
    /// Requested upper bound, inclusive, in milliseconds
    pub maxt: i64,
    /// Window width in seconds
    pub partition_secs: i64,
    pub concurrency: usize,
    pub max_batch_bytes: usize,
    pub timeout: Duration,
    /// Extra labels added to every series, in this order
    pub external_labels: Vec<(String, String)>,
    pub label_collision: LabelCollision,
}

impl ShipOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            mint: i64::MIN,
            maxt: chrono::Utc::now().timestamp_millis(),
            partition_secs: 3600,
            concurrency: 4,
            max_batch_bytes: 1024 * 1024,
            timeout: Duration::from_secs(30),
            external_labels: Vec::new(),
            label_collision: LabelCollision::Keep,
        }
    }

    fn validate(&self) -> ShipResult<()> {
        if self.concurrency == 0 {
            return Err(ShipError::Configuration(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.max_batch_bytes == 0 {
            return Err(ShipError::Configuration(
                "max batch bytes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Totals of a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShipReport {
    pub windows: u64,
    pub series: u64,
    pub samples: u64,
    pub batches: u64,
    pub requests: u64,
    pub bytes: u64,
}

impl fmt::Display for ShipReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Shipping Report")?;
        writeln!(f, "===============")?;
        writeln!(f, "Windows:  {}", self.windows)?;
        writeln!(f, "Series:   {}", self.series)?;
        writeln!(f, "Samples:  {}", self.samples)?;
        writeln!(f, "Batches:  {}", self.batches)?;
        writeln!(f, "Requests: {}", self.requests)?;
        write!(f, "Bytes:    {}", self.bytes)
    }
}

/// Counters updated by every unit while the pipeline runs
#[derive(Debug, Default)]
pub(crate) struct Progress {
    windows: AtomicU64,
    series: AtomicU64,
    samples: AtomicU64,
    batches: AtomicU64,
    requests: AtomicU64,
    bytes: AtomicU64,
}

impl Progress {
    pub(crate) fn add_window(&self) {
        self.windows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_totals(&self, series: u64, samples: u64) {
        self.series.store(series, Ordering::Relaxed);
        self.samples.store(samples, Ordering::Relaxed);
    }

    pub(crate) fn add_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_request(&self, bytes: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ShipReport {
        ShipReport {
            windows: self.windows.load(Ordering::Relaxed),
            series: self.series.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Cancel the run if `result` is a unit's own failure
pub(crate) fn fail_fast<T>(
    cancel: &CancellationToken,
    stage: &'static str,
    result: ShipResult<T>,
) -> ShipResult<T> {
    if let Err(e) = &result {
        if !e.is_cancelled() {
            tracing::error!(stage, error = %e, "pipeline unit failed");
            cancel.cancel();
        }
    }
    result
}

/// Drain fetched windows into batches and queue their payloads
///
/// Runs on a blocking thread. Each handle is closed before the next window
/// is taken; the final partial batch is always emitted.
fn assemble_batches(
    mut handles: mpsc::Receiver<FetchHandle>,
    payloads: mpsc::Sender<CompressedPayload>,
    mut assembler: BatchAssembler,
    cancel: &CancellationToken,
    progress: &Progress,
) -> ShipResult<()> {
    while let Some(mut handle) = handles.blocking_recv() {
        while let Some(series) = handle.next_series()? {
            if cancel.is_cancelled() {
                return Err(ShipError::Cancelled);
            }
            if let Some(batch) = assembler.add_series(series)? {
                emit(&payloads, batch, progress)?;
            }
        }

        progress.set_totals(assembler.total_series(), assembler.total_samples());
        tracing::info!(
            stage = "assemble_batches",
            range = %handle.range(),
            total_series = assembler.total_series(),
            total_samples = assembler.total_samples(),
            "closing querier for range"
        );
        handle.close()?;
    }

    if cancel.is_cancelled() {
        return Err(ShipError::Cancelled);
    }

    emit(&payloads, assembler.finish(), progress)
}

fn emit(
    payloads: &mpsc::Sender<CompressedPayload>,
    batch: SealedBatch,
    progress: &Progress,
) -> ShipResult<()> {
    let estimated = batch.bytes;
    let payload = encode_batch(batch.series)?;

    tracing::debug!(
        stage = "assemble_batches",
        series = payload.series,
        samples = payload.samples,
        estimated_bytes = estimated,
        compressed_bytes = payload.len(),
        "batch sealed"
    );

    progress.add_batch();
    // The senders dropped their end: they have stopped
    payloads
        .blocking_send(payload)
        .map_err(|_| ShipError::Cancelled)
}

/// Ships a store's history to a remote-write endpoint
pub struct Shipper {
    store: Arc<dyn Store>,
    options: ShipOptions,
}

impl Shipper {
    pub fn new(store: Arc<dyn Store>, options: ShipOptions) -> Self {
        Self { store, options }
    }

    /// Run the pipeline to completion or to the first fatal error
    pub async fn run(&self) -> ShipResult<ShipReport> {
        let opts = &self.options;
        opts.validate()?;

        let resolved = resolve_time_range(self.store.as_ref(), opts.mint, opts.maxt)?;
        tracing::info!(stage = "ship", from = resolved.mint, to = resolved.maxt, "resolved range");

        if resolved.is_empty() {
            tracing::info!(stage = "ship", "no data in requested range, nothing to ship");
            return Ok(ShipReport::default());
        }

        let client = Arc::new(RemoteWriteClient::new(opts.url.clone(), opts.timeout)?);
        let cancel = CancellationToken::new();
        let progress = Arc::new(Progress::default());

        let (handle_tx, handle_rx) = mpsc::channel::<FetchHandle>(opts.concurrency + 1);
        let (payload_tx, payload_rx) = mpsc::channel::<CompressedPayload>(opts.concurrency + 1);

        let mut senders = spawn_senders(
            opts.concurrency,
            client,
            payload_rx,
            cancel.clone(),
            progress.clone(),
        );

        let external = opts
            .external_labels
            .iter()
            .map(|(name, value)| encode::Label {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        let assembler = BatchAssembler::new(opts.max_batch_bytes, external, opts.label_collision);

        let assembling = {
            let cancel = cancel.clone();
            let progress = progress.clone();
            tokio::task::spawn_blocking(move || {
                let result = assemble_batches(handle_rx, payload_tx, assembler, &cancel, &progress);
                fail_fast(&cancel, "assemble_batches", result)
            })
        };

        let producing = {
            let store = self.store.clone();
            let windows = windows(resolved, opts.partition_secs);
            let cancel = cancel.clone();
            let progress = progress.clone();
            tokio::task::spawn_blocking(move || {
                // Cancel before closing the queue: a closed queue alone means done
                let result =
                    produce_windows(store.as_ref(), windows, handle_tx.clone(), &cancel, &progress);
                let result = fail_fast(&cancel, "fetch_window", result);
                drop(handle_tx);
                result
            })
        };

        tracing::info!(stage = "ship", "waiting for senders to finish");

        let mut results = vec![
            flatten(&cancel, producing.await),
            flatten(&cancel, assembling.await),
        ];
        while let Some(joined) = senders.join_next().await {
            results.push(flatten(&cancel, joined));
        }

        let report = progress.snapshot();

        let mut cancelled = false;
        for result in results {
            match result {
                Ok(()) => {}
                Err(ShipError::Cancelled) => cancelled = true,
                Err(e) => return Err(e),
            }
        }
        if cancelled {
            return Err(ShipError::Cancelled);
        }

        tracing::info!(
            stage = "ship",
            windows = report.windows,
            series = report.series,
            samples = report.samples,
            batches = report.batches,
            bytes = report.bytes,
            "finished"
        );

        Ok(report)
    }
}

/// Turn a panicked or aborted task into a pipeline error
fn flatten(
    cancel: &CancellationToken,
    joined: Result<ShipResult<()>, tokio::task::JoinError>,
) -> ShipResult<()> {
    match joined {
        Ok(result) => result,
        Err(e) => fail_fast(cancel, "ship", Err(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Labels, WritableStore};
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// In-process remote-write receiver recording decoded requests
    #[derive(Clone, Default)]
    struct Receiver {
        requests: Arc<Mutex<Vec<encode::WriteRequest>>>,
    }

    async fn receive(State(rx): State<Receiver>, body: Bytes) -> StatusCode {
        match encode::decode_payload(&body) {
            Ok(request) => {
                rx.requests.lock().unwrap().push(request);
                StatusCode::NO_CONTENT
            }
            Err(_) => StatusCode::BAD_REQUEST,
        }
    }

    impl Receiver {
        async fn start(status: Option<StatusCode>) -> (Self, Url) {
            let receiver = Receiver::default();
            let router: Router = match status {
                None => Router::new()
                    .route("/api/v1/write", post(receive))
                    .with_state(receiver.clone()),
                Some(status) => Router::new().route("/api/v1/write", post(move || async move { status })),
            };

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });

            (receiver, Url::parse(&format!("http://{}/api/v1/write", addr)).unwrap())
        }

        fn requests(&self) -> Vec<encode::WriteRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn store_with(dir: &std::path::Path, series: &[(&str, Vec<i64>)]) -> Arc<dyn Store> {
        let store = WritableStore::open(dir).unwrap();
        let mut app = store.appender().unwrap();
        for (name, timestamps) in series {
            let labels = Labels::from_pairs([("__name__", *name), ("job", "node")]);
            for &t in timestamps {
                app.add(&labels, t, t as f64 / 1000.0);
            }
        }
        app.commit().unwrap();
        store.flush_head().unwrap();
        Arc::new(store)
    }

    fn options(url: Url) -> ShipOptions {
        ShipOptions {
            mint: i64::MIN,
            maxt: i64::MAX,
            ..ShipOptions::new(url)
        }
    }

    #[tokio::test]
    async fn test_single_series_ships_as_one_batch() {
        let (receiver, url) = Receiver::start(None).await;
        let dir = tempdir().unwrap();
        let t0 = 1_700_000_000_000;
        let timestamps: Vec<i64> = (0..10).map(|i| t0 + i * 1000).collect();
        let store = store_with(dir.path(), &[("up", timestamps.clone())]);

        let opts = ShipOptions {
            partition_secs: 1,
            ..options(url)
        };
        let report = Shipper::new(store.clone(), opts).run().await.unwrap();

        let requests = receiver.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(report.batches, 1);
        assert_eq!(report.requests, 1);
        assert_eq!(report.samples, 10);

        // One window per second: every record carries the same labels
        let shipped: Vec<i64> = requests[0]
            .timeseries
            .iter()
            .flat_map(|ts| ts.samples.iter().map(|s| s.timestamp))
            .collect();
        assert_eq!(shipped, timestamps);
        for ts in &requests[0].timeseries {
            assert_eq!(ts.labels, requests[0].timeseries[0].labels);
        }
        assert_eq!(store.open_queriers(), 0);
    }

    #[tokio::test]
    async fn test_wide_window_gives_one_series_record() {
        let (receiver, url) = Receiver::start(None).await;
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[("up", (0..10).map(|i| i * 1000).collect())]);

        let report = Shipper::new(store, options(url)).run().await.unwrap();

        let requests = receiver.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].timeseries.len(), 1);
        assert_eq!(requests[0].timeseries[0].samples.len(), 10);
        assert_eq!(report.series, 1);
        assert_eq!(report.windows, 1);
    }

    #[tokio::test]
    async fn test_external_labels_shipped_first() {
        let (receiver, url) = Receiver::start(None).await;
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[("up", vec![1000])]);

        let opts = ShipOptions {
            external_labels: vec![("region".into(), "eu".into())],
            ..options(url)
        };
        Shipper::new(store, opts).run().await.unwrap();

        let labels: Vec<(String, String)> = receiver.requests()[0].timeseries[0]
            .labels
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("region".to_string(), "eu".to_string()),
                ("__name__".to_string(), "up".to_string()),
                ("job".to_string(), "node".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_range_outside_data_ships_nothing() {
        // Nothing listens here; any request would fail the run
        let url = Url::parse("http://127.0.0.1:9/api/v1/write").unwrap();
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[("up", vec![1000, 2000])]);

        let opts = ShipOptions {
            mint: 10_000,
            maxt: 20_000,
            ..options(url)
        };
        let report = Shipper::new(store, opts).run().await.unwrap();
        assert_eq!(report, ShipReport::default());
    }

    #[tokio::test]
    async fn test_empty_store_ships_nothing() {
        let url = Url::parse("http://127.0.0.1:9/api/v1/write").unwrap();
        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(WritableStore::open(dir.path()).unwrap());

        let report = Shipper::new(store, options(url)).run().await.unwrap();
        assert_eq!(report.batches, 0);
    }

    #[tokio::test]
    async fn test_many_series_split_into_batches() {
        let (receiver, url) = Receiver::start(None).await;
        let dir = tempdir().unwrap();
        let names: Vec<String> = (0..50).map(|i| format!("metric_{i:02}")).collect();
        let series: Vec<(&str, Vec<i64>)> = names
            .iter()
            .map(|n| (n.as_str(), (0..20).map(|i| i * 1000).collect()))
            .collect();
        let store = store_with(dir.path(), &series);

        let opts = ShipOptions {
            max_batch_bytes: 2048,
            concurrency: 3,
            ..options(url)
        };
        let report = Shipper::new(store.clone(), opts).run().await.unwrap();

        let requests = receiver.requests();
        assert!(requests.len() > 1);
        assert_eq!(report.requests, requests.len() as u64);
        assert_eq!(report.batches, requests.len() as u64);

        let shipped_series: usize = requests.iter().map(|r| r.timeseries.len()).sum();
        let shipped_samples: usize = requests
            .iter()
            .flat_map(|r| r.timeseries.iter())
            .map(|ts| ts.samples.len())
            .sum();
        assert_eq!(shipped_series, 50);
        assert_eq!(shipped_samples, 1000);
        assert_eq!(report.samples, 1000);
        assert_eq!(store.open_queriers(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_fails_fast() {
        let (_receiver, url) = Receiver::start(Some(StatusCode::INTERNAL_SERVER_ERROR)).await;
        let dir = tempdir().unwrap();
        let names: Vec<String> = (0..20).map(|i| format!("metric_{i:02}")).collect();
        let series: Vec<(&str, Vec<i64>)> = names
            .iter()
            .map(|n| (n.as_str(), (0..3600).map(|i| i * 1000).collect()))
            .collect();
        let store = store_with(dir.path(), &series);

        let opts = ShipOptions {
            partition_secs: 60,
            max_batch_bytes: 1024,
            concurrency: 2,
            ..options(url)
        };
        let err = Shipper::new(store.clone(), opts).run().await.unwrap_err();

        assert!(matches!(
            err,
            ShipError::RemoteRejection { status: 500, .. }
        ));
        // Every fetch handle was released despite the abort
        assert_eq!(store.open_queriers(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_halts_further_sends() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/api/v1/write",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let url = Url::parse(&format!("http://{}/api/v1/write", addr)).unwrap();

        let dir = tempdir().unwrap();
        let names: Vec<String> = (0..50).map(|i| format!("metric_{i:02}")).collect();
        let series: Vec<(&str, Vec<i64>)> = names
            .iter()
            .map(|n| (n.as_str(), (0..20).map(|i| i * 1000).collect()))
            .collect();
        let store = store_with(dir.path(), &series);

        let concurrency = 3;
        let opts = ShipOptions {
            max_batch_bytes: 256,
            concurrency,
            ..options(url)
        };
        let err = Shipper::new(store.clone(), opts).run().await.unwrap_err();

        assert!(matches!(err, ShipError::RemoteRejection { status: 500, .. }));
        // Each sender stops after its own failure or the first one it observes
        let hits = hits.load(Ordering::SeqCst);
        assert!(hits >= 1);
        assert!(hits <= concurrency, "{hits} requests sent");
        assert_eq!(store.open_queriers(), 0);
    }

    #[tokio::test]
    async fn test_closed_store_is_storage_error() {
        let url = Url::parse("http://127.0.0.1:9/api/v1/write").unwrap();
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[("up", vec![1000])]);
        store.close().unwrap();

        let err = Shipper::new(store, options(url)).run().await.unwrap_err();
        assert!(matches!(err, ShipError::StorageAccess(_)));
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let url = Url::parse("http://127.0.0.1:9/api/v1/write").unwrap();
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[("up", vec![1000])]);

        let opts = ShipOptions {
            concurrency: 0,
            ..options(url)
        };
        assert!(matches!(
            Shipper::new(store, opts).run().await,
            Err(ShipError::Configuration(_))
        ));
    }
}
