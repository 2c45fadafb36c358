//! Remote-write client and the sender pool

use crate::ship::encode::CompressedPayload;
use crate::ship::error::{ShipError, ShipResult};
use crate::ship::pipeline::{fail_fast, Progress};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const REMOTE_WRITE_VERSION: &str = "0.1.0";

/// Longest response body kept in a rejection error
const MAX_ERROR_BODY: usize = 512;

/// HTTP client posting compressed write requests to one endpoint
#[derive(Debug, Clone)]
pub struct RemoteWriteClient {
    client: Client,
    url: Url,
}

impl RemoteWriteClient {
    /// Create a client whose requests each time out after `timeout`
    pub fn new(url: Url, timeout: Duration) -> ShipResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tsdb-shipper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ShipError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, url })
    }

    /// POST one payload; anything but `204 No Content` is a rejection
    pub async fn send(&self, payload: CompressedPayload) -> ShipResult<()> {
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_ENCODING, "snappy")
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION)
            .body(payload.data)
            .send()
            .await?;

        let status = response.status();
        // Drain the body so the connection can be reused
        let body = response.text().await?;

        if status != StatusCode::NO_CONTENT {
            let mut body = body;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ShipError::RemoteRejection {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Start `concurrency` workers sharing one payload queue
///
/// Each worker exits when the queue is closed and drained, when any unit
/// cancels the run, or after its own first failure (which cancels the run).
pub(crate) fn spawn_senders(
    concurrency: usize,
    client: Arc<RemoteWriteClient>,
    queue: mpsc::Receiver<CompressedPayload>,
    cancel: CancellationToken,
    progress: Arc<Progress>,
) -> JoinSet<ShipResult<()>> {
    let queue = Arc::new(Mutex::new(queue));
    let mut workers = JoinSet::new();

    for id in 0..concurrency {
        let client = client.clone();
        let queue = queue.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();

        workers.spawn(async move {
            let result = run_sender(id, &client, &queue, &cancel, &progress).await;
            fail_fast(&cancel, "send_batches", result)
        });
    }

    workers
}

async fn run_sender(
    id: usize,
    client: &RemoteWriteClient,
    queue: &Mutex<mpsc::Receiver<CompressedPayload>>,
    cancel: &CancellationToken,
    progress: &Progress,
) -> ShipResult<()> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ShipError::Cancelled),
            next = async { queue.lock().await.recv().await } => next,
        };

        let Some(payload) = next else {
            tracing::debug!(stage = "send_batches", sender = id, "sender finished");
            return Ok(());
        };

        let bytes = payload.len() as u64;
        let series = payload.series;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ShipError::Cancelled),
            sent = client.send(payload) => sent?,
        }

        progress.add_request(bytes);
        tracing::debug!(
            stage = "send_batches",
            sender = id,
            series,
            bytes,
            "batch delivered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ship::encode::encode_batch;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{}/api/v1/write", addr)).unwrap()
    }

    fn payload() -> CompressedPayload {
        encode_batch(Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn test_send_sets_remote_write_headers() {
        let router = Router::new().route(
            "/api/v1/write",
            post(|headers: axum::http::HeaderMap| async move {
                let ok = headers.get("content-encoding").map(|v| v == "snappy") == Some(true)
                    && headers.get("content-type").map(|v| v == "application/x-protobuf") == Some(true)
                    && headers.get("x-prometheus-remote-write-version").map(|v| v == "0.1.0") == Some(true)
                    && headers
                        .get("user-agent")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.starts_with("tsdb-shipper/"));
                if ok {
                    AxumStatus::NO_CONTENT
                } else {
                    AxumStatus::BAD_REQUEST
                }
            }),
        );
        let url = serve(router).await;

        let client = RemoteWriteClient::new(url, Duration::from_secs(5)).unwrap();
        client.send(payload()).await.unwrap();
    }

    #[tokio::test]
    async fn test_200_is_a_rejection() {
        let router = Router::new().route("/api/v1/write", post(|| async { "stored" }));
        let url = serve(router).await;

        let client = RemoteWriteClient::new(url, Duration::from_secs(5)).unwrap();
        let err = client.send(payload()).await.unwrap_err();

        match err {
            ShipError::RemoteRejection { status, body } => {
                assert_eq!(status, 200);
                assert_eq!(body, "stored");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_transport_error() {
        let router = Router::new().route(
            "/api/v1/write",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                AxumStatus::NO_CONTENT
            }),
        );
        let url = serve(router).await;

        let client = RemoteWriteClient::new(url, Duration::from_millis(100)).unwrap();
        let err = client.send(payload()).await.unwrap_err();
        assert!(matches!(err, ShipError::Transport(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{}/", addr)).unwrap();
        let client = RemoteWriteClient::new(url, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            client.send(payload()).await,
            Err(ShipError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_drains_queue_then_exits() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/api/v1/write",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::NO_CONTENT
                }
            }),
        );
        let url = serve(router).await;

        let client = Arc::new(RemoteWriteClient::new(url, Duration::from_secs(5)).unwrap());
        let (tx, rx) = mpsc::channel(4);
        let progress = Arc::new(Progress::default());
        let mut workers = spawn_senders(3, client, rx, CancellationToken::new(), progress.clone());

        for _ in 0..10 {
            tx.send(payload()).await.unwrap();
        }
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(progress.snapshot().requests, 10);
    }

    #[tokio::test]
    async fn test_one_failure_stops_the_pool() {
        let router = Router::new().route(
            "/api/v1/write",
            post(|| async { AxumStatus::INTERNAL_SERVER_ERROR }),
        );
        let url = serve(router).await;

        let client = Arc::new(RemoteWriteClient::new(url, Duration::from_secs(5)).unwrap());
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let mut workers = spawn_senders(2, client, rx, cancel.clone(), Arc::new(Progress::default()));

        tx.send(payload()).await.unwrap();

        let mut rejections = 0;
        while let Some(joined) = workers.join_next().await {
            match joined.unwrap() {
                Err(ShipError::RemoteRejection { status: 500, .. }) => rejections += 1,
                Err(ShipError::Cancelled) => {}
                other => panic!("unexpected result: {other:?}"),
            }
        }

        assert_eq!(rejections, 1);
        assert!(cancel.is_cancelled());
        // The queue's receiver is gone with the workers
        assert!(tx.send(payload()).await.is_err());
    }
}
