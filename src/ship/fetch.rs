//! Per-window fetching and the window producer

use crate::ship::error::{ShipError, ShipResult};
use crate::ship::pipeline::Progress;
use crate::ship::window::Windows;
use crate::storage::{FetchHandle, Store, TimeRange};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Open a querier over one window
pub fn fetch_window(store: &dyn Store, range: TimeRange) -> ShipResult<FetchHandle> {
    tracing::info!(
        stage = "fetch_window",
        from = range.mint,
        to = range.maxt,
        "getting querier for range"
    );

    Ok(store.querier(range)?)
}

/// Fetch every window in order and queue the handles for the assembler
///
/// Runs on a blocking thread. The bounded queue limits how far fetching can
/// run ahead of consumption.
pub(crate) fn produce_windows(
    store: &dyn Store,
    windows: Windows,
    queue: mpsc::Sender<FetchHandle>,
    cancel: &CancellationToken,
    progress: &Progress,
) -> ShipResult<()> {
    for range in windows {
        if cancel.is_cancelled() {
            return Err(ShipError::Cancelled);
        }

        let handle = fetch_window(store, range)?;
        progress.add_window();

        // The assembler dropped its end: it has stopped
        if queue.blocking_send(handle).is_err() {
            return Err(ShipError::Cancelled);
        }
    }

    tracing::debug!(stage = "fetch_window", "all windows queued");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ship::range::ResolvedRange;
    use crate::ship::window::windows;
    use crate::storage::{Labels, StorageError, WritableStore};
    use tempfile::tempdir;

    #[test]
    fn test_fetch_window_clips_to_window() {
        let dir = tempdir().unwrap();
        let store = WritableStore::open(dir.path()).unwrap();

        let mut app = store.appender().unwrap();
        for t in 0..10 {
            app.add(&Labels::from_pairs([("__name__", "up")]), t * 1000, 1.0);
        }
        app.commit().unwrap();

        let mut handle = fetch_window(&store, TimeRange::new(2000, 4000)).unwrap();
        let series = handle.next_series().unwrap().unwrap();
        let ts: Vec<i64> = series.map(|s| s.unwrap().timestamp).collect();
        assert_eq!(ts, vec![2000, 3000]);

        handle.close().unwrap();
        assert_eq!(store.open_queriers(), 0);
    }

    #[test]
    fn test_fetch_on_closed_store_is_storage_error() {
        let dir = tempdir().unwrap();
        let store = WritableStore::open(dir.path()).unwrap();
        store.close().unwrap();

        let err = fetch_window(&store, TimeRange::new(0, 1)).unwrap_err();
        assert!(matches!(err, ShipError::StorageAccess(StorageError::Closed)));
    }

    #[test]
    fn test_producer_stops_when_consumer_is_gone() {
        let dir = tempdir().unwrap();
        let store = WritableStore::open(dir.path()).unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let progress = Progress::default();
        let err = produce_windows(
            &store,
            windows(ResolvedRange { mint: 0, maxt: 10_000 }, 1),
            tx,
            &CancellationToken::new(),
            &progress,
        )
        .unwrap_err();

        assert!(err.is_cancelled());
        // The handle that could not be queued was released
        assert_eq!(store.open_queriers(), 0);
    }

    #[test]
    fn test_producer_observes_cancellation() {
        let dir = tempdir().unwrap();
        let store = WritableStore::open(dir.path()).unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let progress = Progress::default();
        let err = produce_windows(
            &store,
            windows(ResolvedRange { mint: 0, maxt: 10_000 }, 1),
            tx,
            &cancel,
            &progress,
        )
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(progress.snapshot().windows, 0);
    }

    #[test]
    fn test_producer_queues_every_window() {
        let dir = tempdir().unwrap();
        let store = WritableStore::open(dir.path()).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let progress = Progress::default();
        produce_windows(
            &store,
            windows(ResolvedRange { mint: 0, maxt: 2500 }, 1),
            tx,
            &CancellationToken::new(),
            &progress,
        )
        .unwrap();

        let mut ranges = Vec::new();
        while let Ok(handle) = rx.try_recv() {
            ranges.push(handle.range());
        }
        assert_eq!(
            ranges,
            vec![
                TimeRange::new(0, 1000),
                TimeRange::new(1000, 2000),
                TimeRange::new(2000, 3000)
            ]
        );
        assert_eq!(progress.snapshot().windows, 3);
        assert_eq!(store.open_queriers(), 0);
    }
}
