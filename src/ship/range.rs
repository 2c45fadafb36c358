//! Effective time range resolution
//!
//! Narrows the requested range to the bounds actually backed by data in the
//! store's blocks and head.

use crate::ship::error::ShipResult;
use crate::storage::Store;
use std::fmt;

/// Closed range `[mint, maxt]` left after clamping to the store's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub mint: i64,
    pub maxt: i64,
}

impl ResolvedRange {
    /// Nothing to ship
    pub fn is_empty(&self) -> bool {
        self.mint > self.maxt
    }
}

impl fmt::Display for ResolvedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.mint, self.maxt)
    }
}

/// Intersect `[req_mint, req_maxt]` with the data bounds of `store`
///
/// A store with neither blocks nor head samples resolves to an empty range.
pub fn resolve_time_range(store: &dyn Store, req_mint: i64, req_maxt: i64) -> ShipResult<ResolvedRange> {
    let mut data_mint = i64::MAX;
    let mut data_maxt = i64::MIN;

    for meta in store.block_metas()? {
        data_mint = data_mint.min(meta.min_time);
        data_maxt = data_maxt.max(meta.max_time);
    }

    tracing::info!(
        stage = "check_time_range",
        mint = data_mint,
        maxt = data_maxt,
        "According to blocks"
    );

    if let Some((head_mint, head_maxt)) = store.head_bounds()? {
        data_mint = data_mint.min(head_mint);
        data_maxt = data_maxt.max(head_maxt);

        tracing::info!(
            stage = "check_time_range",
            mint = data_mint,
            maxt = data_maxt,
            "According to head"
        );
    }

    Ok(ResolvedRange {
        mint: data_mint.max(req_mint),
        maxt: data_maxt.min(req_maxt),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Labels, WritableStore};
    use tempfile::tempdir;

    fn store_with(dir: &std::path::Path, blocks: &[&[i64]], head: &[i64]) -> WritableStore {
        let store = WritableStore::open(dir).unwrap();
        let labels = Labels::from_pairs([("__name__", "up")]);

        for block in blocks {
            let mut app = store.appender().unwrap();
            for &t in *block {
                app.add(&labels, t, 1.0);
            }
            app.commit().unwrap();
            store.flush_head().unwrap();
        }

        let mut app = store.appender().unwrap();
        for &t in head {
            app.add(&labels, t, 1.0);
        }
        app.commit().unwrap();

        store
    }

    #[test]
    fn test_empty_store_resolves_empty() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[], &[]);

        let resolved = resolve_time_range(&store, i64::MIN, i64::MAX).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_request_inside_data_is_kept() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[&[0, 1000], &[5000, 9000]], &[]);

        let resolved = resolve_time_range(&store, 2000, 8000).unwrap();
        assert_eq!(resolved, ResolvedRange { mint: 2000, maxt: 8000 });
    }

    #[test]
    fn test_request_wider_than_data_is_clamped() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[&[1000, 2000]], &[3000, 4000]);

        let resolved = resolve_time_range(&store, i64::MIN, i64::MAX).unwrap();
        assert_eq!(resolved, ResolvedRange { mint: 1000, maxt: 4000 });
    }

    #[test]
    fn test_request_outside_data_is_empty() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &[&[1000, 2000]], &[]);

        assert!(resolve_time_range(&store, 5000, 6000).unwrap().is_empty());
        assert!(resolve_time_range(&store, 0, 500).unwrap().is_empty());
    }
}
