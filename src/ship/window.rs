//! Fixed-width windows over a resolved range

use crate::ship::range::ResolvedRange;
use crate::storage::TimeRange;

/// Width in milliseconds of a window of `partition_secs` seconds (at least 1 s)
pub fn window_width(partition_secs: i64) -> i64 {
    partition_secs.max(1).saturating_mul(1000)
}

/// Consecutive half-open windows `[current, current + width)` covering a
/// resolved range
///
/// The last window may reach past `maxt`; the store clips what it returns to
/// the window it is asked for.
#[derive(Debug, Clone)]
pub struct Windows {
    current: i64,
    maxt: i64,
    width: i64,
    done: bool,
}

impl Iterator for Windows {
    type Item = TimeRange;

    fn next(&mut self) -> Option<TimeRange> {
        if self.done || self.current > self.maxt {
            return None;
        }

        let mint = self.current;
        let maxt = mint.saturating_add(self.width);

        match mint.checked_add(self.width) {
            Some(next) => self.current = next,
            None => self.done = true,
        }

        Some(TimeRange::new(mint, maxt))
    }
}

/// Split `resolved` into windows of `partition_secs` seconds
///
/// An empty resolved range yields no windows.
pub fn windows(resolved: ResolvedRange, partition_secs: i64) -> Windows {
    Windows {
        current: resolved.mint,
        maxt: resolved.maxt,
        width: window_width(partition_secs),
        done: resolved.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(mint: i64, maxt: i64, partition: i64) -> Vec<(i64, i64)> {
        windows(ResolvedRange { mint, maxt }, partition)
            .map(|w| (w.mint, w.maxt))
            .collect()
    }

    #[test]
    fn test_hour_window_over_ten_seconds() {
        assert_eq!(collect(0, 10_000, 3600), vec![(0, 3_600_000)]);
    }

    #[test]
    fn test_range_in_milliseconds_of_hours() {
        // [0, 10_000_000] ms spans three hour-wide windows
        assert_eq!(
            collect(0, 10_000_000, 3600),
            vec![
                (0, 3_600_000),
                (3_600_000, 7_200_000),
                (7_200_000, 10_800_000)
            ]
        );
    }

    #[test]
    fn test_windows_are_contiguous() {
        let all: Vec<TimeRange> = windows(ResolvedRange { mint: 500, maxt: 4500 }, 1).collect();

        assert_eq!(all.first().unwrap().mint, 500);
        assert!(all.last().unwrap().maxt > 4500);
        for pair in all.windows(2) {
            assert_eq!(pair[0].maxt, pair[1].mint);
        }
    }

    #[test]
    fn test_single_point_range() {
        assert_eq!(collect(7, 7, 1), vec![(7, 1007)]);
    }

    #[test]
    fn test_non_positive_partition_means_one_second() {
        assert_eq!(collect(0, 1500, 0), vec![(0, 1000), (1000, 2000)]);
        assert_eq!(collect(0, 500, -5), vec![(0, 1000)]);
    }

    #[test]
    fn test_empty_range_yields_nothing() {
        assert!(collect(10, 5, 1).is_empty());
    }

    #[test]
    fn test_near_max_does_not_overflow() {
        let all = collect(i64::MAX - 1500, i64::MAX, 1);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].1, i64::MAX);
    }

    #[test]
    fn test_restartable() {
        let iter = windows(ResolvedRange { mint: 0, maxt: 5000 }, 2);
        let first: Vec<TimeRange> = iter.clone().collect();
        let second: Vec<TimeRange> = iter.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }
}
