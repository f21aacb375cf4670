use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Window length from a configured number of seconds. Values past what chrono
/// can represent saturate at the largest span instead of panicking.
pub fn span_seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Time-bounded sliding window of samples, ordered by timestamp.
///
/// `push` appends at the back and evicts from the front every sample older
/// than `span` relative to the newest one, so eviction is amortized O(1).
/// Callers must push non-decreasing timestamps; an older sample is refused.
#[derive(Debug, Clone)]
pub struct SampleWindow<T> {
    span: Duration,
    samples: VecDeque<(DateTime<Utc>, T)>,
}

impl<T> SampleWindow<T> {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            samples: VecDeque::new(),
        }
    }

    /// Returns `false` (and keeps the window untouched) if `timestamp` is
    /// earlier than the newest sample.
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: T) -> bool {
        if let Some((last, _)) = self.samples.back() {
            if timestamp < *last {
                return false;
            }
        }
        self.samples.push_back((timestamp, value));
        let Some(cutoff) = timestamp.checked_sub_signed(self.span) else {
            return true;
        };
        while let Some((oldest, _)) = self.samples.front() {
            if *oldest < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        true
    }

    /// Configured retention span.
    pub fn span(&self) -> Duration {
        self.span
    }

    /// Time covered by the retained samples.
    pub fn covered(&self) -> Duration {
        match (self.samples.front(), self.samples.back()) {
            (Some((first, _)), Some((last, _))) => *last - *first,
            _ => Duration::zero(),
        }
    }

    pub fn oldest(&self) -> Option<&(DateTime<Utc>, T)> {
        self.samples.front()
    }

    pub fn latest(&self) -> Option<&(DateTime<Utc>, T)> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &(DateTime<Utc>, T)> + '_ {
        self.samples.iter()
    }

    /// Newest sample whose timestamp is at or before `at`.
    pub fn at_or_before(&self, at: DateTime<Utc>) -> Option<&(DateTime<Utc>, T)> {
        self.samples.iter().rev().find(|(ts, _)| *ts <= at)
    }

    /// Samples with timestamp at or after `from`, oldest first.
    pub fn since(&self, from: DateTime<Utc>) -> impl Iterator<Item = &(DateTime<Utc>, T)> + '_ {
        self.samples.iter().filter(move |(ts, _)| *ts >= from)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn never_retains_more_than_span() {
        let mut window = SampleWindow::new(Duration::seconds(10));
        for s in 0..100 {
            assert!(window.push(t(s), s));
            assert!(window.covered() <= Duration::seconds(10));
        }
        assert_eq!(window.len(), 11);
        assert_eq!(window.oldest().map(|(_, v)| *v), Some(89));
        assert_eq!(window.latest().map(|(_, v)| *v), Some(99));
    }

    #[test]
    fn oversized_spans_saturate_without_panicking() {
        assert_eq!(span_seconds(90), Duration::seconds(90));
        assert_eq!(span_seconds(u64::MAX), Duration::MAX);
        assert_eq!(span_seconds(10_000_000_000_000_000), Duration::MAX);

        let mut window = SampleWindow::new(span_seconds(u64::MAX));
        for s in 0..5 {
            assert!(window.push(t(s), s));
        }
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn older_sample_is_refused() {
        let mut window = SampleWindow::new(Duration::seconds(10));
        assert!(window.push(t(5), 1));
        assert!(!window.push(t(4), 2));
        assert!(window.push(t(5), 3));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn lookups() {
        let mut window = SampleWindow::new(Duration::seconds(60));
        for s in (0..30).step_by(5) {
            window.push(t(s), s);
        }
        assert_eq!(window.at_or_before(t(12)).map(|(_, v)| *v), Some(10));
        assert_eq!(window.since(t(20)).count(), 2);
        assert!(window.at_or_before(t(-1)).is_none());
    }
}
