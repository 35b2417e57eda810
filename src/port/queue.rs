//! Bounded sliding-window queue owned by an input port.
//!
//! Samples are ordered newest-first. Two bounds apply on every insert:
//! a maximum sample count and a maximum time window; samples are evicted
//! from the oldest end until both hold. Evictions are silent.

use crate::sample::{Sample, TIMESTAMP_RES};
use crate::{FlowgraphError, Result};
use std::collections::VecDeque;

/// Sliding window of samples, newest at index 0.
pub struct InputQueue {
    samples: VecDeque<Sample>,
    /// Maximum number of buffered samples; `0` disables the bound.
    max_samples: usize,
    /// Maximum buffered time window in seconds; `<= 0.0` disables the bound.
    max_seconds: f64,
}

impl InputQueue {
    /// Create a queue with the given bounds. Returns the queue and whether
    /// the bounds had to be forced to a one-sample queue (both bounds
    /// non-positive — the caller emits the warning).
    pub(crate) fn new(max_samples: usize, max_seconds: f64) -> (Self, bool) {
        let mut queue = Self {
            samples: VecDeque::new(),
            max_samples: 1,
            max_seconds: 0.0,
        };
        let forced = queue.set_bounds(max_samples, max_seconds);
        (queue, forced)
    }

    /// Replace the queue bounds. Returns true when the bounds were forced
    /// to a one-sample queue.
    pub(crate) fn set_bounds(&mut self, max_samples: usize, max_seconds: f64) -> bool {
        let forced = max_samples == 0 && max_seconds <= 0.0;
        self.max_samples = if forced { 1 } else { max_samples };
        self.max_seconds = max_seconds;
        forced
    }

    #[inline]
    pub(crate) fn max_samples(&self) -> usize {
        self.max_samples
    }

    #[inline]
    pub(crate) fn max_seconds(&self) -> f64 {
        self.max_seconds
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    /// Insert a sample at the newest end, then evict from the oldest end
    /// until both bounds hold.
    pub(crate) fn push(&mut self, sample: Sample) {
        self.samples.push_front(sample);
        if self.max_samples > 0 {
            while self.samples.len() > self.max_samples {
                self.samples.pop_back();
            }
        }
        if self.max_seconds > 0.0 {
            let window_us = self.max_seconds / TIMESTAMP_RES;
            while self.samples.len() > 1 {
                let head = self.samples.front().map(Sample::timestamp).unwrap_or(0);
                let tail = self.samples.back().map(Sample::timestamp).unwrap_or(0);
                if (head - tail) as f64 > window_us {
                    self.samples.pop_back();
                } else {
                    break;
                }
            }
        }
    }

    /// Look up a buffered sample. Exactly one of the two delays must be
    /// given.
    ///
    /// * `delay_samples`: 0 is the most recent sample, larger values are
    ///   historic samples.
    /// * `delay_seconds`: 0.0 is the most recent sample; the result is the
    ///   newest sample at least that much older than the queue head.
    pub(crate) fn get(
        &self,
        delay_samples: Option<usize>,
        delay_seconds: Option<f64>,
    ) -> Result<Sample> {
        match (delay_samples, delay_seconds) {
            (Some(_), Some(_)) | (None, None) => Err(FlowgraphError::InvalidArgument(
                "exactly one of delay_samples and delay_seconds must be given".into(),
            )),
            (Some(delay), None) => self
                .samples
                .get(delay)
                .cloned()
                .ok_or(FlowgraphError::OutOfRange {
                    what: "delay_samples",
                }),
            (None, Some(delay)) => {
                if delay < 0.0 {
                    return Err(FlowgraphError::InvalidArgument(
                        "delay_seconds must be non-negative".into(),
                    ));
                }
                let delay_us = delay / TIMESTAMP_RES;
                let head_ts = match self.samples.front() {
                    Some(head) => head.timestamp(),
                    None => {
                        return Err(FlowgraphError::OutOfRange {
                            what: "delay_seconds",
                        })
                    }
                };
                self.samples
                    .iter()
                    .find(|s| (head_ts - s.timestamp()) as f64 >= delay_us)
                    .cloned()
                    .ok_or(FlowgraphError::OutOfRange {
                        what: "delay_seconds",
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64) -> Sample {
        Sample::new(ts.to_le_bytes().to_vec(), "test/ts", ts)
    }

    #[test]
    fn test_count_bound() {
        let (mut q, forced) = InputQueue::new(3, 0.0);
        assert!(!forced);
        for ts in 0..10 {
            q.push(sample(ts));
            assert!(q.len() <= 3);
        }
        // Newest first.
        assert_eq!(q.get(Some(0), None).unwrap().timestamp(), 9);
        assert_eq!(q.get(Some(2), None).unwrap().timestamp(), 7);
    }

    #[test]
    fn test_time_bound() {
        // 1 ms window, unbounded count.
        let (mut q, _) = InputQueue::new(0, 0.001);
        q.push(sample(0));
        q.push(sample(500));
        q.push(sample(1000));
        assert_eq!(q.len(), 3);
        // 0 and 500 now span more than the window from the new head.
        q.push(sample(2000));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get(Some(1), None).unwrap().timestamp(), 1000);
    }

    #[test]
    fn test_both_bounds_forced_to_one() {
        let (mut q, forced) = InputQueue::new(0, 0.0);
        assert!(forced);
        assert_eq!(q.max_samples(), 1);
        q.push(sample(1));
        q.push(sample(2));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(Some(0), None).unwrap().timestamp(), 2);
    }

    #[test]
    fn test_get_argument_validation() {
        let (mut q, _) = InputQueue::new(4, 0.0);
        q.push(sample(1));
        assert!(matches!(
            q.get(None, None),
            Err(FlowgraphError::InvalidArgument(_))
        ));
        assert!(matches!(
            q.get(Some(0), Some(0.0)),
            Err(FlowgraphError::InvalidArgument(_))
        ));
        assert!(matches!(
            q.get(None, Some(-1.0)),
            Err(FlowgraphError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_get_out_of_range() {
        let (mut q, _) = InputQueue::new(8, 0.0);
        for ts in [1000, 2000, 3000] {
            q.push(sample(ts));
        }
        assert!(matches!(
            q.get(Some(3), None),
            Err(FlowgraphError::OutOfRange { .. })
        ));
        // Head is 3000, tail 1000: a 3 ms delay lies outside the window.
        assert!(matches!(
            q.get(None, Some(0.003)),
            Err(FlowgraphError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_get_by_seconds() {
        let (mut q, _) = InputQueue::new(8, 0.0);
        for ts in [1000, 2000, 3000] {
            q.push(sample(ts));
        }
        // Zero delay returns the head.
        assert_eq!(q.get(None, Some(0.0)).unwrap().timestamp(), 3000);
        // The newest sample at least 1 ms older than the head.
        assert_eq!(q.get(None, Some(0.001)).unwrap().timestamp(), 2000);
        assert_eq!(q.get(None, Some(0.0015)).unwrap().timestamp(), 1000);
    }
}
