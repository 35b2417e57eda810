//! Shared-ownership data samples.
//!
//! A `Sample` is the unit of data carried through the graph: a serialized
//! payload, a datatype string that uniquely identifies the serialization,
//! and a microsecond timestamp. Samples are immutable after construction
//! and cheap to clone — cloning shares the payload, `Sample::copy` makes
//! a deep copy.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Resolution of sample timestamps in seconds (timestamps are in µs).
pub const TIMESTAMP_RES: f64 = 1e-6;

struct SampleData {
    payload: Box<[u8]>,
    datatype: String,
    timestamp: i64,
}

/// Immutable record of `(payload bytes, datatype, timestamp µs)`.
///
/// Any number of ports and filters may observe the same sample; the last
/// observer releases the memory.
#[derive(Clone)]
pub struct Sample {
    data: Arc<SampleData>,
}

impl Sample {
    /// Create a new sample from a payload, a datatype tag and a timestamp
    /// in microseconds.
    pub fn new(payload: impl Into<Box<[u8]>>, datatype: impl Into<String>, timestamp: i64) -> Self {
        Self {
            data: Arc::new(SampleData {
                payload: payload.into(),
                datatype: datatype.into(),
                timestamp,
            }),
        }
    }

    /// Create a new sample stamped with [`Sample::current_time`].
    pub fn with_current_time(payload: impl Into<Box<[u8]>>, datatype: impl Into<String>) -> Self {
        Self::new(payload, datatype, Self::current_time())
    }

    /// Deep copy: the payload bytes are duplicated, all fields are equal.
    pub fn copy(src: &Sample) -> Sample {
        Sample::new(
            src.payload().to_vec(),
            src.datatype().to_string(),
            src.timestamp(),
        )
    }

    /// The serialized payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data.payload
    }

    /// The datatype string identifying the payload serialization.
    #[inline]
    pub fn datatype(&self) -> &str {
        &self.data.datatype
    }

    /// Timestamp in microseconds since the process reference epoch.
    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.data.timestamp
    }

    /// Current wall-clock time in microseconds, suitable for timestamps.
    pub fn current_time() -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_micros() as i64,
            // Clock before the epoch: report a negative offset.
            Err(e) => -(e.duration().as_micros() as i64),
        }
    }
}

impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.payload() == other.payload()
            && self.datatype() == other.datatype()
            && self.timestamp() == other.timestamp()
    }
}

impl Eq for Sample {}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("payload_len", &self.payload().len())
            .field("datatype", &self.datatype())
            .field("timestamp", &self.timestamp())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_accessors() {
        let s = Sample::new(vec![1u8, 2, 3], "test/raw", 4711);
        assert_eq!(s.payload(), &[1, 2, 3]);
        assert_eq!(s.datatype(), "test/raw");
        assert_eq!(s.timestamp(), 4711);
    }

    #[test]
    fn test_clone_shares_copy_duplicates() {
        let a = Sample::new(vec![9u8; 16], "test/raw", 1);
        let b = a.clone();
        // A clone shares the underlying payload allocation.
        assert!(std::ptr::eq(a.payload(), b.payload()));

        let c = Sample::copy(&a);
        assert!(!std::ptr::eq(a.payload(), c.payload()));
        assert_eq!(a, c);
    }

    #[test]
    fn test_equality_over_all_fields() {
        let a = Sample::new(vec![1u8], "t", 10);
        assert_eq!(a, Sample::new(vec![1u8], "t", 10));
        assert_ne!(a, Sample::new(vec![2u8], "t", 10));
        assert_ne!(a, Sample::new(vec![1u8], "u", 10));
        assert_ne!(a, Sample::new(vec![1u8], "t", 11));
    }

    #[test]
    fn test_current_time_advances() {
        let t0 = Sample::current_time();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t1 = Sample::current_time();
        assert!(t1 > t0);
    }
}
