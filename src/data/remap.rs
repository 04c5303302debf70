//! Timestamp remapping between the auxiliary and main timeframes.
//!
//! Events arriving on the auxiliary (finer-grained) candle stream carry their
//! true event time internally, but any externally visible record they cause
//! must be stamped with the enclosing main-timeframe boundary so downstream
//! consumers cannot tell the auxiliary stream exists.

use chrono::{DateTime, Duration, Utc};

/// Maps auxiliary-stream event times onto main-timeframe boundaries.
///
/// The mapping floors the event time to the start of the enclosing main
/// interval: `floor((t - offset) / interval) * interval + offset`. Times
/// already on a boundary map to themselves, so remapping is idempotent.
/// The offset supports main streams whose windows are not epoch-aligned
/// (e.g., daily candles opening at 17:00).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampRemapper {
    main_interval: Duration,
    offset: Duration,
}

impl TimestampRemapper {
    /// Create a remapper for an epoch-aligned main interval
    pub fn new(main_interval: Duration) -> Self {
        Self {
            main_interval,
            offset: Duration::zero(),
        }
    }

    /// Create a remapper whose boundaries are shifted by a fixed offset
    pub fn with_offset(main_interval: Duration, offset: Duration) -> Self {
        Self {
            main_interval,
            offset,
        }
    }

    /// The main interval this remapper floors to
    pub fn main_interval(&self) -> Duration {
        self.main_interval
    }

    /// Remap an event time to the open of its enclosing main interval.
    ///
    /// Non-positive intervals leave the time unchanged. Euclidean division
    /// keeps the floor correct for pre-epoch times.
    pub fn remap(&self, event_time: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = self.main_interval.num_milliseconds();
        if interval_ms <= 0 {
            return event_time;
        }
        let offset_ms = self.offset.num_milliseconds();
        let t = event_time.timestamp_millis();
        let floored = (t - offset_ms).div_euclid(interval_ms) * interval_ms + offset_ms;
        DateTime::from_timestamp_millis(floored).unwrap_or(event_time)
    }

    /// Returns true if `event_time` already sits on a main boundary
    pub fn is_boundary(&self, event_time: DateTime<Utc>) -> bool {
        self.remap(event_time) == event_time
    }
}

impl Default for TimestampRemapper {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}
