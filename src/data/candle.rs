//! Candle data and stream-origin tagging.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::orders::SecurityId;

/// Which candle stream delivered an event to the engine.
///
/// The auxiliary stream is a finer-grained timeframe wired in purely to
/// improve stop/target detection fidelity. Its events feed the same
/// evaluation path as the main stream but must never surface to external
/// observers; see `lifecycle::filter_for_observers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamOrigin {
    /// The strategy's primary timeframe
    #[default]
    Main,
    /// The finer-grained detection-only timeframe
    Auxiliary,
}

impl StreamOrigin {
    /// Returns true if this is the auxiliary (detection-only) stream
    pub fn is_auxiliary(&self) -> bool {
        matches!(self, StreamOrigin::Auxiliary)
    }
}

impl fmt::Display for StreamOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOrigin::Main => write!(f, "MAIN"),
            StreamOrigin::Auxiliary => write!(f, "AUXILIARY"),
        }
    }
}

/// A single OHLCV candle as delivered by the data layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// The instrument this candle belongs to
    pub security: SecurityId,
    /// Open time of the candle window
    pub open_time: DateTime<Utc>,
    /// Opening price
    pub open: Decimal,
    /// Highest price in the window
    pub high: Decimal,
    /// Lowest price in the window
    pub low: Decimal,
    /// Closing price
    pub close: Decimal,
    /// Traded volume in the window
    pub volume: Decimal,
}

impl Candle {
    /// Create a new candle
    pub fn new(
        security: SecurityId,
        open_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            security,
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Degenerate candle whose whole range is a single price.
    ///
    /// Used when a fill must be checked against protection levels before any
    /// real candle has been observed for the security.
    pub fn point(security: SecurityId, time: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            security,
            open_time: time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ZERO,
        }
    }

    /// Returns true if the candle range reached down to `price` or lower
    pub fn trades_at_or_below(&self, price: Decimal) -> bool {
        self.low <= price
    }

    /// Returns true if the candle range reached up to `price` or higher
    pub fn trades_at_or_above(&self, price: Decimal) -> bool {
        self.high >= price
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} O:{} H:{} L:{} C:{} V:{}",
            self.security, self.open_time, self.open, self.high, self.low, self.close, self.volume
        )
    }
}
