//! Order request value types and registration-time validation.
//!
//! An `OrderRequest` is the immutable description of a position a strategy
//! wants opened: one entry order plus one or more protective stop/target
//! pairs. Requests are validated once, when the registry accepts them; after
//! that the engine only ever reads them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::types::{OrderSide, OrderSpec, SecurityId};

/// Validation failures for an order request.
///
/// These are caller faults: the request is rejected before any state is
/// created, so the registry is untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("order request has no protective pairs")]
    NoProtectivePairs,

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: Decimal },

    #[error("pair volumes must be explicit when more than one pair is supplied")]
    MissingPairVolume,

    #[error("pair volumes sum to {sum}, expected entry volume {expected}")]
    VolumeMismatch { sum: Decimal, expected: Decimal },

    #[error("stop price {stop} is on the wrong side of entry {entry} for a {side} entry")]
    StopOnWrongSide {
        stop: Decimal,
        entry: Decimal,
        side: OrderSide,
    },

    #[error("target price {target} is on the wrong side of entry {entry} for a {side} entry")]
    TargetOnWrongSide {
        target: Decimal,
        entry: Decimal,
        side: OrderSide,
    },
}

/// Kind of closing order the engine issues when it detects a level crossing
/// itself (as opposed to the venue filling a resting protective order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseOrderKind {
    /// Close at market, guaranteed exit
    #[default]
    Market,
    /// Close with a limit order at the crossed level
    Limit,
}

impl fmt::Display for CloseOrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseOrderKind::Market => write!(f, "MARKET"),
            CloseOrderKind::Limit => write!(f, "LIMIT"),
        }
    }
}

/// A protective stop-loss / take-profit pair.
///
/// Volume is optional only for single-pair requests, where it defaults to
/// the full entry volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectivePair {
    /// Stop-loss trigger price
    pub stop_price: Decimal,
    /// Take-profit price
    pub target_price: Decimal,
    /// Volume protected by this pair (defaults to entry volume when the
    /// request has exactly one pair)
    pub volume: Option<Decimal>,
    /// How the engine closes this pair when it detects a crossing
    pub close_kind: CloseOrderKind,
}

impl ProtectivePair {
    /// Create a pair protecting the full entry volume
    pub fn new(stop_price: Decimal, target_price: Decimal) -> Self {
        Self {
            stop_price,
            target_price,
            volume: None,
            close_kind: CloseOrderKind::default(),
        }
    }

    /// Set an explicit volume for this pair
    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Set the close-order kind for engine-detected crossings
    pub fn with_close_kind(mut self, close_kind: CloseOrderKind) -> Self {
        self.close_kind = close_kind;
        self
    }
}

/// The entry order of a request: what to buy or sell, at which limit price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryOrder {
    /// The instrument to trade
    pub security: SecurityId,
    /// Buy for a long position, sell for a short
    pub side: OrderSide,
    /// Entry limit price
    pub price: Decimal,
    /// Entry volume
    pub volume: Decimal,
}

impl EntryOrder {
    /// Create a new entry order
    pub fn new(security: SecurityId, side: OrderSide, price: Decimal, volume: Decimal) -> Self {
        Self {
            security,
            side,
            price,
            volume,
        }
    }

    /// Build the order spec submitted to the execution environment
    pub fn to_spec(&self) -> OrderSpec {
        OrderSpec::limit(self.security.clone(), self.side, self.volume, self.price)
    }
}

impl fmt::Display for EntryOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @ {}",
            self.side, self.volume, self.security, self.price
        )
    }
}

/// An immutable request to open one protected position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// The entry order
    pub entry: EntryOrder,
    /// Protective pairs, evaluated in this order
    pub pairs: Vec<ProtectivePair>,
}

impl OrderRequest {
    /// Create a new request
    pub fn new(entry: EntryOrder, pairs: Vec<ProtectivePair>) -> Self {
        Self { entry, pairs }
    }

    /// Validate the request invariants.
    ///
    /// Checks, in order: non-empty pairs, positive prices and volumes,
    /// explicit pair volumes summing to the entry volume when more than one
    /// pair is supplied, and stop/target sitting on the economically correct
    /// side of the entry price for the request side.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.pairs.is_empty() {
            return Err(RequestError::NoProtectivePairs);
        }
        Self::require_positive("entry price", self.entry.price)?;
        Self::require_positive("entry volume", self.entry.volume)?;

        for pair in &self.pairs {
            Self::require_positive("stop price", pair.stop_price)?;
            Self::require_positive("target price", pair.target_price)?;
            if let Some(volume) = pair.volume {
                Self::require_positive("pair volume", volume)?;
            } else if self.pairs.len() > 1 {
                return Err(RequestError::MissingPairVolume);
            }
            self.check_sides(pair)?;
        }

        let sum: Decimal = self
            .pairs
            .iter()
            .map(|p| p.volume.unwrap_or(self.entry.volume))
            .sum();
        if sum != self.entry.volume {
            return Err(RequestError::VolumeMismatch {
                sum,
                expected: self.entry.volume,
            });
        }

        Ok(())
    }

    /// Pairs with the single-pair default volume resolved.
    ///
    /// Only meaningful after `validate` has passed.
    pub fn resolved_pairs(&self) -> Vec<ProtectivePair> {
        self.pairs
            .iter()
            .map(|p| ProtectivePair {
                volume: Some(p.volume.unwrap_or(self.entry.volume)),
                ..p.clone()
            })
            .collect()
    }

    fn require_positive(field: &'static str, value: Decimal) -> Result<(), RequestError> {
        if value <= Decimal::ZERO {
            return Err(RequestError::NonPositive { field, value });
        }
        Ok(())
    }

    fn check_sides(&self, pair: &ProtectivePair) -> Result<(), RequestError> {
        let entry = self.entry.price;
        let side = self.entry.side;
        // Long positions stop below entry and target above; shorts mirror.
        let (stop_ok, target_ok) = match side {
            OrderSide::Buy => (pair.stop_price < entry, pair.target_price > entry),
            OrderSide::Sell => (pair.stop_price > entry, pair.target_price < entry),
        };
        if !stop_ok {
            return Err(RequestError::StopOnWrongSide {
                stop: pair.stop_price,
                entry,
                side,
            });
        }
        if !target_ok {
            return Err(RequestError::TargetOnWrongSide {
                target: pair.target_price,
                entry,
                side,
            });
        }
        Ok(())
    }
}
