//! Core types and identifiers for the order-group system.
//!
//! This module defines the fundamental types used throughout the engine:
//! - `OrderSide` - Buy or Sell
//! - `OrderKind` - Market, Limit, Stop
//! - `GroupId` / `OrderHandle` / `PairId` / `StrategyId` - identifiers
//! - `SecurityId` - tradable instrument reference
//! - `OrderSpec` - an order as handed to the execution environment

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side indicating buy or sell direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy order - acquire the base asset
    Buy,
    /// Sell order - dispose of the base asset
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Returns true if this is a buy order
    pub fn is_buy(&self) -> bool {
        matches!(self, OrderSide::Buy)
    }

    /// Returns true if this is a sell order
    pub fn is_sell(&self) -> bool {
        matches!(self, OrderSide::Sell)
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order kind determining execution behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    /// Market order - execute immediately at best available price
    Market,
    /// Limit order - execute at specified price or better
    Limit,
    /// Stop order - becomes a market order when the trigger price trades
    Stop,
}

impl OrderKind {
    /// Returns true if this order kind requires a limit price
    pub fn requires_price(&self) -> bool {
        matches!(self, OrderKind::Limit)
    }

    /// Returns true if this order kind requires a trigger price
    pub fn requires_trigger_price(&self) -> bool {
        matches!(self, OrderKind::Stop)
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::Limit => write!(f, "LIMIT"),
            OrderKind::Stop => write!(f, "STOP"),
        }
    }
}

/// Group ID - unique identifier for an order group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    /// Create a new GroupId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique GroupId using UUID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for GroupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Order handle - engine-assigned identifier for one order sent to the
/// execution environment.
///
/// Handles are generated by this engine at registration/placement time and
/// echoed back by the environment in fill and cancel notifications, so every
/// notification can be routed to its owning group without a venue-side ID
/// exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderHandle(pub String);

impl OrderHandle {
    /// Create a new OrderHandle
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique OrderHandle using UUID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OrderHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Pair ID - position of a protective pair within its group.
///
/// Pairs are evaluated in request order, so the identifier is an ordered
/// index rather than an opaque string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairId(pub u32);

impl PairId {
    /// Create a new PairId
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the inner index value
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pair-{}", self.0)
    }
}

/// Strategy ID - identifier for the strategy instance that owns a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyId(pub String);

impl StrategyId {
    /// Create a new StrategyId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for StrategyId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl From<String> for StrategyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StrategyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Security ID - unique identifier for a tradable instrument.
///
/// Format: `{symbol}.{venue}` (e.g., "BTCUSDT.BINANCE")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityId {
    /// The symbol (e.g., "BTCUSDT")
    pub symbol: String,
    /// The venue/exchange (e.g., "BINANCE")
    pub venue: String,
}

impl SecurityId {
    /// Create a new SecurityId
    pub fn new(symbol: impl Into<String>, venue: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            venue: venue.into(),
        }
    }

    /// Parse from string format "SYMBOL.VENUE"
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() == 2 {
            Some(Self {
                symbol: parts[0].to_string(),
                venue: parts[1].to_string(),
            })
        } else {
            None
        }
    }

    /// Create with default venue (for single-venue setups)
    pub fn from_symbol(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            venue: "DEFAULT".to_string(),
        }
    }
}

impl fmt::Display for SecurityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.symbol, self.venue)
    }
}

/// An order as handed to the execution environment.
///
/// The handle is generated by the engine before submission; the environment
/// echoes it back on every fill/cancel notification for this order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Engine-assigned handle for routing notifications back
    pub handle: OrderHandle,
    /// The instrument to trade
    pub security: SecurityId,
    /// Buy or sell
    pub side: OrderSide,
    /// Execution behavior
    pub kind: OrderKind,
    /// Order volume (always positive)
    pub volume: Decimal,
    /// Limit price (required for `Limit` orders)
    pub price: Option<Decimal>,
    /// Trigger price (required for `Stop` orders)
    pub trigger_price: Option<Decimal>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl OrderSpec {
    /// Create a market order
    pub fn market(security: SecurityId, side: OrderSide, volume: Decimal) -> Self {
        Self {
            handle: OrderHandle::generate(),
            security,
            side,
            kind: OrderKind::Market,
            volume,
            price: None,
            trigger_price: None,
            created_at: Utc::now(),
        }
    }

    /// Create a limit order
    pub fn limit(security: SecurityId, side: OrderSide, volume: Decimal, price: Decimal) -> Self {
        Self {
            handle: OrderHandle::generate(),
            security,
            side,
            kind: OrderKind::Limit,
            volume,
            price: Some(price),
            trigger_price: None,
            created_at: Utc::now(),
        }
    }

    /// Create a stop order
    pub fn stop(
        security: SecurityId,
        side: OrderSide,
        volume: Decimal,
        trigger_price: Decimal,
    ) -> Self {
        Self {
            handle: OrderHandle::generate(),
            security,
            side,
            kind: OrderKind::Stop,
            volume,
            price: None,
            trigger_price: Some(trigger_price),
            created_at: Utc::now(),
        }
    }
}

impl fmt::Display for OrderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} (handle: {})",
            self.side, self.volume, self.security, self.kind, self.handle
        )
    }
}
