//! Order-group tracking for protected positions.
//!
//! This module provides the order-side core of the lifecycle engine:
//!
//! - **Value Types**: `OrderRequest`, `EntryOrder`, `ProtectivePair` - immutable
//!   descriptions of what a strategy wants opened
//! - **Order Groups**: one entry plus its stop/target pairs, tracked through a
//!   strict state machine
//! - **Registry**: sole owner of all groups for one strategy instance, with a
//!   concurrency ceiling, duplicate matching, and handle-based reverse lookup
//!
//! # Architecture
//!
//! The order system is designed with these principles:
//!
//! 1. **Validation Up Front**: Requests are checked once, at registration;
//!    afterwards the engine only reads them
//! 2. **Deletion-Based Tracking**: Resolved pairs are physically removed from
//!    their group; the empty map is what closes the group. No activity flags
//! 3. **Terminal Groups Stay**: Closed groups remain queryable for the rest
//!    of the run
//! 4. **Engine-Generated Handles**: Every order carries a handle generated
//!    here and echoed back by the execution environment, so notifications
//!    always route without a venue-side ID exchange
//!
//! # Example: Registering a Request
//!
//! ```ignore
//! use order_lifecycle::orders::{
//!     EntryOrder, OrderRegistry, OrderRequest, OrderSide, ProtectivePair,
//!     RegistryConfig, SecurityId,
//! };
//! use rust_decimal_macros::dec;
//!
//! let mut registry = OrderRegistry::new(RegistryConfig::default());
//!
//! let request = OrderRequest::new(
//!     EntryOrder::new(
//!         SecurityId::new("BTCUSDT", "BINANCE"),
//!         OrderSide::Buy,
//!         dec!(100),
//!         dec!(1),
//!     ),
//!     vec![
//!         ProtectivePair::new(dec!(95), dec!(105)).with_volume(dec!(0.5)),
//!         ProtectivePair::new(dec!(95), dec!(110)).with_volume(dec!(0.5)),
//!     ],
//! );
//!
//! let (group_id, entry_spec) = registry.register(&request)?;
//! // submit entry_spec to the execution environment ...
//! ```
//!
//! # Group State Machine
//!
//! Groups follow a strict state machine:
//!
//! ```text
//! ┌──────────────┐
//! │   Pending    │──────────────────────────┐
//! └──────┬───────┘                          │ (entry cancelled
//!        │ entry fully filled               │  before fill)
//!        ▼                                  │
//! ┌──────────────┐                          │
//! │ EntryFilled  │──────────────────────────┤ (all pairs resolved
//! └──────┬───────┘                          │  before placement)
//!        │ protective orders placed         │
//!        ▼                                  ▼
//! ┌──────────────────┐              ┌──────────────┐
//! │ ProtectionActive │─────────────►│    Closed    │
//! └──────────────────┘  last pair   └──────────────┘
//!                       deleted
//! ```
//!
//! Any transition not drawn above fails with `IllegalTransition` and leaves
//! the group untouched.

mod group;
mod registry;
mod request;
mod types;

// Re-export all public types
pub use group::{GroupError, GroupState, OrderGroup, PairOrders, PairRole};

pub use registry::{
    OrderRegistry, OrderScope, RegistryConfig, RegistryError, RegistryResult, RegistryStats,
};

pub use request::{CloseOrderKind, EntryOrder, OrderRequest, ProtectivePair, RequestError};

pub use types::{
    GroupId, OrderHandle, OrderKind, OrderSide, OrderSpec, PairId, SecurityId, StrategyId,
};
