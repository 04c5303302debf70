//! Lifecycle orchestration: the manager, its execution seam, and events.
//!
//! - **Client**: the [`ExecutionClient`] trait the manager places and
//!   cancels orders through
//! - **Events**: the [`LifecycleEvent`] audit stream and the observer
//!   filter that hides the auxiliary candle stream
//! - **Manager**: the [`PositionLifecycleManager`] driving groups from
//!   registration to closure
//!
//! The manager processes one input at a time. Requests, candles, and fill
//! notifications each acquire the same internal lock for their entire
//! handling, including execution client round-trips, so observers never see
//! a group mid-mutation.

mod client;
mod events;
mod manager;

pub use client::{ClientResult, ExecutionClient, TransportError};

pub use events::{filter_for_observers, EventSink, ExitReason, LifecycleEvent};

pub use manager::{
    LifecycleConfig, LifecycleError, LifecycleResult, PositionLifecycleManager, TradeFill,
};
