//! Interface to the execution environment.
//!
//! The lifecycle manager talks to the outside world (live venue adapter or
//! backtest shim) exclusively through [`ExecutionClient`]. Order handles are
//! generated engine-side and embedded in every [`OrderSpec`], so the
//! environment only has to echo them back on notifications.

use async_trait::async_trait;
use thiserror::Error;

use crate::orders::{OrderHandle, OrderSpec};

/// Transport-level failures from the execution environment.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The environment refused the order
    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    /// The connection to the environment failed
    #[error("connection error: {0}")]
    Connection(String),

    /// No acknowledgement arrived in time
    #[error("timed out waiting for acknowledgement: {0}")]
    Timeout(String),
}

impl TransportError {
    /// Create a rejection error
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Result type for execution client operations
pub type ClientResult<T> = Result<T, TransportError>;

/// The execution environment seam.
///
/// `place_order` resolves once the environment has acknowledged the order.
/// The manager never commits a state transition before that acknowledgement
/// arrives. Fills are delivered separately through
/// `PositionLifecycleManager::on_trade_received`, carrying the handle that
/// was embedded in the spec.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Submit an order and wait for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an error if the order is rejected or the transport fails.
    async fn place_order(&self, spec: &OrderSpec) -> ClientResult<()>;

    /// Cancel a working order.
    ///
    /// Cancellation is best effort: the engine logs failures and moves on
    /// rather than retrying.
    ///
    /// # Errors
    ///
    /// Returns an error if the cancel request could not be delivered.
    async fn cancel_order(&self, handle: &OrderHandle) -> ClientResult<()>;
}
