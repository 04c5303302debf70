//! Lifecycle events and the observer visibility boundary.
//!
//! Every externally visible record the engine produces is a
//! [`LifecycleEvent`]. Events carry the stream origin that caused them; the
//! single boundary function [`filter_for_observers`] is the only path to a
//! sink, and it is where the auxiliary stream is hidden: raw auxiliary
//! evaluation events are dropped, and auxiliary-caused records are
//! re-stamped onto the main timeframe and normalized so observers cannot
//! tell the auxiliary stream exists. Internal ordering always uses the true
//! event time; only the dispatched copies are rewritten.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data::{StreamOrigin, TimestampRemapper};
use crate::orders::{GroupId, OrderSide, PairId, PairRole, SecurityId};

/// Why a pair (or the remainder of a position) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    /// The stop-loss level was hit
    Stop,
    /// The take-profit level was hit
    Target,
    /// Closed by an emergency liquidation
    Liquidation,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Stop => write!(f, "STOP"),
            ExitReason::Target => write!(f, "TARGET"),
            ExitReason::Liquidation => write!(f, "LIQUIDATION"),
        }
    }
}

impl From<PairRole> for ExitReason {
    fn from(role: PairRole) -> Self {
        match role {
            PairRole::Stop => ExitReason::Stop,
            PairRole::Target => ExitReason::Target,
        }
    }
}

/// Any lifecycle event, tagged for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    /// A request was accepted and its group registered
    GroupRegistered {
        group_id: GroupId,
        security: SecurityId,
        side: OrderSide,
        entry_price: Decimal,
        volume: Decimal,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
    /// A structurally identical request was suppressed while the matching
    /// group was still pending
    DuplicateSuppressed {
        group_id: GroupId,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
    /// A pending entry was cancelled before filling
    PendingCancelled {
        group_id: GroupId,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
    /// The entry order filled completely
    EntryFilled {
        group_id: GroupId,
        fill_price: Decimal,
        volume: Decimal,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
    /// All protective orders for the group are working
    ProtectionPlaced {
        group_id: GroupId,
        pair_count: usize,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
    /// A candle was evaluated against all active groups
    LevelsEvaluated {
        security: SecurityId,
        groups_touched: bool,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
    /// A protective pair resolved and was deleted
    PairClosed {
        group_id: GroupId,
        pair_id: PairId,
        exit: ExitReason,
        volume: Decimal,
        price: Decimal,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
    /// A market chase order was issued for an unfilled remainder
    CloseRetryIssued {
        group_id: GroupId,
        pair_id: Option<PairId>,
        attempt: u32,
        remaining: Decimal,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
    /// The group reached its terminal state
    GroupClosed {
        group_id: GroupId,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
    /// Automatic recovery gave up; an operator must reconcile
    ManualInterventionRequired {
        group_id: GroupId,
        pair_id: Option<PairId>,
        reason: String,
        ts: DateTime<Utc>,
        origin: StreamOrigin,
    },
}

impl LifecycleEvent {
    /// The event timestamp
    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            LifecycleEvent::GroupRegistered { ts, .. }
            | LifecycleEvent::DuplicateSuppressed { ts, .. }
            | LifecycleEvent::PendingCancelled { ts, .. }
            | LifecycleEvent::EntryFilled { ts, .. }
            | LifecycleEvent::ProtectionPlaced { ts, .. }
            | LifecycleEvent::LevelsEvaluated { ts, .. }
            | LifecycleEvent::PairClosed { ts, .. }
            | LifecycleEvent::CloseRetryIssued { ts, .. }
            | LifecycleEvent::GroupClosed { ts, .. }
            | LifecycleEvent::ManualInterventionRequired { ts, .. } => *ts,
        }
    }

    /// The stream origin that caused the event
    pub fn origin(&self) -> StreamOrigin {
        match self {
            LifecycleEvent::GroupRegistered { origin, .. }
            | LifecycleEvent::DuplicateSuppressed { origin, .. }
            | LifecycleEvent::PendingCancelled { origin, .. }
            | LifecycleEvent::EntryFilled { origin, .. }
            | LifecycleEvent::ProtectionPlaced { origin, .. }
            | LifecycleEvent::LevelsEvaluated { origin, .. }
            | LifecycleEvent::PairClosed { origin, .. }
            | LifecycleEvent::CloseRetryIssued { origin, .. }
            | LifecycleEvent::GroupClosed { origin, .. }
            | LifecycleEvent::ManualInterventionRequired { origin, .. } => *origin,
        }
    }

    /// The group the event concerns, if any
    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            LifecycleEvent::GroupRegistered { group_id, .. }
            | LifecycleEvent::DuplicateSuppressed { group_id, .. }
            | LifecycleEvent::PendingCancelled { group_id, .. }
            | LifecycleEvent::EntryFilled { group_id, .. }
            | LifecycleEvent::ProtectionPlaced { group_id, .. }
            | LifecycleEvent::PairClosed { group_id, .. }
            | LifecycleEvent::CloseRetryIssued { group_id, .. }
            | LifecycleEvent::GroupClosed { group_id, .. }
            | LifecycleEvent::ManualInterventionRequired { group_id, .. } => Some(group_id),
            LifecycleEvent::LevelsEvaluated { .. } => None,
        }
    }

    fn set_ts(&mut self, new_ts: DateTime<Utc>) {
        match self {
            LifecycleEvent::GroupRegistered { ts, .. }
            | LifecycleEvent::DuplicateSuppressed { ts, .. }
            | LifecycleEvent::PendingCancelled { ts, .. }
            | LifecycleEvent::EntryFilled { ts, .. }
            | LifecycleEvent::ProtectionPlaced { ts, .. }
            | LifecycleEvent::LevelsEvaluated { ts, .. }
            | LifecycleEvent::PairClosed { ts, .. }
            | LifecycleEvent::CloseRetryIssued { ts, .. }
            | LifecycleEvent::GroupClosed { ts, .. }
            | LifecycleEvent::ManualInterventionRequired { ts, .. } => *ts = new_ts,
        }
    }

    fn set_origin(&mut self, new_origin: StreamOrigin) {
        match self {
            LifecycleEvent::GroupRegistered { origin, .. }
            | LifecycleEvent::DuplicateSuppressed { origin, .. }
            | LifecycleEvent::PendingCancelled { origin, .. }
            | LifecycleEvent::EntryFilled { origin, .. }
            | LifecycleEvent::ProtectionPlaced { origin, .. }
            | LifecycleEvent::LevelsEvaluated { origin, .. }
            | LifecycleEvent::PairClosed { origin, .. }
            | LifecycleEvent::CloseRetryIssued { origin, .. }
            | LifecycleEvent::GroupClosed { origin, .. }
            | LifecycleEvent::ManualInterventionRequired { origin, .. } => *origin = new_origin,
        }
    }
}

/// Callback type for event observers (loggers, charts, reports)
pub type EventSink = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// The single visibility boundary between the engine and its observers.
///
/// Main-stream events pass through untouched. Auxiliary-stream evaluation
/// events are dropped entirely. Every other auxiliary-caused event is
/// delivered, but re-stamped onto the enclosing main-timeframe boundary and
/// re-tagged as main so external views stay consistent with the main
/// timeframe.
pub fn filter_for_observers(
    event: LifecycleEvent,
    remapper: &TimestampRemapper,
) -> Option<LifecycleEvent> {
    match event.origin() {
        StreamOrigin::Main => Some(event),
        StreamOrigin::Auxiliary => match event {
            LifecycleEvent::LevelsEvaluated { .. } => None,
            mut other => {
                let remapped = remapper.remap(other.ts());
                other.set_ts(remapped);
                other.set_origin(StreamOrigin::Main);
                Some(other)
            }
        },
    }
}
