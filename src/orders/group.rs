//! Order group: one entry order plus its protective pairs, tracked through
//! an explicit state machine.
//!
//! State transitions:
//! ```text
//! Pending ──► EntryFilled ──► ProtectionActive ──► Closed
//!    │             │                                  ▲
//!    └─────────────┴──────────────────────────────────┘
//! ```
//! Every other transition is illegal and fails loudly without mutating the
//! group. Pairs are tracked by deletion: a resolved pair is removed from the
//! map, and an emptied map is what drives the group to `Closed`. Terminal
//! groups stay queryable; they are never physically deleted from the
//! registry within a run.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::request::{CloseOrderKind, EntryOrder, ProtectivePair};
use super::types::{GroupId, OrderHandle, PairId};

/// Errors raised by group state changes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GroupError {
    /// The requested transition is not in the legal-transition table.
    /// This is a programming-error class failure; the group is unchanged.
    #[error("illegal group transition from {from} to {to} for group {group_id}")]
    IllegalTransition {
        from: GroupState,
        to: GroupState,
        group_id: GroupId,
    },

    /// A fill notification reported more volume than the entry has left
    #[error("entry fill of {fill} exceeds remaining {leaves} for group {group_id}")]
    EntryOverFill {
        group_id: GroupId,
        fill: Decimal,
        leaves: Decimal,
    },
}

/// Lifecycle state of an order group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    /// Entry order registered, not yet filled
    Pending,
    /// Entry fully filled, protective orders not yet placed
    EntryFilled,
    /// All protective orders placed and working
    ProtectionActive,
    /// All pairs resolved, or cancelled/liquidated (terminal)
    Closed,
}

impl GroupState {
    /// Returns true if the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, GroupState::Closed)
    }

    /// Check if a transition from this state to `target` is legal
    pub fn can_transition_to(&self, target: GroupState) -> bool {
        match self {
            GroupState::Pending => {
                matches!(target, GroupState::EntryFilled | GroupState::Closed)
            }
            GroupState::EntryFilled => {
                matches!(target, GroupState::ProtectionActive | GroupState::Closed)
            }
            GroupState::ProtectionActive => matches!(target, GroupState::Closed),
            // Terminal state cannot transition
            GroupState::Closed => false,
        }
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Pending => write!(f, "PENDING"),
            GroupState::EntryFilled => write!(f, "ENTRY_FILLED"),
            GroupState::ProtectionActive => write!(f, "PROTECTION_ACTIVE"),
            GroupState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Which leg of a protective pair an order handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairRole {
    /// The stop-loss leg
    Stop,
    /// The take-profit leg
    Target,
}

impl PairRole {
    /// Returns the other leg
    pub fn opposing(&self) -> Self {
        match self {
            PairRole::Stop => PairRole::Target,
            PairRole::Target => PairRole::Stop,
        }
    }
}

impl fmt::Display for PairRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairRole::Stop => write!(f, "STOP"),
            PairRole::Target => write!(f, "TARGET"),
        }
    }
}

/// A tracked protective pair: its levels, remaining volume, and the handles
/// of its working stop/target orders once protection has been placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOrders {
    /// Stop-loss trigger price
    pub stop_price: Decimal,
    /// Take-profit price
    pub target_price: Decimal,
    /// Volume still protected by this pair
    pub volume: Decimal,
    /// Close-order kind for engine-detected crossings
    pub close_kind: CloseOrderKind,
    /// Handle of the working stop order
    pub stop_handle: Option<OrderHandle>,
    /// Handle of the working target order
    pub target_handle: Option<OrderHandle>,
}

impl PairOrders {
    fn from_resolved(pair: &ProtectivePair, default_volume: Decimal) -> Self {
        Self {
            stop_price: pair.stop_price,
            target_price: pair.target_price,
            volume: pair.volume.unwrap_or(default_volume),
            close_kind: pair.close_kind,
            stop_handle: None,
            target_handle: None,
        }
    }

    /// Returns true once both protective orders have been placed
    pub fn is_armed(&self) -> bool {
        self.stop_handle.is_some() && self.target_handle.is_some()
    }

    /// The handle working the given leg, if placed
    pub fn handle_for(&self, role: PairRole) -> Option<&OrderHandle> {
        match role {
            PairRole::Stop => self.stop_handle.as_ref(),
            PairRole::Target => self.target_handle.as_ref(),
        }
    }

    /// The handle working the opposite leg, if placed
    pub fn opposing_handle(&self, role: PairRole) -> Option<&OrderHandle> {
        self.handle_for(role.opposing())
    }

    /// Replace the handle working the given leg (used when a partially
    /// filled leg is continued by a chase order)
    pub fn set_handle(&mut self, role: PairRole, handle: OrderHandle) {
        match role {
            PairRole::Stop => self.stop_handle = Some(handle),
            PairRole::Target => self.target_handle = Some(handle),
        }
    }

    /// The level price of the given leg
    pub fn level_for(&self, role: PairRole) -> Decimal {
        match role {
            PairRole::Stop => self.stop_price,
            PairRole::Target => self.target_price,
        }
    }
}

/// One entry order plus its protective pairs.
///
/// Groups are owned exclusively by their registry; the lifecycle manager
/// reaches them only through registry methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderGroup {
    /// Unique group identifier
    pub id: GroupId,
    /// The entry order as requested
    pub entry: EntryOrder,
    /// Engine-assigned handle of the entry order
    pub entry_handle: OrderHandle,
    state: GroupState,
    pairs: BTreeMap<PairId, PairOrders>,
    /// Entry volume filled so far
    pub entry_filled_volume: Decimal,
    /// Volume-weighted average entry fill price
    pub entry_fill_price: Option<Decimal>,
    /// Volume closed out of the position so far
    pub closed_volume: Decimal,
    /// Set when automatic recovery gave up and an operator must reconcile
    pub needs_intervention: bool,
    /// When the group was registered
    pub created_at: DateTime<Utc>,
    /// When the group was last mutated
    pub ts_last: DateTime<Utc>,
}

impl OrderGroup {
    /// Create a new group in `Pending` from a validated request.
    ///
    /// `pairs` must already be resolved (explicit volumes); pair IDs are
    /// assigned in request order.
    pub fn new(
        id: GroupId,
        entry: EntryOrder,
        entry_handle: OrderHandle,
        pairs: &[ProtectivePair],
    ) -> Self {
        let default_volume = entry.volume;
        let pairs = pairs
            .iter()
            .enumerate()
            .map(|(i, p)| {
                (
                    PairId::new(i as u32),
                    PairOrders::from_resolved(p, default_volume),
                )
            })
            .collect();
        let now = Utc::now();
        Self {
            id,
            entry,
            entry_handle,
            state: GroupState::Pending,
            pairs,
            entry_filled_volume: Decimal::ZERO,
            entry_fill_price: None,
            closed_volume: Decimal::ZERO,
            needs_intervention: false,
            created_at: now,
            ts_last: now,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> GroupState {
        self.state
    }

    /// Returns true if the group has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a state change.
    ///
    /// Returns an error without mutating if the transition is not legal.
    pub fn transition_to(&mut self, new_state: GroupState) -> Result<(), GroupError> {
        if !self.state.can_transition_to(new_state) {
            return Err(GroupError::IllegalTransition {
                from: self.state,
                to: new_state,
                group_id: self.id.clone(),
            });
        }
        self.state = new_state;
        self.ts_last = Utc::now();
        Ok(())
    }

    /// Remaining pairs in evaluation (request) order
    pub fn pairs(&self) -> impl Iterator<Item = (&PairId, &PairOrders)> {
        self.pairs.iter()
    }

    /// IDs of the remaining pairs in evaluation order
    pub fn pair_ids(&self) -> Vec<PairId> {
        self.pairs.keys().copied().collect()
    }

    /// Number of remaining pairs
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Returns true once every pair has been resolved and deleted
    pub fn pairs_exhausted(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Look up a remaining pair
    pub fn pair(&self, pair_id: &PairId) -> Option<&PairOrders> {
        self.pairs.get(pair_id)
    }

    /// Mutable lookup of a remaining pair
    pub fn pair_mut(&mut self, pair_id: &PairId) -> Option<&mut PairOrders> {
        self.ts_last = Utc::now();
        self.pairs.get_mut(pair_id)
    }

    /// Delete a resolved pair from the map
    pub fn remove_pair(&mut self, pair_id: &PairId) -> Option<PairOrders> {
        self.ts_last = Utc::now();
        self.pairs.remove(pair_id)
    }

    /// Record the working entry handle after a chase order replaces the
    /// original entry order
    pub fn set_entry_handle(&mut self, handle: OrderHandle) {
        self.entry_handle = handle;
        self.ts_last = Utc::now();
    }

    /// Find which pair and leg a protective order handle belongs to
    pub fn find_pair_by_handle(&self, handle: &OrderHandle) -> Option<(PairId, PairRole)> {
        for (pair_id, pair) in &self.pairs {
            if pair.stop_handle.as_ref() == Some(handle) {
                return Some((*pair_id, PairRole::Stop));
            }
            if pair.target_handle.as_ref() == Some(handle) {
                return Some((*pair_id, PairRole::Target));
            }
        }
        None
    }

    /// Sum of the remaining pair volumes.
    ///
    /// For an active group this always equals the entry volume minus the
    /// volume already closed.
    pub fn remaining_protected_volume(&self) -> Decimal {
        self.pairs.values().map(|p| p.volume).sum()
    }

    /// Entry volume not yet filled
    pub fn entry_leaves(&self) -> Decimal {
        self.entry.volume - self.entry_filled_volume
    }

    /// Returns true once the entry volume is fully filled
    pub fn is_entry_filled(&self) -> bool {
        self.entry_leaves().is_zero()
    }

    /// Record an entry fill, updating the volume-weighted average price
    pub fn apply_entry_fill(
        &mut self,
        fill_qty: Decimal,
        fill_price: Decimal,
    ) -> Result<(), GroupError> {
        let leaves = self.entry_leaves();
        if fill_qty > leaves {
            return Err(GroupError::EntryOverFill {
                group_id: self.id.clone(),
                fill: fill_qty,
                leaves,
            });
        }
        let total_filled = self.entry_filled_volume + fill_qty;
        self.entry_fill_price = Some(match self.entry_fill_price {
            Some(avg) => (avg * self.entry_filled_volume + fill_price * fill_qty) / total_filled,
            None => fill_price,
        });
        self.entry_filled_volume = total_filled;
        self.ts_last = Utc::now();
        Ok(())
    }

    /// Record closed volume (a pair leg fill or an engine-issued close)
    pub fn record_closed_volume(&mut self, volume: Decimal) {
        self.closed_volume += volume;
        self.ts_last = Utc::now();
    }

    /// Flag the group for operator attention
    pub fn flag_intervention(&mut self) {
        self.needs_intervention = true;
        self.ts_last = Utc::now();
    }
}
