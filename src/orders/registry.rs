//! Group registry: the sole owner of all order groups for one strategy
//! instance.
//!
//! The registry enforces the concurrency ceiling, performs duplicate
//! matching, and resolves order handles back to the group that issued them.
//! Terminal groups stay in the map for the rest of the run; only protective
//! pairs are physically deleted as they resolve.
//!
//! The registry itself is a plain synchronous component. Serialization of
//! mutations happens one level up, in the lifecycle manager, which holds the
//! registry together with its retry state behind a single lock.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use super::group::{GroupError, GroupState, OrderGroup, PairRole};
use super::request::{OrderRequest, RequestError};
use super::types::{GroupId, OrderHandle, OrderSpec, PairId};

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    /// The request failed validation; nothing was registered
    #[error("invalid order request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// The non-terminal group ceiling was reached; the caller may retry
    /// once a group closes
    #[error("group capacity exceeded: {limit} groups already active")]
    CapacityExceeded { limit: usize },

    /// No group with the given ID exists
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    /// A group-level failure (illegal transition, overfill)
    #[error(transparent)]
    Group(#[from] GroupError),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Configuration for the order registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of concurrently active (non-terminal) groups
    pub max_concurrent_groups: usize,
    /// Absolute price/volume tolerance used by duplicate matching
    pub match_tolerance: Decimal,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_groups: 5,
            match_tolerance: Decimal::new(1, 2), // 0.01, one price increment
        }
    }
}

/// What an engine-issued order handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScope {
    /// The group's entry order, or a chase order continuing it
    Entry,
    /// A protective leg of a pair, or a chase order continuing that leg
    Pair { pair_id: PairId, role: PairRole },
    /// An engine-issued close: a detected level crossing (`Some(pair)`) or
    /// a liquidation (`None`)
    Close { pair_id: Option<PairId> },
}

/// Aggregate counts over the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_groups: usize,
    pub pending: usize,
    pub entry_filled: usize,
    pub protection_active: usize,
    pub closed: usize,
    pub flagged_for_intervention: usize,
}

/// Owner of all order groups for one strategy instance.
#[derive(Debug)]
pub struct OrderRegistry {
    config: RegistryConfig,
    groups: HashMap<GroupId, OrderGroup>,
    /// Group IDs in registration order; drives deterministic matching
    registration_order: Vec<GroupId>,
    /// Reverse lookup from any engine-issued handle to its group
    handle_index: HashMap<OrderHandle, (GroupId, OrderScope)>,
}

impl OrderRegistry {
    /// Create a registry with the given configuration
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            groups: HashMap::new(),
            registration_order: Vec::new(),
            handle_index: HashMap::new(),
        }
    }

    /// The registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Validate and register a request as a new `Pending` group.
    ///
    /// Returns the new group ID and the entry order spec the caller must
    /// submit to the execution environment. The spec's handle is already
    /// indexed, so fill notifications for it can be routed immediately.
    pub fn register(&mut self, request: &OrderRequest) -> RegistryResult<(GroupId, OrderSpec)> {
        request.validate()?;

        let limit = self.config.max_concurrent_groups;
        if self.active_count() >= limit {
            return Err(RegistryError::CapacityExceeded { limit });
        }

        let group_id = GroupId::generate();
        let entry_spec = request.entry.to_spec();
        let group = OrderGroup::new(
            group_id.clone(),
            request.entry.clone(),
            entry_spec.handle.clone(),
            &request.resolved_pairs(),
        );

        self.handle_index.insert(
            entry_spec.handle.clone(),
            (group_id.clone(), OrderScope::Entry),
        );
        self.groups.insert(group_id.clone(), group);
        self.registration_order.push(group_id.clone());

        Ok((group_id, entry_spec))
    }

    /// All non-terminal groups, in registration order
    pub fn active_groups(&self) -> Vec<&OrderGroup> {
        self.registration_order
            .iter()
            .filter_map(|id| self.groups.get(id))
            .filter(|g| !g.is_terminal())
            .collect()
    }

    /// IDs of all non-terminal groups, in registration order
    pub fn active_group_ids(&self) -> Vec<GroupId> {
        self.active_groups().iter().map(|g| g.id.clone()).collect()
    }

    /// Number of non-terminal groups
    pub fn active_count(&self) -> usize {
        self.groups.values().filter(|g| !g.is_terminal()).count()
    }

    /// Total number of groups, terminal included
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Look up a group by ID
    pub fn get(&self, group_id: &GroupId) -> Option<&OrderGroup> {
        self.groups.get(group_id)
    }

    /// Mutable lookup of a group by ID
    pub fn get_mut(&mut self, group_id: &GroupId) -> Option<&mut OrderGroup> {
        self.groups.get_mut(group_id)
    }

    /// Mutable lookup that fails with `GroupNotFound`
    pub fn group_mut(&mut self, group_id: &GroupId) -> RegistryResult<&mut OrderGroup> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| RegistryError::GroupNotFound(group_id.clone()))
    }

    /// Find the first active group structurally matching `request`.
    ///
    /// A match requires the same security and side, entry price and volume
    /// within the configured tolerance, and the entire sorted set of
    /// (stop, target, volume) pair triples matching within tolerance. Used
    /// for duplicate-signal suppression.
    pub fn find_matching(&self, request: &OrderRequest) -> Option<&OrderGroup> {
        let tol = self.config.match_tolerance;
        let mut wanted: Vec<(Decimal, Decimal, Decimal)> = request
            .resolved_pairs()
            .iter()
            .map(|p| {
                (
                    p.stop_price,
                    p.target_price,
                    p.volume.unwrap_or(request.entry.volume),
                )
            })
            .collect();
        wanted.sort();

        for group_id in &self.registration_order {
            let group = match self.groups.get(group_id) {
                Some(g) => g,
                None => continue,
            };
            if group.is_terminal() {
                continue;
            }
            if group.entry.side != request.entry.side
                || group.entry.security != request.entry.security
            {
                continue;
            }
            if !within(group.entry.price, request.entry.price, tol)
                || !within(group.entry.volume, request.entry.volume, tol)
            {
                continue;
            }

            let mut have: Vec<(Decimal, Decimal, Decimal)> = group
                .pairs()
                .map(|(_, p)| (p.stop_price, p.target_price, p.volume))
                .collect();
            have.sort();
            if have.len() != wanted.len() {
                continue;
            }
            let pairs_match = have.iter().zip(&wanted).all(|(a, b)| {
                within(a.0, b.0, tol) && within(a.1, b.1, tol) && within(a.2, b.2, tol)
            });
            if pairs_match {
                return Some(group);
            }
        }
        None
    }

    /// Resolve an order handle to its owning group and scope.
    ///
    /// Covers entry handles, protective-leg handles, and engine-issued
    /// close/chase handles. Index entries live for the rest of the run so
    /// late notifications can still be routed.
    pub fn find_by_order_handle(&self, handle: &OrderHandle) -> Option<(&OrderGroup, OrderScope)> {
        let (group_id, scope) = self.handle_index.get(handle)?;
        self.groups.get(group_id).map(|g| (g, *scope))
    }

    /// Index an engine-issued handle against its group
    pub fn index_order(&mut self, handle: OrderHandle, group_id: GroupId, scope: OrderScope) {
        self.handle_index.insert(handle, (group_id, scope));
    }

    /// Aggregate counts over all groups
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_groups: self.groups.len(),
            pending: 0,
            entry_filled: 0,
            protection_active: 0,
            closed: 0,
            flagged_for_intervention: 0,
        };
        for group in self.groups.values() {
            match group.state() {
                GroupState::Pending => stats.pending += 1,
                GroupState::EntryFilled => stats.entry_filled += 1,
                GroupState::ProtectionActive => stats.protection_active += 1,
                GroupState::Closed => stats.closed += 1,
            }
            if group.needs_intervention {
                stats.flagged_for_intervention += 1;
            }
        }
        stats
    }

    /// Clear all groups and indexes
    pub fn reset(&mut self) {
        self.groups.clear();
        self.registration_order.clear();
        self.handle_index.clear();
    }
}

fn within(a: Decimal, b: Decimal, tolerance: Decimal) -> bool {
    (a - b).abs() <= tolerance
}
