//! Position lifecycle orchestration.
//!
//! The `PositionLifecycleManager` drives order groups from registration to
//! closure: it accepts requests, reacts to candles and fill notifications,
//! places and cancels orders through an [`ExecutionClient`], and publishes
//! [`LifecycleEvent`]s to registered sinks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::data::{Candle, StreamOrigin, TimestampRemapper};
use crate::orders::{
    CloseOrderKind, GroupId, GroupState, OrderGroup, OrderHandle, OrderRegistry, OrderRequest,
    OrderScope, OrderSide, OrderSpec, PairId, PairRole, RegistryConfig, RegistryError,
    RegistryStats, SecurityId, StrategyId,
};

use super::client::{ExecutionClient, TransportError};
use super::events::{filter_for_observers, EventSink, ExitReason, LifecycleEvent};

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors that can occur while driving a group's lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{action} failed: {source}")]
    Transport {
        action: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("manual intervention required for group {group_id}: close retry budget exhausted after {attempts} attempt(s)")]
    ManualInterventionRequired {
        group_id: GroupId,
        pair_id: Option<PairId>,
        attempts: u32,
    },

    #[error("liquidation incomplete: {} group(s) could not be flattened", .failed.len())]
    LiquidationIncomplete { failed: Vec<GroupId> },
}

/// Configuration for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Strategy instance this manager serves (log context)
    pub strategy_id: StrategyId,
    /// Registry settings (group ceiling, duplicate match tolerance)
    pub registry: RegistryConfig,
    /// Maximum market orders issued while chasing an unfilled remainder
    pub max_close_retries: u32,
    /// Length of the main timeframe window
    pub main_interval: Duration,
    /// Fixed offset of main timeframe windows from the epoch
    pub interval_offset: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            strategy_id: StrategyId::default(),
            registry: RegistryConfig::default(),
            max_close_retries: 5,
            main_interval: Duration::hours(1),
            interval_offset: Duration::zero(),
        }
    }
}

/// A fill notification from the execution environment.
///
/// `remaining_volume` is the volume still unfilled on the order after this
/// fill; zero means the order is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeFill {
    /// Handle of the order that filled
    pub handle: OrderHandle,
    /// Volume filled by this notification
    pub filled_volume: Decimal,
    /// Volume still unfilled on the order
    pub remaining_volume: Decimal,
    /// Fill price
    pub price: Decimal,
    /// Fill time
    pub time: DateTime<Utc>,
}

impl TradeFill {
    /// Create a fill notification.
    pub fn new(
        handle: OrderHandle,
        filled_volume: Decimal,
        remaining_volume: Decimal,
        price: Decimal,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            handle,
            filled_volume,
            remaining_volume,
            price,
            time,
        }
    }

    /// Whether the order is fully filled after this notification.
    pub fn is_complete(&self) -> bool {
        self.remaining_volume.is_zero()
    }
}

/// A pair crossing detected on a candle, resolved to owned data so the
/// closing order can be placed without borrowing the registry.
struct Crossing {
    pair_id: PairId,
    role: PairRole,
    level: Decimal,
    volume: Decimal,
    close_kind: CloseOrderKind,
}

/// Mutable engine state guarded by a single lock.
struct EngineState {
    registry: OrderRegistry,
    /// Chase attempts per (group, pair) scope; `None` is the entry scope
    retries: HashMap<(GroupId, Option<PairId>), u32>,
    /// Most recent candle seen per security, with the stream it came from
    last_candles: HashMap<SecurityId, (Candle, StreamOrigin)>,
}

/// Drives order groups through their lifecycle.
///
/// The manager is the only writer of group state. It owns:
/// - the [`OrderRegistry`] of all groups,
/// - chase retry counters,
/// - a cache of the last candle per security.
///
/// All mutating operations serialize on one internal lock, held across
/// execution client round-trips, so each request, candle, and fill is
/// processed to completion before the next begins.
///
/// # Example
/// ```ignore
/// use std::sync::Arc;
/// use order_lifecycle::lifecycle::{LifecycleConfig, PositionLifecycleManager};
///
/// let manager = PositionLifecycleManager::new(LifecycleConfig::default(), client);
///
/// // Register a request and submit the returned entry order
/// if let Some(entry) = manager.handle_order_request(Some(request)).await? {
///     submit(entry);
/// }
///
/// // Feed candles and fills as they arrive
/// manager.check_protection_levels(&candle).await?;
/// manager.on_trade_received(&fill).await?;
/// ```
pub struct PositionLifecycleManager {
    /// Engine state; the single exclusion domain
    state: Mutex<EngineState>,
    /// Execution environment the manager places and cancels orders through
    client: Arc<dyn ExecutionClient>,
    /// Event sinks, fed through the observer filter
    sinks: RwLock<Vec<EventSink>>,
    /// Floors auxiliary-caused timestamps to main timeframe boundaries
    remapper: TimestampRemapper,
    /// Configuration
    config: LifecycleConfig,
}

impl PositionLifecycleManager {
    /// Create a new manager with the given configuration and client.
    pub fn new(config: LifecycleConfig, client: Arc<dyn ExecutionClient>) -> Self {
        let remapper =
            TimestampRemapper::with_offset(config.main_interval, config.interval_offset);
        Self {
            state: Mutex::new(EngineState {
                registry: OrderRegistry::new(config.registry.clone()),
                retries: HashMap::new(),
                last_candles: HashMap::new(),
            }),
            client,
            sinks: RwLock::new(Vec::new()),
            remapper,
            config,
        }
    }

    /// Register a sink for lifecycle events.
    pub async fn on_event(&self, sink: EventSink) {
        let mut sinks = self.sinks.write().await;
        sinks.push(sink);
    }

    /// Process a strategy decision.
    ///
    /// `Some(request)` registers a new group and returns the entry order to
    /// submit, unless a structurally identical group is still pending, in
    /// which case the request is suppressed and `None` is returned.
    ///
    /// `None` means the strategy wants no position: every pending entry is
    /// cancelled and its group closed. Groups that already filled are left
    /// alone; their protective orders manage the exit.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Registry`] if the request is invalid or the
    /// concurrent group ceiling is reached.
    pub async fn handle_order_request(
        &self,
        request: Option<OrderRequest>,
    ) -> LifecycleResult<Option<OrderSpec>> {
        let mut state = self.state.lock().await;
        let mut events = Vec::new();
        let result = match request {
            Some(request) => self.register_request(&mut state, request, &mut events),
            None => self
                .cancel_pending_entries(&mut state, &mut events)
                .await
                .map(|_| None),
        };
        drop(state);
        self.dispatch_all(events).await;
        result
    }

    /// Evaluate a main-stream candle against all active groups.
    ///
    /// Returns `true` if at least one pair was closed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Transport`] if a closing order could not be
    /// placed; the crossed pair is left in place and will be re-evaluated on
    /// the next candle.
    pub async fn check_protection_levels(&self, candle: &Candle) -> LifecycleResult<bool> {
        self.check_levels_with_origin(candle, StreamOrigin::Main)
            .await
    }

    /// Evaluate an auxiliary-stream candle against all active groups.
    ///
    /// Identical to [`check_protection_levels`](Self::check_protection_levels)
    /// except that resulting events are re-stamped to main timeframe
    /// boundaries before observers see them, and the evaluation itself is
    /// not published.
    pub async fn check_protection_levels_aux(&self, candle: &Candle) -> LifecycleResult<bool> {
        self.check_levels_with_origin(candle, StreamOrigin::Auxiliary)
            .await
    }

    /// Process a fill notification, routing it by order handle.
    ///
    /// Fills for unknown handles, and notifications whose filled volume is
    /// not positive, are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ManualInterventionRequired`] when the chase
    /// retry budget for the filled order's scope is exhausted, and
    /// [`LifecycleError::Transport`] if protective placement fails after a
    /// completed entry.
    pub async fn on_trade_received(&self, fill: &TradeFill) -> LifecycleResult<()> {
        if fill.filled_volume <= Decimal::ZERO {
            warn!(
                "Ignoring fill for order {} with non-positive volume {}",
                fill.handle, fill.filled_volume
            );
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let mut events = Vec::new();
        let result = self.route_fill(&mut state, fill, &mut events).await;
        drop(state);
        self.dispatch_all(events).await;
        result
    }

    /// Flatten and close every group.
    ///
    /// Pending entries and working protective orders are cancelled (best
    /// effort), open volume is closed with market orders, and every group is
    /// transitioned to `Closed` regardless of individual failures. Pairs of
    /// flattened groups are recorded as liquidation closes, marked at the
    /// freshest known price.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::LiquidationIncomplete`] listing the groups
    /// whose closing order could not be placed. Those groups are still
    /// closed, and flagged for manual intervention.
    pub async fn close_all_positions(&self) -> LifecycleResult<()> {
        let mut state = self.state.lock().await;
        let mut events = Vec::new();
        let result = self.close_all(&mut state, &mut events).await;
        drop(state);
        self.dispatch_all(events).await;
        result
    }

    /// Snapshot of all non-terminal groups, in registration order.
    pub async fn active_groups(&self) -> Vec<OrderGroup> {
        let state = self.state.lock().await;
        state
            .registry
            .active_groups()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Snapshot of a single group.
    pub async fn group(&self, group_id: &GroupId) -> Option<OrderGroup> {
        let state = self.state.lock().await;
        state.registry.get(group_id).cloned()
    }

    /// Aggregate counters over all groups.
    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.lock().await;
        state.registry.stats()
    }

    /// Clear all groups and transient tracking state.
    ///
    /// Event sinks stay registered.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.registry.reset();
        state.retries.clear();
        state.last_candles.clear();
        info!("Lifecycle manager reset for strategy {}", self.config.strategy_id);
    }

    // === Private Methods ===

    fn register_request(
        &self,
        state: &mut EngineState,
        request: OrderRequest,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<Option<OrderSpec>> {
        let now = Utc::now();

        // A structurally identical group still waiting for its entry fill
        // means this request is a replay of the same decision.
        if let Some(matched) = state.registry.find_matching(&request) {
            if matched.state() == GroupState::Pending {
                info!(
                    "Suppressed duplicate request for {} {}: matches pending group {}",
                    request.entry.security, request.entry.side, matched.id
                );
                events.push(LifecycleEvent::DuplicateSuppressed {
                    group_id: matched.id.clone(),
                    ts: now,
                    origin: StreamOrigin::Main,
                });
                return Ok(None);
            }
        }

        let (group_id, entry_spec) = state.registry.register(&request)?;
        info!(
            "Registered group {}: {} {} {} @ {} with {} protective pair(s)",
            group_id,
            request.entry.side,
            request.entry.volume,
            request.entry.security,
            request.entry.price,
            request.pairs.len()
        );
        events.push(LifecycleEvent::GroupRegistered {
            group_id,
            security: request.entry.security.clone(),
            side: request.entry.side,
            entry_price: request.entry.price,
            volume: request.entry.volume,
            ts: now,
            origin: StreamOrigin::Main,
        });

        Ok(Some(entry_spec))
    }

    async fn cancel_pending_entries(
        &self,
        state: &mut EngineState,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<()> {
        let now = Utc::now();
        let group_ids = state.registry.active_group_ids();

        for group_id in group_ids {
            let entry_handle = {
                let group = match state.registry.get(&group_id) {
                    Some(g) => g,
                    None => continue,
                };
                if group.state() != GroupState::Pending {
                    continue;
                }
                group.entry_handle.clone()
            };

            if let Err(e) = self.client.cancel_order(&entry_handle).await {
                warn!("Failed to cancel entry order {}: {}", entry_handle, e);
            }

            let group = state.registry.group_mut(&group_id)?;
            group
                .transition_to(GroupState::Closed)
                .map_err(RegistryError::from)?;
            info!("Cancelled pending entry for group {}", group_id);
            events.push(LifecycleEvent::PendingCancelled {
                group_id: group_id.clone(),
                ts: now,
                origin: StreamOrigin::Main,
            });
            events.push(LifecycleEvent::GroupClosed {
                group_id,
                ts: now,
                origin: StreamOrigin::Main,
            });
        }
        Ok(())
    }

    async fn check_levels_with_origin(
        &self,
        candle: &Candle,
        origin: StreamOrigin,
    ) -> LifecycleResult<bool> {
        let mut state = self.state.lock().await;
        state
            .last_candles
            .insert(candle.security.clone(), (candle.clone(), origin));
        let mut events = Vec::new();
        let result = self
            .evaluate_levels(&mut state, candle, origin, &mut events)
            .await;
        drop(state);
        self.dispatch_all(events).await;
        result
    }

    /// Evaluate one candle against every active group for its security.
    ///
    /// Pairs are checked in creation order, stop level before target level,
    /// so a candle wide enough to cross both resolves as a stop.
    async fn evaluate_levels(
        &self,
        state: &mut EngineState,
        candle: &Candle,
        origin: StreamOrigin,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<bool> {
        let mut touched = false;
        let group_ids = state.registry.active_group_ids();

        for group_id in group_ids {
            let crossings = {
                let group = match state.registry.get(&group_id) {
                    Some(g) => g,
                    None => continue,
                };
                if group.entry.security != candle.security {
                    continue;
                }
                if !matches!(
                    group.state(),
                    GroupState::EntryFilled | GroupState::ProtectionActive
                ) {
                    continue;
                }
                collect_crossings(group, candle)
            };
            if crossings.is_empty() {
                continue;
            }
            touched = true;

            for crossing in crossings {
                self.close_crossed_pair(state, &group_id, crossing, candle, origin, events)
                    .await?;
            }

            let group = state.registry.group_mut(&group_id)?;
            if group.pairs_exhausted() && !group.is_terminal() {
                group
                    .transition_to(GroupState::Closed)
                    .map_err(RegistryError::from)?;
                debug!("Group {} closed: all pairs resolved", group_id);
                events.push(LifecycleEvent::GroupClosed {
                    group_id,
                    ts: candle.open_time,
                    origin,
                });
            }
        }

        events.push(LifecycleEvent::LevelsEvaluated {
            security: candle.security.clone(),
            groups_touched: touched,
            ts: candle.open_time,
            origin,
        });
        Ok(touched)
    }

    /// Close one crossed pair: place the closing order, cancel the opposing
    /// protective order, delete the pair.
    async fn close_crossed_pair(
        &self,
        state: &mut EngineState,
        group_id: &GroupId,
        crossing: Crossing,
        candle: &Candle,
        origin: StreamOrigin,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<()> {
        let close_side = {
            let group = state.registry.group_mut(group_id)?;
            group.entry.side.opposite()
        };
        let spec = match crossing.close_kind {
            CloseOrderKind::Market => {
                OrderSpec::market(candle.security.clone(), close_side, crossing.volume)
            }
            CloseOrderKind::Limit => OrderSpec::limit(
                candle.security.clone(),
                close_side,
                crossing.volume,
                crossing.level,
            ),
        };

        // The pair stays in place until the environment acknowledges the
        // closing order, so a placement failure is retried on the next candle.
        self.client
            .place_order(&spec)
            .await
            .map_err(|source| LifecycleError::Transport {
                action: "close order placement",
                source,
            })?;
        state.registry.index_order(
            spec.handle.clone(),
            group_id.clone(),
            OrderScope::Close {
                pair_id: Some(crossing.pair_id),
            },
        );

        let opposing = {
            let group = state.registry.group_mut(group_id)?;
            group
                .pair(&crossing.pair_id)
                .and_then(|p| p.opposing_handle(crossing.role).cloned())
        };
        if let Some(handle) = opposing {
            if let Err(e) = self.client.cancel_order(&handle).await {
                warn!("Failed to cancel opposing order {}: {}", handle, e);
            }
        }

        let group = state.registry.group_mut(group_id)?;
        if group.remove_pair(&crossing.pair_id).is_some() {
            group.record_closed_volume(crossing.volume);
        }
        state
            .retries
            .remove(&(group_id.clone(), Some(crossing.pair_id)));

        debug!(
            "Pair {} of group {} crossed its {} level at {}; closing {} {}",
            crossing.pair_id,
            group_id,
            crossing.role,
            crossing.level,
            close_side,
            crossing.volume
        );
        events.push(LifecycleEvent::PairClosed {
            group_id: group_id.clone(),
            pair_id: crossing.pair_id,
            exit: ExitReason::from(crossing.role),
            volume: crossing.volume,
            price: crossing.level,
            ts: candle.open_time,
            origin,
        });
        Ok(())
    }

    async fn route_fill(
        &self,
        state: &mut EngineState,
        fill: &TradeFill,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<()> {
        let lookup = state
            .registry
            .find_by_order_handle(&fill.handle)
            .map(|(group, scope)| (group.id.clone(), scope));

        match lookup {
            None => {
                warn!("Fill notification for unknown order handle {}", fill.handle);
                Ok(())
            }
            Some((group_id, OrderScope::Entry)) => {
                self.on_entry_fill(state, &group_id, fill, events).await
            }
            Some((group_id, OrderScope::Pair { pair_id, role })) => {
                self.on_protective_fill(state, &group_id, pair_id, role, fill, events)
                    .await
            }
            Some((group_id, OrderScope::Close { pair_id })) => {
                self.on_close_order_fill(state, &group_id, pair_id, fill, events)
            }
        }
    }

    async fn on_entry_fill(
        &self,
        state: &mut EngineState,
        group_id: &GroupId,
        fill: &TradeFill,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<()> {
        let (security, side) = {
            let group = state.registry.group_mut(group_id)?;
            if group.is_terminal() {
                warn!(
                    "Entry fill for closed group {}: {} @ {} is outside engine tracking",
                    group_id, fill.filled_volume, fill.price
                );
                group.flag_intervention();
                events.push(LifecycleEvent::ManualInterventionRequired {
                    group_id: group_id.clone(),
                    pair_id: None,
                    reason: format!(
                        "entry fill of {} arrived after the group was closed",
                        fill.filled_volume
                    ),
                    ts: fill.time,
                    origin: StreamOrigin::Main,
                });
                return Ok(());
            }
            group
                .apply_entry_fill(fill.filled_volume, fill.price)
                .map_err(RegistryError::from)?;
            (group.entry.security.clone(), group.entry.side)
        };

        let leaves = state.registry.group_mut(group_id)?.entry_leaves();
        if !leaves.is_zero() {
            info!(
                "Entry for group {} partially filled: {} done, {} remaining",
                group_id, fill.filled_volume, leaves
            );
            return self
                .chase_remainder(
                    state,
                    group_id,
                    None,
                    &fill.handle,
                    leaves,
                    side,
                    security,
                    fill.time,
                    events,
                )
                .await;
        }

        // Entry complete
        state.retries.remove(&(group_id.clone(), None));
        {
            let group = state.registry.group_mut(group_id)?;
            if group.state() != GroupState::Pending {
                warn!("Duplicate entry completion for group {}", group_id);
                return Ok(());
            }
            group
                .transition_to(GroupState::EntryFilled)
                .map_err(RegistryError::from)?;
            let fill_price = group.entry_fill_price.unwrap_or(fill.price);
            info!(
                "Entry for group {} filled: {} @ {}",
                group_id, group.entry.volume, fill_price
            );
            events.push(LifecycleEvent::EntryFilled {
                group_id: group_id.clone(),
                fill_price,
                volume: group.entry.volume,
                ts: fill.time,
                origin: StreamOrigin::Main,
            });
        }

        // Fast markets can move through a protective level while the entry
        // is filling. Re-check against the freshest candle before arming,
        // falling back to a point candle at the fill price.
        let (candle, candle_origin) = state
            .last_candles
            .get(&security)
            .cloned()
            .unwrap_or_else(|| {
                (
                    Candle::point(security.clone(), fill.time, fill.price),
                    StreamOrigin::Main,
                )
            });
        self.evaluate_levels(state, &candle, candle_origin, events)
            .await?;

        let pair_levels: Vec<(PairId, Decimal, Decimal, Decimal)> = {
            let group = state.registry.group_mut(group_id)?;
            if group.is_terminal() {
                // All pairs resolved on the re-check
                return Ok(());
            }
            group
                .pairs()
                .map(|(id, p)| (*id, p.stop_price, p.target_price, p.volume))
                .collect()
        };

        let close_side = side.opposite();
        for (pair_id, stop_price, target_price, volume) in pair_levels {
            let stop_spec = OrderSpec::stop(security.clone(), close_side, volume, stop_price);
            self.place_protective_leg(state, group_id, pair_id, PairRole::Stop, &stop_spec)
                .await?;

            let target_spec = OrderSpec::limit(security.clone(), close_side, volume, target_price);
            self.place_protective_leg(state, group_id, pair_id, PairRole::Target, &target_spec)
                .await?;

            debug!(
                "Armed pair {} of group {}: stop {} / target {} for {}",
                pair_id, group_id, stop_price, target_price, volume
            );
        }

        let group = state.registry.group_mut(group_id)?;
        group
            .transition_to(GroupState::ProtectionActive)
            .map_err(RegistryError::from)?;
        info!(
            "Protection active for group {}: {} pair(s) working",
            group_id,
            group.pair_count()
        );
        events.push(LifecycleEvent::ProtectionPlaced {
            group_id: group_id.clone(),
            pair_count: group.pair_count(),
            ts: fill.time,
            origin: StreamOrigin::Main,
        });
        Ok(())
    }

    /// Place one protective leg, recording its handle the moment the
    /// placement is acknowledged. A leg that placed stays reachable for
    /// fills and cancels even when its sibling fails to place.
    async fn place_protective_leg(
        &self,
        state: &mut EngineState,
        group_id: &GroupId,
        pair_id: PairId,
        role: PairRole,
        spec: &OrderSpec,
    ) -> LifecycleResult<()> {
        let action = match role {
            PairRole::Stop => "stop order placement",
            PairRole::Target => "target order placement",
        };
        self.client
            .place_order(spec)
            .await
            .map_err(|source| LifecycleError::Transport { action, source })?;
        state.registry.index_order(
            spec.handle.clone(),
            group_id.clone(),
            OrderScope::Pair { pair_id, role },
        );
        let group = state.registry.group_mut(group_id)?;
        if let Some(pair) = group.pair_mut(&pair_id) {
            pair.set_handle(role, spec.handle.clone());
        }
        Ok(())
    }

    async fn on_protective_fill(
        &self,
        state: &mut EngineState,
        group_id: &GroupId,
        pair_id: PairId,
        role: PairRole,
        fill: &TradeFill,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<()> {
        let (security, side, tracked) = {
            let group = state.registry.group_mut(group_id)?;

            if group.is_terminal() || group.pair(&pair_id).is_none() {
                // The pair was already resolved elsewhere (candle path or
                // liquidation); this fill changed the real position anyway.
                warn!(
                    "Protective fill for resolved pair {} of group {}: {} @ {}",
                    pair_id, group_id, fill.filled_volume, fill.price
                );
                group.flag_intervention();
                events.push(LifecycleEvent::ManualInterventionRequired {
                    group_id: group_id.clone(),
                    pair_id: Some(pair_id),
                    reason: format!(
                        "late protective fill of {} for an already resolved pair",
                        fill.filled_volume
                    ),
                    ts: fill.time,
                    origin: StreamOrigin::Main,
                });
                return Ok(());
            }

            let tracked = group.pair(&pair_id).map_or(Decimal::ZERO, |p| p.volume);
            (group.entry.security.clone(), group.entry.side, tracked)
        };

        // A fill of at least the tracked volume closes the pair regardless
        // of the remainder the venue reports; the books never close more
        // than they track.
        if fill.is_complete() || fill.filled_volume >= tracked {
            let booked = fill.filled_volume.min(tracked);
            let opposing = {
                let group = state.registry.group_mut(group_id)?;
                let pair = group.remove_pair(&pair_id);
                group.record_closed_volume(booked);
                match pair {
                    Some(pair) => {
                        if pair.volume != fill.filled_volume {
                            warn!(
                                "Pair {} of group {} closed with volume mismatch: tracked {}, filled {}",
                                pair_id, group_id, pair.volume, fill.filled_volume
                            );
                        }
                        pair.opposing_handle(role).cloned()
                    }
                    None => None,
                }
            };
            if let Some(handle) = opposing {
                if let Err(e) = self.client.cancel_order(&handle).await {
                    warn!("Failed to cancel opposing order {}: {}", handle, e);
                }
            }
            state.retries.remove(&(group_id.clone(), Some(pair_id)));

            info!(
                "Pair {} of group {} closed by {} fill: {} @ {}",
                pair_id, group_id, role, booked, fill.price
            );
            events.push(LifecycleEvent::PairClosed {
                group_id: group_id.clone(),
                pair_id,
                exit: ExitReason::from(role),
                volume: booked,
                price: fill.price,
                ts: fill.time,
                origin: StreamOrigin::Main,
            });

            let group = state.registry.group_mut(group_id)?;
            if group.pairs_exhausted() && !group.is_terminal() {
                group
                    .transition_to(GroupState::Closed)
                    .map_err(RegistryError::from)?;
                info!("Group {} closed: all pairs resolved", group_id);
                events.push(LifecycleEvent::GroupClosed {
                    group_id: group_id.clone(),
                    ts: fill.time,
                    origin: StreamOrigin::Main,
                });
            }
            return Ok(());
        }

        // Partial fill: book what filled, chase the tracked remainder at
        // market
        {
            let group = state.registry.group_mut(group_id)?;
            group.record_closed_volume(fill.filled_volume);
            if let Some(pair) = group.pair_mut(&pair_id) {
                pair.volume -= fill.filled_volume;
            }
        }
        let remaining = tracked - fill.filled_volume;
        info!(
            "Protective {} for pair {} of group {} partially filled: {} done, {} remaining",
            role, pair_id, group_id, fill.filled_volume, remaining
        );
        self.chase_remainder(
            state,
            group_id,
            Some((pair_id, role)),
            &fill.handle,
            remaining,
            side.opposite(),
            security,
            fill.time,
            events,
        )
        .await
    }

    fn on_close_order_fill(
        &self,
        state: &mut EngineState,
        group_id: &GroupId,
        pair_id: Option<PairId>,
        fill: &TradeFill,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<()> {
        if fill.is_complete() {
            // Bookkeeping was done when the close order was placed
            debug!(
                "Close order {} for group {} filled: {} @ {}",
                fill.handle, group_id, fill.filled_volume, fill.price
            );
            return Ok(());
        }

        // The pair this order was closing is already deleted, so there is
        // no tracking left for the remainder.
        warn!(
            "Close order {} for group {} partially filled with {} untracked remainder",
            fill.handle, group_id, fill.remaining_volume
        );
        let group = state.registry.group_mut(group_id)?;
        group.flag_intervention();
        events.push(LifecycleEvent::ManualInterventionRequired {
            group_id: group_id.clone(),
            pair_id,
            reason: format!(
                "close order partially filled, {} remaining untracked",
                fill.remaining_volume
            ),
            ts: fill.time,
            origin: StreamOrigin::Main,
        });
        Ok(())
    }

    /// Cancel the remainder of a partially filled order and chase it with a
    /// market order, within the retry budget for its scope.
    #[allow(clippy::too_many_arguments)]
    async fn chase_remainder(
        &self,
        state: &mut EngineState,
        group_id: &GroupId,
        pair_scope: Option<(PairId, PairRole)>,
        replaced_handle: &OrderHandle,
        remaining: Decimal,
        side: OrderSide,
        security: SecurityId,
        ts: DateTime<Utc>,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<()> {
        let key = (group_id.clone(), pair_scope.map(|(p, _)| p));

        // Once the budget is spent and the group flagged, further partials
        // for the same scope are left to the operator.
        let exhausted = state
            .retries
            .get(&key)
            .is_some_and(|n| *n >= self.config.max_close_retries);
        if exhausted {
            let group = state.registry.group_mut(group_id)?;
            if group.needs_intervention {
                warn!(
                    "Ignoring partial fill for group {}: retry budget already exhausted",
                    group_id
                );
                return Ok(());
            }
        }

        if let Err(e) = self.client.cancel_order(replaced_handle).await {
            warn!(
                "Failed to cancel remainder of order {}: {}",
                replaced_handle, e
            );
        }

        loop {
            let attempts = state.retries.entry(key.clone()).or_insert(0);
            if *attempts >= self.config.max_close_retries {
                let attempts = *attempts;
                let group = state.registry.group_mut(group_id)?;
                group.flag_intervention();
                error!(
                    "Close retry budget exhausted for group {} after {} attempt(s); flagging for manual intervention",
                    group_id, attempts
                );
                events.push(LifecycleEvent::ManualInterventionRequired {
                    group_id: group_id.clone(),
                    pair_id: key.1,
                    reason: format!(
                        "close retry budget exhausted after {} attempt(s)",
                        attempts
                    ),
                    ts,
                    origin: StreamOrigin::Main,
                });
                return Err(LifecycleError::ManualInterventionRequired {
                    group_id: group_id.clone(),
                    pair_id: key.1,
                    attempts,
                });
            }
            *attempts += 1;
            let attempt = *attempts;

            let spec = OrderSpec::market(security.clone(), side, remaining);
            events.push(LifecycleEvent::CloseRetryIssued {
                group_id: group_id.clone(),
                pair_id: key.1,
                attempt,
                remaining,
                ts,
                origin: StreamOrigin::Main,
            });

            match self.client.place_order(&spec).await {
                Ok(()) => {
                    let scope = match pair_scope {
                        Some((pair_id, role)) => OrderScope::Pair { pair_id, role },
                        None => OrderScope::Entry,
                    };
                    state
                        .registry
                        .index_order(spec.handle.clone(), group_id.clone(), scope);
                    // Cancel paths target the recorded handle for the scope,
                    // so it has to follow the chase order.
                    let group = state.registry.group_mut(group_id)?;
                    match pair_scope {
                        Some((pair_id, role)) => {
                            if let Some(pair) = group.pair_mut(&pair_id) {
                                pair.set_handle(role, spec.handle.clone());
                            }
                        }
                        None => group.set_entry_handle(spec.handle.clone()),
                    }
                    info!(
                        "Chase order placed for group {}: {} {} at market (attempt {})",
                        group_id, side, remaining, attempt
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Chase attempt {} for group {} failed to place: {}",
                        attempt, group_id, e
                    );
                }
            }
        }
    }

    async fn close_all(
        &self,
        state: &mut EngineState,
        events: &mut Vec<LifecycleEvent>,
    ) -> LifecycleResult<()> {
        let now = Utc::now();
        let group_ids = state.registry.active_group_ids();
        info!("Closing all positions: {} active group(s)", group_ids.len());
        let mut failed: Vec<GroupId> = Vec::new();

        for group_id in group_ids {
            let (
                entry_handle,
                entry_open,
                protective_handles,
                open_volume,
                close_side,
                security,
                mark,
            ) = {
                let group = match state.registry.get(&group_id) {
                    Some(g) => g,
                    None => continue,
                };
                let mut handles = Vec::new();
                for (_, pair) in group.pairs() {
                    if let Some(h) = &pair.stop_handle {
                        handles.push(h.clone());
                    }
                    if let Some(h) = &pair.target_handle {
                        handles.push(h.clone());
                    }
                }
                // Liquidation closes are recorded at the freshest price the
                // engine has seen for the security.
                let mark = state
                    .last_candles
                    .get(&group.entry.security)
                    .map(|(candle, _)| candle.close)
                    .or(group.entry_fill_price)
                    .unwrap_or(group.entry.price);
                (
                    group.entry_handle.clone(),
                    !group.is_entry_filled(),
                    handles,
                    group.entry_filled_volume - group.closed_volume,
                    group.entry.side.opposite(),
                    group.entry.security.clone(),
                    mark,
                )
            };

            if entry_open {
                if let Err(e) = self.client.cancel_order(&entry_handle).await {
                    warn!("Failed to cancel entry order {}: {}", entry_handle, e);
                }
            }
            for handle in protective_handles {
                if let Err(e) = self.client.cancel_order(&handle).await {
                    warn!("Failed to cancel protective order {}: {}", handle, e);
                }
            }

            if open_volume > Decimal::ZERO {
                let spec = OrderSpec::market(security, close_side, open_volume);
                match self.client.place_order(&spec).await {
                    Ok(()) => {
                        state.registry.index_order(
                            spec.handle.clone(),
                            group_id.clone(),
                            OrderScope::Close { pair_id: None },
                        );
                        let group = state.registry.group_mut(&group_id)?;
                        for pair_id in group.pair_ids() {
                            if let Some(pair) = group.remove_pair(&pair_id) {
                                events.push(LifecycleEvent::PairClosed {
                                    group_id: group_id.clone(),
                                    pair_id,
                                    exit: ExitReason::Liquidation,
                                    volume: pair.volume,
                                    price: mark,
                                    ts: now,
                                    origin: StreamOrigin::Main,
                                });
                            }
                        }
                        group.record_closed_volume(open_volume);
                        info!(
                            "Liquidating group {}: {} {} at market",
                            group_id, close_side, open_volume
                        );
                    }
                    Err(e) => {
                        error!("Liquidation order for group {} failed: {}", group_id, e);
                        let group = state.registry.group_mut(&group_id)?;
                        group.flag_intervention();
                        events.push(LifecycleEvent::ManualInterventionRequired {
                            group_id: group_id.clone(),
                            pair_id: None,
                            reason: format!("liquidation order failed: {e}"),
                            ts: now,
                            origin: StreamOrigin::Main,
                        });
                        failed.push(group_id.clone());
                    }
                }
            }

            let group = state.registry.group_mut(&group_id)?;
            if !group.is_terminal() {
                group
                    .transition_to(GroupState::Closed)
                    .map_err(RegistryError::from)?;
            }
            events.push(LifecycleEvent::GroupClosed {
                group_id,
                ts: now,
                origin: StreamOrigin::Main,
            });
        }

        state.retries.clear();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::LiquidationIncomplete { failed })
        }
    }

    async fn dispatch_all(&self, events: Vec<LifecycleEvent>) {
        if events.is_empty() {
            return;
        }
        let sinks = self.sinks.read().await;
        for event in events {
            if let Some(visible) = filter_for_observers(event, &self.remapper) {
                for sink in sinks.iter() {
                    sink(&visible);
                }
            }
        }
    }
}

fn collect_crossings(group: &OrderGroup, candle: &Candle) -> Vec<Crossing> {
    let side = group.entry.side;
    let mut crossings = Vec::new();

    for (pair_id, pair) in group.pairs() {
        let stop_hit = match side {
            OrderSide::Buy => candle.trades_at_or_below(pair.stop_price),
            OrderSide::Sell => candle.trades_at_or_above(pair.stop_price),
        };
        let target_hit = match side {
            OrderSide::Buy => candle.trades_at_or_above(pair.target_price),
            OrderSide::Sell => candle.trades_at_or_below(pair.target_price),
        };
        // Stop wins when one candle crosses both levels
        let role = if stop_hit {
            PairRole::Stop
        } else if target_hit {
            PairRole::Target
        } else {
            continue;
        };
        crossings.push(Crossing {
            pair_id: *pair_id,
            role,
            level: pair.level_for(role),
            volume: pair.volume,
            close_kind: pair.close_kind,
        });
    }
    crossings
}
