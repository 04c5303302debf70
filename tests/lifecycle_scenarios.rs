//! Lifecycle Scenario Integration Tests
//!
//! These tests drive the full engine surface the way an embedding service
//! would: register requests, feed candles and fill notifications, and check
//! group state, placed orders, and the published event stream.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use order_lifecycle::data::{Candle, StreamOrigin};
use order_lifecycle::lifecycle::{
    ClientResult, ExecutionClient, ExitReason, LifecycleConfig, LifecycleError, LifecycleEvent,
    PositionLifecycleManager, TradeFill,
};
use order_lifecycle::orders::{
    CloseOrderKind, EntryOrder, GroupId, GroupState, OrderHandle, OrderKind, OrderRequest,
    OrderSide, OrderSpec, ProtectivePair, RegistryError, SecurityId,
};

/// Execution client that records every call and acknowledges everything.
#[derive(Default)]
struct RecordingClient {
    placed: Mutex<Vec<OrderSpec>>,
    cancelled: Mutex<Vec<OrderHandle>>,
}

impl RecordingClient {
    fn placed(&self) -> Vec<OrderSpec> {
        self.placed.lock().unwrap().clone()
    }

    fn cancelled(&self) -> Vec<OrderHandle> {
        self.cancelled.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.placed.lock().unwrap().clear();
        self.cancelled.lock().unwrap().clear();
    }
}

#[async_trait]
impl ExecutionClient for RecordingClient {
    async fn place_order(&self, spec: &OrderSpec) -> ClientResult<()> {
        self.placed.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn cancel_order(&self, handle: &OrderHandle) -> ClientResult<()> {
        self.cancelled.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

/// Manager plus its recording client and captured event stream.
struct Harness {
    manager: PositionLifecycleManager,
    client: Arc<RecordingClient>,
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(LifecycleConfig::default()).await
    }

    async fn with_config(config: LifecycleConfig) -> Self {
        let client = Arc::new(RecordingClient::default());
        let manager = PositionLifecycleManager::new(config, client.clone());

        let events: Arc<Mutex<Vec<LifecycleEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        manager
            .on_event(Box::new(move |event| {
                sink_events.lock().unwrap().push(event.clone());
            }))
            .await;

        Self {
            manager,
            client,
            events,
        }
    }

    fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    fn clear_captures(&self) {
        self.events.lock().unwrap().clear();
        self.client.clear();
    }

    /// Register a request and walk its entry to a full fill.
    async fn open_group(&self, request: OrderRequest) -> GroupId {
        let entry = self
            .manager
            .handle_order_request(Some(request))
            .await
            .expect("registration should succeed")
            .expect("entry spec should be returned");
        let volume = entry.volume;
        self.manager
            .on_trade_received(&full_fill(&entry.handle, volume, entry.price.unwrap()))
            .await
            .expect("entry fill should be accepted");

        let groups = self.manager.active_groups().await;
        groups
            .last()
            .expect("group should be active after entry fill")
            .id
            .clone()
    }
}

fn security() -> SecurityId {
    SecurityId::new("ETHUSDT", "SIM")
}

/// Long entry at `price` protected by the given (stop, target, volume) pairs.
fn long_request(price: Decimal, volume: Decimal, pairs: &[(Decimal, Decimal, Decimal)]) -> OrderRequest {
    OrderRequest::new(
        EntryOrder::new(security(), OrderSide::Buy, price, volume),
        pairs
            .iter()
            .map(|(stop, target, vol)| ProtectivePair::new(*stop, *target).with_volume(*vol))
            .collect(),
    )
}

fn full_fill(handle: &OrderHandle, volume: Decimal, price: Decimal) -> TradeFill {
    TradeFill::new(handle.clone(), volume, Decimal::ZERO, price, Utc::now())
}

fn partial_fill(
    handle: &OrderHandle,
    filled: Decimal,
    remaining: Decimal,
    price: Decimal,
) -> TradeFill {
    TradeFill::new(handle.clone(), filled, remaining, price, Utc::now())
}

/// Main-stream candle opening at 14:00 on a fixed day.
fn main_candle(low: Decimal, high: Decimal) -> Candle {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
    Candle::new(security(), t, low, high, low, high, dec!(100))
}

/// Auxiliary candle opening at 14:{minute} on the same day.
fn aux_candle(minute: u32, low: Decimal, high: Decimal) -> Candle {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 14, minute, 0).unwrap();
    Candle::new(security(), t, low, high, low, high, dec!(10))
}

/// A candle that reaches one target but not the other closes exactly one
/// pair and leaves the group protected.
#[tokio::test]
async fn test_candle_closes_only_the_crossed_pair() {
    let harness = Harness::new().await;
    let group_id = harness
        .open_group(long_request(
            dec!(100),
            dec!(1.0),
            &[
                (dec!(95), dec!(105), dec!(0.5)),
                (dec!(95), dec!(110), dec!(0.5)),
            ],
        ))
        .await;
    harness.clear_captures();

    // Reaches 105 but not 110, and never trades down to 95
    let touched = harness
        .manager
        .check_protection_levels(&main_candle(dec!(104), dec!(106)))
        .await
        .unwrap();
    assert!(touched, "the first pair's target was crossed");

    let group = harness.manager.group(&group_id).await.unwrap();
    assert_eq!(group.state(), GroupState::ProtectionActive);
    assert_eq!(group.pair_count(), 1, "second pair must survive");
    assert_eq!(group.closed_volume, dec!(0.5));
    assert_eq!(group.remaining_protected_volume(), dec!(0.5));

    let placed = harness.client.placed();
    assert_eq!(placed.len(), 1, "one closing order for the crossed pair");
    assert_eq!(placed[0].side, OrderSide::Sell);
    assert_eq!(placed[0].volume, dec!(0.5));

    let events = harness.events();
    let closes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::PairClosed {
                exit, volume, price, ..
            } => Some((*exit, *volume, *price)),
            _ => None,
        })
        .collect();
    assert_eq!(closes, vec![(ExitReason::Target, dec!(0.5), dec!(105))]);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, LifecycleEvent::GroupClosed { .. })),
        "group must stay open while a pair is working"
    );
}

/// A partially filled stop is chased with a market order until the pair's
/// volume is fully closed, then the pair is deleted and the group closes.
#[tokio::test]
async fn test_stop_partial_fill_is_chased_to_closure() {
    let harness = Harness::new().await;
    let group_id = harness
        .open_group(long_request(
            dec!(100),
            dec!(0.5),
            &[(dec!(95), dec!(105), dec!(0.5))],
        ))
        .await;

    let group = harness.manager.group(&group_id).await.unwrap();
    let stop_handle = group
        .pairs()
        .next()
        .and_then(|(_, pair)| pair.stop_handle.clone())
        .unwrap();
    harness.clear_captures();

    // Stop fills 0.3 of 0.5
    harness
        .manager
        .on_trade_received(&partial_fill(&stop_handle, dec!(0.3), dec!(0.2), dec!(95)))
        .await
        .unwrap();

    let group = harness.manager.group(&group_id).await.unwrap();
    assert_eq!(group.state(), GroupState::ProtectionActive);
    assert_eq!(group.closed_volume, dec!(0.3));
    assert_eq!(group.remaining_protected_volume(), dec!(0.2));

    let placed = harness.client.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].kind, OrderKind::Market);
    assert_eq!(placed[0].side, OrderSide::Sell);
    assert_eq!(placed[0].volume, dec!(0.2));

    // The chase fills completely
    harness
        .manager
        .on_trade_received(&full_fill(&placed[0].handle, dec!(0.2), dec!(94.8)))
        .await
        .unwrap();

    let group = harness.manager.group(&group_id).await.unwrap();
    assert_eq!(group.state(), GroupState::Closed);
    assert!(group.pairs_exhausted());
    assert_eq!(group.closed_volume, dec!(0.5));

    let events = harness.events();
    let retries: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::CloseRetryIssued {
                attempt, remaining, ..
            } => Some((*attempt, *remaining)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(1, dec!(0.2))]);
    assert!(events.iter().any(|e| matches!(
        e,
        LifecycleEvent::PairClosed {
            exit: ExitReason::Stop,
            ..
        }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::GroupClosed { .. })));
}

/// Registration refuses a sixth concurrent group and accepts again once
/// slots free up.
#[tokio::test]
async fn test_concurrent_group_ceiling() {
    let harness = Harness::new().await;

    for i in 0..5u32 {
        let price = dec!(100) + Decimal::from(i);
        let request = long_request(
            price,
            dec!(1.0),
            &[(price - dec!(5), price + dec!(5), dec!(1.0))],
        );
        let spec = harness
            .manager
            .handle_order_request(Some(request))
            .await
            .unwrap();
        assert!(spec.is_some(), "request {i} should register");
    }

    let overflow = long_request(dec!(120), dec!(1.0), &[(dec!(115), dec!(125), dec!(1.0))]);
    let result = harness.manager.handle_order_request(Some(overflow)).await;
    assert!(matches!(
        result,
        Err(LifecycleError::Registry(RegistryError::CapacityExceeded {
            limit: 5
        }))
    ));

    // Cancelling the pending entries frees every slot
    harness.manager.handle_order_request(None).await.unwrap();
    assert!(harness.manager.active_groups().await.is_empty());

    let retry = long_request(dec!(120), dec!(1.0), &[(dec!(115), dec!(125), dec!(1.0))]);
    let spec = harness.manager.handle_order_request(Some(retry)).await.unwrap();
    assert!(spec.is_some());
}

/// A replayed request within the duplicate tolerance is suppressed while
/// the matching group is pending; a shifted one is not.
#[tokio::test]
async fn test_duplicate_suppression_uses_price_tolerance() {
    let harness = Harness::new().await;

    let first = harness
        .manager
        .handle_order_request(Some(long_request(
            dec!(100),
            dec!(1.0),
            &[(dec!(95), dec!(105), dec!(1.0))],
        )))
        .await
        .unwrap();
    assert!(first.is_some());

    // 0.005 away on every level: the same decision replayed
    let replay = harness
        .manager
        .handle_order_request(Some(long_request(
            dec!(100.005),
            dec!(1.0),
            &[(dec!(95.005), dec!(105.005), dec!(1.0))],
        )))
        .await
        .unwrap();
    assert!(replay.is_none(), "replayed request must be suppressed");
    assert_eq!(harness.manager.active_groups().await.len(), 1);
    assert!(harness
        .events()
        .iter()
        .any(|e| matches!(e, LifecycleEvent::DuplicateSuppressed { .. })));

    // 0.05 away is a different decision
    let shifted = harness
        .manager
        .handle_order_request(Some(long_request(
            dec!(100.05),
            dec!(1.0),
            &[(dec!(95), dec!(105), dec!(1.0))],
        )))
        .await
        .unwrap();
    assert!(shifted.is_some());
    assert_eq!(harness.manager.active_groups().await.len(), 2);
}

/// Repeated partial fills burn exactly the configured number of chase
/// attempts, then the engine raises manual intervention and goes quiet.
#[tokio::test]
async fn test_retry_budget_exhausts_into_manual_intervention() {
    let harness = Harness::new().await;
    let group_id = harness
        .open_group(long_request(
            dec!(100),
            dec!(1.0),
            &[(dec!(95), dec!(105), dec!(1.0))],
        ))
        .await;

    let group = harness.manager.group(&group_id).await.unwrap();
    let mut handle = group
        .pairs()
        .next()
        .and_then(|(_, pair)| pair.stop_handle.clone())
        .unwrap();
    harness.clear_captures();

    // Five partials, five chase orders
    let fills = [
        (dec!(0.5), dec!(0.5)),
        (dec!(0.1), dec!(0.4)),
        (dec!(0.1), dec!(0.3)),
        (dec!(0.1), dec!(0.2)),
        (dec!(0.1), dec!(0.1)),
    ];
    for (filled, remaining) in fills {
        harness.client.clear();
        harness
            .manager
            .on_trade_received(&partial_fill(&handle, filled, remaining, dec!(95)))
            .await
            .unwrap();
        let placed = harness.client.placed();
        assert_eq!(placed.len(), 1, "each partial is chased once");
        handle = placed[0].handle.clone();
    }

    // The sixth partial finds the budget spent
    let result = harness
        .manager
        .on_trade_received(&partial_fill(&handle, dec!(0.05), dec!(0.05), dec!(95)))
        .await;
    assert!(matches!(
        result,
        Err(LifecycleError::ManualInterventionRequired { attempts: 5, .. })
    ));

    let group = harness.manager.group(&group_id).await.unwrap();
    assert!(group.needs_intervention);
    assert_eq!(
        group.state(),
        GroupState::ProtectionActive,
        "group state is left unchanged for the operator"
    );

    let events = harness.events();
    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::CloseRetryIssued { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::ManualInterventionRequired { .. }))
            .count(),
        1
    );

    // After the flag, further partials are ignored without new events
    let before = harness.events().len();
    harness
        .manager
        .on_trade_received(&partial_fill(&handle, dec!(0.01), dec!(0.04), dec!(95)))
        .await
        .unwrap();
    assert_eq!(harness.events().len(), before, "no further chatter");
}

/// Observers cannot tell the auxiliary stream exists: its evaluations are
/// invisible and its closes surface on main timeframe boundaries.
#[tokio::test]
async fn test_aux_stream_is_invisible_to_observers() {
    let harness = Harness::new().await;
    let group_id = harness
        .open_group(long_request(
            dec!(100),
            dec!(1.0),
            &[(dec!(95), dec!(105), dec!(1.0))],
        ))
        .await;
    harness.clear_captures();

    // Quiet auxiliary candles produce nothing observable at all
    for minute in [5, 15, 25] {
        harness
            .manager
            .check_protection_levels_aux(&aux_candle(minute, dec!(99), dec!(101)))
            .await
            .unwrap();
    }
    assert!(
        harness.events().is_empty(),
        "auxiliary evaluations must not be published"
    );

    // An auxiliary candle at 14:35 crosses the target
    harness
        .manager
        .check_protection_levels_aux(&aux_candle(35, dec!(104), dec!(106)))
        .await
        .unwrap();

    let group = harness.manager.group(&group_id).await.unwrap();
    assert_eq!(group.state(), GroupState::Closed);

    let events = harness.events();
    assert!(!events.is_empty(), "the close itself is observable");
    let boundary = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
    for event in &events {
        assert_eq!(event.origin(), StreamOrigin::Main);
        assert_eq!(
            event.ts(),
            boundary,
            "auxiliary-caused records carry the window boundary time"
        );
    }
    assert!(events.iter().any(|e| matches!(
        e,
        LifecycleEvent::PairClosed {
            exit: ExitReason::Target,
            ..
        }
    )));
}

/// An entry that fills after the market already moved through the stop is
/// closed immediately instead of being armed.
#[tokio::test]
async fn test_entry_fill_against_moved_market_closes_immediately() {
    let harness = Harness::new().await;

    let entry = harness
        .manager
        .handle_order_request(Some(long_request(
            dec!(100),
            dec!(0.5),
            &[(dec!(95), dec!(105), dec!(0.5))],
        )))
        .await
        .unwrap()
        .unwrap();

    // The market trades down through the stop while the entry is pending;
    // pending groups are not evaluated
    harness
        .manager
        .check_protection_levels(&main_candle(dec!(93), dec!(96)))
        .await
        .unwrap();
    harness.clear_captures();

    // The resting entry then fills
    harness
        .manager
        .on_trade_received(&full_fill(&entry.handle, dec!(0.5), dec!(95.5)))
        .await
        .unwrap();

    let groups = harness.manager.active_groups().await;
    assert!(groups.is_empty(), "group closed on the re-check");

    let placed = harness.client.placed();
    assert_eq!(placed.len(), 1, "only the closing order, never protection");
    assert_eq!(placed[0].kind, OrderKind::Market);
    assert_eq!(placed[0].side, OrderSide::Sell);
    assert_eq!(placed[0].volume, dec!(0.5));

    let events = harness.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::EntryFilled { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        LifecycleEvent::PairClosed {
            exit: ExitReason::Stop,
            ..
        }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::GroupClosed { .. })));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, LifecycleEvent::ProtectionPlaced { .. })),
        "protective orders must not be placed for a dead position"
    );
}

/// Short groups mirror every level check.
#[tokio::test]
async fn test_short_group_mirrors_level_checks() {
    let harness = Harness::new().await;

    let request = OrderRequest::new(
        EntryOrder::new(security(), OrderSide::Sell, dec!(100), dec!(1.0)),
        vec![ProtectivePair::new(dec!(105), dec!(95))],
    );
    let entry = harness
        .manager
        .handle_order_request(Some(request))
        .await
        .unwrap()
        .unwrap();
    harness
        .manager
        .on_trade_received(&full_fill(&entry.handle, dec!(1.0), dec!(100)))
        .await
        .unwrap();
    harness.clear_captures();

    // A candle spanning both levels resolves as a stop, on the buy side
    harness
        .manager
        .check_protection_levels(&main_candle(dec!(94), dec!(106)))
        .await
        .unwrap();

    let placed = harness.client.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].side, OrderSide::Buy);

    let events = harness.events();
    let close = events
        .iter()
        .find_map(|e| match e {
            LifecycleEvent::PairClosed { exit, price, .. } => Some((*exit, *price)),
            _ => None,
        })
        .unwrap();
    assert_eq!(close, (ExitReason::Stop, dec!(105)));
}

/// A pair configured for limit closes exits at its level price instead of
/// at market.
#[tokio::test]
async fn test_limit_close_kind_places_limit_order() {
    let harness = Harness::new().await;

    let request = OrderRequest::new(
        EntryOrder::new(security(), OrderSide::Buy, dec!(100), dec!(1.0)),
        vec![ProtectivePair::new(dec!(95), dec!(105))
            .with_close_kind(CloseOrderKind::Limit)],
    );
    let entry = harness
        .manager
        .handle_order_request(Some(request))
        .await
        .unwrap()
        .unwrap();
    harness
        .manager
        .on_trade_received(&full_fill(&entry.handle, dec!(1.0), dec!(100)))
        .await
        .unwrap();
    harness.clear_captures();

    harness
        .manager
        .check_protection_levels(&main_candle(dec!(104), dec!(106)))
        .await
        .unwrap();

    let placed = harness.client.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].kind, OrderKind::Limit);
    assert_eq!(placed[0].price, Some(dec!(105)));
}

/// Close-all cancels what rests, flattens what is open, and closes
/// everything.
#[tokio::test]
async fn test_close_all_positions_liquidates_everything() {
    let harness = Harness::new().await;

    // One group pending, one fully protected
    let pending_entry = harness
        .manager
        .handle_order_request(Some(long_request(
            dec!(200),
            dec!(2.0),
            &[(dec!(190), dec!(210), dec!(2.0))],
        )))
        .await
        .unwrap()
        .unwrap();
    let active_id = harness
        .open_group(long_request(
            dec!(100),
            dec!(1.0),
            &[
                (dec!(95), dec!(105), dec!(0.5)),
                (dec!(95), dec!(110), dec!(0.5)),
            ],
        ))
        .await;
    harness.clear_captures();

    harness.manager.close_all_positions().await.unwrap();

    assert!(harness.manager.active_groups().await.is_empty());
    let stats = harness.manager.stats().await;
    assert_eq!(stats.total_groups, 2);
    assert_eq!(stats.closed, 2);

    let active = harness.manager.group(&active_id).await.unwrap();
    assert!(active.pairs_exhausted());
    assert_eq!(active.closed_volume, dec!(1.0));

    let cancelled = harness.client.cancelled();
    assert!(cancelled.contains(&pending_entry.handle));
    assert_eq!(
        cancelled.len(),
        5,
        "one pending entry and four protective orders"
    );

    let placed = harness.client.placed();
    assert_eq!(placed.len(), 1, "a single flattening order");
    assert_eq!(placed[0].kind, OrderKind::Market);
    assert_eq!(placed[0].volume, dec!(1.0));

    let events = harness.events();
    let closed_events = events
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::GroupClosed { .. }))
        .count();
    assert_eq!(closed_events, 2);

    // Both pairs of the flattened group surface as liquidation closes
    let liquidated: Decimal = events
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::PairClosed {
                exit: ExitReason::Liquidation,
                volume,
                ..
            } => Some(*volume),
            _ => None,
        })
        .sum();
    assert_eq!(liquidated, dec!(1.0));
}

/// Pair volumes plus closed volume always add back up to the entry volume.
#[tokio::test]
async fn test_volume_conservation_through_mixed_closes() {
    let harness = Harness::new().await;
    let group_id = harness
        .open_group(long_request(
            dec!(100),
            dec!(1.0),
            &[
                (dec!(95), dec!(105), dec!(0.5)),
                (dec!(95), dec!(110), dec!(0.5)),
            ],
        ))
        .await;

    let conserved = |group: &order_lifecycle::orders::OrderGroup| {
        group.remaining_protected_volume() + group.closed_volume == group.entry.volume
    };

    let group = harness.manager.group(&group_id).await.unwrap();
    assert!(conserved(&group));

    // First pair closes on a candle
    harness
        .manager
        .check_protection_levels(&main_candle(dec!(104), dec!(106)))
        .await
        .unwrap();
    let group = harness.manager.group(&group_id).await.unwrap();
    assert!(conserved(&group));

    // Second pair's stop partially fills, then the chase completes
    let stop_handle = group
        .pairs()
        .next()
        .and_then(|(_, pair)| pair.stop_handle.clone())
        .unwrap();
    harness.client.clear();
    harness
        .manager
        .on_trade_received(&partial_fill(&stop_handle, dec!(0.2), dec!(0.3), dec!(95)))
        .await
        .unwrap();
    let group = harness.manager.group(&group_id).await.unwrap();
    assert!(conserved(&group));

    let chase = harness.client.placed()[0].handle.clone();
    harness
        .manager
        .on_trade_received(&full_fill(&chase, dec!(0.3), dec!(94.9)))
        .await
        .unwrap();

    let group = harness.manager.group(&group_id).await.unwrap();
    assert_eq!(group.state(), GroupState::Closed);
    assert_eq!(group.closed_volume, dec!(1.0));
    assert!(conserved(&group));
}
