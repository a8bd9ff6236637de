// =============================================================================
// Event Bus: typed in-process publish/subscribe
// =============================================================================
//
// Two kinds of listener share one registry:
//   - handlers: closures run inline on the publishing thread, in subscription
//     order. Used by the instrument store and candle builder, whose updates
//     are short per-symbol critical sections.
//   - channels: an unbounded mpsc sender per subscriber. Used by anything that
//     does I/O or may be slow (sweep monitor, WebSocket clients), so it never
//     stalls the publisher.
//
// The listener list is cloned out of the lock before dispatch, so a handler
// may publish (the candle builder emits `candle:update` from inside `tick`).
// Channel listeners whose receiver is gone are pruned on the next publish.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::market_data::Candle;
use crate::trading::Trade;
use crate::types::{PriceUpdate, Tick};

/// Default practical cap on listeners per event kind.
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 100;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Tick,
    PriceUpdate,
    CandleUpdate,
    TradeOpened,
    TradeClosed,
    TradeUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        Self::Tick,
        Self::PriceUpdate,
        Self::CandleUpdate,
        Self::TradeOpened,
        Self::TradeClosed,
        Self::TradeUpdated,
    ];

    /// Wire name of the event.
    pub fn name(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::PriceUpdate => "price:update",
            Self::CandleUpdate => "candle:update",
            Self::TradeOpened => "trade:opened",
            Self::TradeClosed => "trade:closed",
            Self::TradeUpdated => "trade:updated",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload-carrying event. Serialises as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "tick")]
    Tick(Tick),
    #[serde(rename = "price:update")]
    PriceUpdate(PriceUpdate),
    #[serde(rename = "candle:update")]
    CandleUpdate(Candle),
    #[serde(rename = "trade:opened")]
    TradeOpened(Trade),
    #[serde(rename = "trade:closed")]
    TradeClosed(Trade),
    #[serde(rename = "trade:updated")]
    TradeUpdated(Trade),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Tick(_) => EventKind::Tick,
            Self::PriceUpdate(_) => EventKind::PriceUpdate,
            Self::CandleUpdate(_) => EventKind::CandleUpdate,
            Self::TradeOpened(_) => EventKind::TradeOpened,
            Self::TradeClosed(_) => EventKind::TradeClosed,
            Self::TradeUpdated(_) => EventKind::TradeUpdated,
        }
    }

    /// The trade carried by a `trade:*` event.
    pub fn trade(&self) -> Option<&Trade> {
        match self {
            Self::TradeOpened(t) | Self::TradeClosed(t) | Self::TradeUpdated(t) => Some(t),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Identifies one registration; pass it to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

enum Sink {
    Handler(Handler),
    Channel(mpsc::UnboundedSender<Event>),
}

struct Listener {
    id: SubscriptionId,
    sink: Sink,
}

/// Receiving end of a channel subscription.
///
/// Dropping it detaches the listener lazily (on the next publish).
pub struct Subscription {
    ids: Vec<SubscriptionId>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    pub fn ids(&self) -> &[SubscriptionId] {
        &self.ids
    }

    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct BusInner {
    listeners: RwLock<HashMap<EventKind, Vec<Arc<Listener>>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    max_subscribers: usize,
}

/// Cheaply clonable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                max_subscribers,
            }),
        }
    }

    /// Register an inline handler for `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(kind, Sink::Handler(Arc::new(handler)))
    }

    /// Open a channel subscription for a single event kind.
    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        self.subscribe_many(&[kind])
    }

    /// Open one channel fed by several event kinds.
    pub fn subscribe_many(&self, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = kinds
            .iter()
            .map(|kind| self.register(*kind, Sink::Channel(tx.clone())))
            .collect();
        Subscription { ids, rx }
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut map = self.inner.listeners.write();
        for list in map.values_mut() {
            if let Some(idx) = list.iter().position(|l| l.id == id) {
                list.remove(idx);
                return true;
            }
        }
        false
    }

    /// Deliver `event` to every listener of its kind, in subscription order.
    ///
    /// Returns the number of listeners the event reached.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let listeners: Vec<Arc<Listener>> = match self.inner.listeners.read().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for listener in &listeners {
            match &listener.sink {
                Sink::Handler(handler) => {
                    handler(&event);
                    delivered += 1;
                }
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dead.push(listener.id);
                    }
                }
            }
        }

        for id in dead {
            debug!(event = %kind, "dropping closed channel subscriber");
            self.unsubscribe(id);
        }

        delivered
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .listeners
            .read()
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Total events published since construction.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    fn register(&self, kind: EventKind, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut map = self.inner.listeners.write();
        let list = map.entry(kind).or_default();
        if list.len() >= self.inner.max_subscribers {
            // Registered anyway; the cap never drops events.
            error!(
                event = %kind,
                count = list.len() + 1,
                max_subscribers = self.inner.max_subscribers,
                "subscriber cap exceeded; raise max_subscribers"
            );
        }
        list.push(Arc::new(Listener { id, sink }));
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSCRIBERS)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.inner.listeners.read();
        let total: usize = map.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("listeners", &total)
            .field("max_subscribers", &self.inner.max_subscribers)
            .field("published", &self.published_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn tick(price: f64) -> Event {
        Event::Tick(Tick {
            symbol: "EURUSD".into(),
            price,
            time: 0,
        })
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = seen.clone();
            bus.on(EventKind::Tick, move |_| seen.lock().push(n));
        }

        assert_eq!(bus.publish(tick(1.0)), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn publish_only_reaches_matching_kind() {
        let bus = EventBus::default();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        bus.on(EventKind::PriceUpdate, move |_| *h.lock() += 1);

        assert_eq!(bus.publish(tick(1.0)), 0);
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let id = bus.on(EventKind::Tick, move |_| *h.lock() += 1);

        bus.publish(tick(1.0));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(tick(2.0));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn handler_may_publish_reentrantly() {
        let bus = EventBus::default();
        let inner = bus.clone();
        bus.on(EventKind::Tick, move |e| {
            if let Event::Tick(t) = e {
                inner.publish(Event::PriceUpdate(PriceUpdate {
                    symbol: t.symbol.clone(),
                    bid: t.price,
                    ask: t.price,
                    spread: 0.0,
                    time: t.time,
                }));
            }
        });
        let mut sub = bus.subscribe(EventKind::PriceUpdate);

        bus.publish(tick(1.5));
        match sub.try_recv() {
            Some(Event::PriceUpdate(u)) => assert_eq!(u.bid, 1.5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_subscription_receives_all_requested_kinds() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_many(&[EventKind::Tick, EventKind::PriceUpdate]);
        assert_eq!(sub.ids().len(), 2);

        bus.publish(tick(1.0));
        bus.publish(Event::PriceUpdate(PriceUpdate {
            symbol: "EURUSD".into(),
            bid: 1.0,
            ask: 1.1,
            spread: 0.1,
            time: 0,
        }));

        assert_eq!(sub.recv().await.map(|e| e.kind()), Some(EventKind::Tick));
        assert_eq!(
            sub.recv().await.map(|e| e.kind()),
            Some(EventKind::PriceUpdate)
        );
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventKind::Tick);
        assert_eq!(bus.subscriber_count(EventKind::Tick), 1);
        drop(sub);

        assert_eq!(bus.publish(tick(1.0)), 0);
        assert_eq!(bus.subscriber_count(EventKind::Tick), 0);
    }

    #[test]
    fn exceeding_cap_still_delivers() {
        let bus = EventBus::new(2);
        let hits = Arc::new(Mutex::new(0));
        for _ in 0..4 {
            let h = hits.clone();
            bus.on(EventKind::Tick, move |_| *h.lock() += 1);
        }
        assert_eq!(bus.subscriber_count(EventKind::Tick), 4);
        assert_eq!(bus.publish(tick(1.0)), 4);
        assert_eq!(*hits.lock(), 4);
    }

    #[test]
    fn event_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        let json = serde_json::to_value(tick(1.25)).unwrap();
        assert_eq!(json["event"], "tick");
        assert_eq!(json["data"]["price"], 1.25);
    }
}
