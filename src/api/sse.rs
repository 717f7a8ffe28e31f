// =============================================================================
// Stream Hub — SSE fan-out of service snapshots, overall metrics and signals
// =============================================================================
//
// Three streams per tenant:
//   /sse/services — full {services, overall} snapshot once per second.
//   /sse/overall  — the overall block alone, for lightweight clients.
//   /sse/signals  — live tail of the tenant's signals as they ingest.
//
// Fan-out is in-process. Each connection owns a bounded queue; a publisher
// that finds the queue full drops the oldest pending event and counts it,
// and the connection emits a single `lag` event with the drop count when the
// consumer catches up. Connects receive one immediate snapshot, then the
// normal cadence. Keep-alive comments flow every 15 s so intermediaries do
// not close idle streams.
// =============================================================================

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::api::auth::TenantAuth;
use crate::app_state::AppState;
use crate::types::{Signal, TenantId};

/// Pending events a connection may hold before the hub starts dropping.
const SUBSCRIBER_QUEUE_CAP: usize = 64;
/// Keep-alive comment interval.
const HEARTBEAT_SECS: u64 = 15;
/// Cadence of the services/overall publisher.
const PUBLISH_TICK_MS: u64 = 1000;

/// Which stream a subscriber is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Services,
    Overall,
    Signals,
}

/// One event ready for the wire.
#[derive(Debug, Clone)]
pub struct OutEvent {
    pub name: &'static str,
    pub data: String,
}

struct Subscriber {
    id: u64,
    tenant: TenantId,
    kind: StreamKind,
    queue: Mutex<VecDeque<OutEvent>>,
    /// Events dropped since the last `lag` emission.
    dropped: AtomicU64,
    notify: Notify,
}

impl Subscriber {
    fn push(&self, event: OutEvent) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= SUBSCRIBER_QUEUE_CAP {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Next event for this connection. A pending drop count takes precedence
    /// and is reported exactly once as a `lag` event.
    async fn next(&self) -> OutEvent {
        loop {
            let dropped = self.dropped.swap(0, Ordering::Relaxed);
            if dropped > 0 {
                return OutEvent {
                    name: "lag",
                    data: json!({ "dropped": dropped }).to_string(),
                };
            }
            if let Some(event) = self.queue.lock().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct StreamHub {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl StreamHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection. The returned handle unsubscribes on drop.
    pub fn subscribe(self: &Arc<Self>, tenant: TenantId, kind: StreamKind) -> Subscription {
        let subscriber = Arc::new(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tenant,
            kind,
            queue: Mutex::new(VecDeque::with_capacity(SUBSCRIBER_QUEUE_CAP)),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        self.subscribers.write().push(subscriber.clone());
        debug!(tenant = %tenant, id = subscriber.id, "stream subscriber added");
        Subscription {
            hub: self.clone(),
            subscriber,
        }
    }

    /// Deliver an event to every subscriber of (tenant, kind).
    pub fn publish(&self, tenant: TenantId, kind: StreamKind, event: &OutEvent) {
        let subscribers = self.subscribers.read();
        for sub in subscribers.iter() {
            if sub.tenant == tenant && sub.kind == kind {
                sub.push(event.clone());
            }
        }
    }

    /// Tenants that currently have at least one subscriber of `kind`.
    pub fn active_tenants(&self, kind: StreamKind) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.tenant)
            .collect();
        tenants.sort();
        tenants.dedup();
        tenants
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
        debug!(id, "stream subscriber removed");
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription; dropping it detaches the connection from the hub.
pub struct Subscription {
    hub: Arc<StreamHub>,
    subscriber: Arc<Subscriber>,
}

impl Subscription {
    pub async fn next_event(&self) -> OutEvent {
        self.subscriber.next().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.subscriber.id);
    }
}

// ---------------------------------------------------------------------------
// SSE handlers
// ---------------------------------------------------------------------------

type EventStream = Sse<futures_util::stream::BoxStream<'static, Result<Event, Infallible>>>;

/// `GET /sse/services` — one `services` event per second with the tenant's
/// full `{services, overall}` snapshot.
pub async fn sse_services(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
) -> EventStream {
    let tenant = auth.tenant;
    let initial = OutEvent {
        name: "services",
        data: state.services_payload_json(tenant),
    };
    let subscription = state.hub.subscribe(tenant, StreamKind::Services);
    sse_response(initial, subscription)
}

/// `GET /sse/overall` — the overall metrics block alone.
pub async fn sse_overall(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
) -> EventStream {
    let tenant = auth.tenant;
    let initial = OutEvent {
        name: "overall",
        data: state.overall_payload_json(tenant),
    };
    let subscription = state.hub.subscribe(tenant, StreamKind::Overall);
    sse_response(initial, subscription)
}

/// `GET /sse/signals` — live tail of the tenant's signals.
pub async fn sse_signals(
    auth: TenantAuth,
    State(state): State<Arc<AppState>>,
) -> EventStream {
    let tenant = auth.tenant;
    let initial = OutEvent {
        name: "signal",
        data: json!({ "connected": true }).to_string(),
    };
    let subscription = state.hub.subscribe(tenant, StreamKind::Signals);
    sse_response(initial, subscription)
}

fn sse_response(initial: OutEvent, subscription: Subscription) -> EventStream {
    let first = stream::once(async move { Ok::<Event, Infallible>(to_event(initial)) });
    let rest = stream::unfold(subscription, |subscription| async move {
        let event = subscription.next_event().await;
        Some((Ok(to_event(event)), subscription))
    });

    Sse::new(first.chain(rest).boxed()).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(HEARTBEAT_SECS))
            .text("hb"),
    )
}

fn to_event(event: OutEvent) -> Event {
    Event::default().event(event.name).data(event.data)
}

/// Publish one freshly ingested signal to the tenant's live tail.
pub fn publish_signal(hub: &StreamHub, signal: &Signal) {
    let event = OutEvent {
        name: "signal",
        data: serde_json::to_string(signal).unwrap_or_else(|_| "{}".to_string()),
    };
    hub.publish(signal.tenant_id, StreamKind::Signals, &event);
}

// ---------------------------------------------------------------------------
// Publisher loop
// ---------------------------------------------------------------------------

/// Push services/overall snapshots to every subscribed tenant once a second.
/// Runs forever; spawn once at startup.
pub async fn run_stream_publisher(state: Arc<AppState>) {
    info!(tick_ms = PUBLISH_TICK_MS, "stream publisher started");
    let mut ticker = interval(Duration::from_millis(PUBLISH_TICK_MS));
    // A stalled tick is coalesced, not replayed.
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;

        for tenant in state.hub.active_tenants(StreamKind::Services) {
            let event = OutEvent {
                name: "services",
                data: state.services_payload_json(tenant),
            };
            state.hub.publish(tenant, StreamKind::Services, &event);
        }

        for tenant in state.hub.active_tenants(StreamKind::Overall) {
            let event = OutEvent {
                name: "overall",
                data: state.overall_payload_json(tenant),
            };
            state.hub.publish(tenant, StreamKind::Overall, &event);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str) -> TenantId {
        TenantId::from_api_key(name)
    }

    fn event(data: &str) -> OutEvent {
        OutEvent {
            name: "services",
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let hub = Arc::new(StreamHub::new());
        let sub = hub.subscribe(tenant("a"), StreamKind::Services);

        hub.publish(tenant("a"), StreamKind::Services, &event("one"));
        hub.publish(tenant("a"), StreamKind::Services, &event("two"));

        assert_eq!(sub.next_event().await.data, "one");
        assert_eq!(sub.next_event().await.data, "two");
    }

    #[tokio::test]
    async fn publish_is_tenant_and_kind_scoped() {
        let hub = Arc::new(StreamHub::new());
        let sub_a = hub.subscribe(tenant("a"), StreamKind::Services);
        let _sub_b = hub.subscribe(tenant("b"), StreamKind::Services);
        let _sub_a_sig = hub.subscribe(tenant("a"), StreamKind::Signals);

        hub.publish(tenant("a"), StreamKind::Services, &event("for-a"));

        assert_eq!(sub_a.next_event().await.data, "for-a");
        // b's queue and a's signal queue stay empty.
        assert!(_sub_b.subscriber.queue.lock().is_empty());
        assert!(_sub_a_sig.subscriber.queue.lock().is_empty());
    }

    #[tokio::test]
    async fn slow_consumer_gets_one_lag_event_with_count() {
        let hub = Arc::new(StreamHub::new());
        let sub = hub.subscribe(tenant("a"), StreamKind::Services);

        // Overfill the queue by 10 without consuming.
        for i in 0..(SUBSCRIBER_QUEUE_CAP + 10) {
            hub.publish(tenant("a"), StreamKind::Services, &event(&i.to_string()));
        }

        // First delivery reports the drops, exactly once.
        let lag = sub.next_event().await;
        assert_eq!(lag.name, "lag");
        assert!(lag.data.contains("\"dropped\":10"));

        // Oldest surviving event is number 10.
        let next = sub.next_event().await;
        assert_eq!(next.data, "10");
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let hub = Arc::new(StreamHub::new());
        let sub = hub.subscribe(tenant("a"), StreamKind::Services);
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn active_tenants_deduplicates() {
        let hub = Arc::new(StreamHub::new());
        let _s1 = hub.subscribe(tenant("a"), StreamKind::Services);
        let _s2 = hub.subscribe(tenant("a"), StreamKind::Services);
        let _s3 = hub.subscribe(tenant("b"), StreamKind::Overall);

        assert_eq!(hub.active_tenants(StreamKind::Services).len(), 1);
        assert_eq!(hub.active_tenants(StreamKind::Overall).len(), 1);
        assert!(hub.active_tenants(StreamKind::Signals).is_empty());
    }

    #[tokio::test]
    async fn next_event_waits_for_publish() {
        let hub = Arc::new(StreamHub::new());
        let sub = hub.subscribe(tenant("a"), StreamKind::Signals);

        let hub2 = hub.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            hub2.publish(tenant("a"), StreamKind::Signals, &event("late"));
        });

        let got = tokio::time::timeout(Duration::from_secs(1), sub.next_event())
            .await
            .expect("should receive within a second");
        assert_eq!(got.data, "late");
        handle.await.unwrap();
    }
}
