use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use keel_core::Result;

/// Fired before a command handler runs.
pub const COMMAND_BEFORE: &str = "command:before";
/// Fired after a command handler returns (successfully or not).
pub const COMMAND_AFTER: &str = "command:after";
/// Fired after an extension finishes activating.
pub const EXTENSION_ACTIVATED: &str = "extension:activated";
/// Fired after an extension is disabled or unloaded.
pub const EXTENSION_DEACTIVATED: &str = "extension:deactivated";

/// Event-name prefixes only the host may publish.
pub const RESERVED_PREFIXES: &[&str] = &["command:", "extension:"];

pub fn is_reserved(event: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| event.starts_with(p))
}

/// A published event as seen by a handler.
#[derive(Debug, Clone, Serialize)]
pub struct HookEvent {
    pub name: String,
    pub payload: Value,
    /// Extension that emitted the event, `None` for host events.
    pub source: Option<String>,
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: HookEvent) -> Result<()>;
}

#[async_trait]
impl<F, Fut> HookHandler for F
where
    F: Fn(HookEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: HookEvent) -> Result<()> {
        (self)(event).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    event: String,
    owner: String,
    handler: Arc<dyn HookHandler>,
}

/// Outcome of one publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

fn same_handler(a: &Arc<dyn HookHandler>, b: &Arc<dyn HookHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Ordered pub/sub for lifecycle and extension events.
#[derive(Default)]
pub struct HookBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `event`. Subscribing the same handler to the
    /// same event twice returns the existing id.
    pub fn subscribe(&self, owner: &str, event: &str, handler: Arc<dyn HookHandler>) -> SubscriptionId {
        let mut subs = self.subscriptions.write();
        self.insert(&mut subs, owner, event, handler)
    }

    /// Like [`subscribe`](Self::subscribe), but `admit` runs under the table
    /// lock and can refuse the subscription.
    pub fn subscribe_if<A>(
        &self,
        owner: &str,
        event: &str,
        handler: Arc<dyn HookHandler>,
        admit: A,
    ) -> Result<SubscriptionId>
    where
        A: FnOnce() -> Result<()>,
    {
        let mut subs = self.subscriptions.write();
        admit()?;
        Ok(self.insert(&mut subs, owner, event, handler))
    }

    fn insert(
        &self,
        subs: &mut Vec<Subscription>,
        owner: &str,
        event: &str,
        handler: Arc<dyn HookHandler>,
    ) -> SubscriptionId {
        if let Some(existing) = subs
            .iter()
            .find(|s| s.owner == owner && s.event == event && same_handler(&s.handler, &handler))
        {
            return existing.id;
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        subs.push(Subscription {
            id,
            event: event.to_string(),
            owner: owner.to_string(),
            handler,
        });
        debug!(owner, event, "hook subscribed");
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Unsubscribe `id` only if `owner` holds it.
    pub fn unsubscribe_owned(&self, owner: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| !(s.id == id && s.owner == owner));
        subs.len() != before
    }

    /// Drop every subscription held by `owner`. Returns how many were removed.
    pub fn remove_owned(&self, owner: &str) -> usize {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.owner != owner);
        before - subs.len()
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.event == event)
            .count()
    }

    /// Deliver an event to every subscriber in registration order.
    ///
    /// A handler that errors or panics is logged and skipped; the rest still
    /// run.
    pub async fn publish(&self, name: &str, payload: Value, source: Option<&str>) -> DispatchReport {
        let targets: Vec<(String, Arc<dyn HookHandler>)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.event == name)
            .map(|s| (s.owner.clone(), Arc::clone(&s.handler)))
            .collect();

        let mut report = DispatchReport::default();
        for (owner, handler) in targets {
            let event = HookEvent {
                name: name.to_string(),
                payload: payload.clone(),
                source: source.map(str::to_string),
            };
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(extension = %owner, event = name, error = %e, "hook handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(extension = %owner, event = name, "hook handler panicked");
                }
            }
        }
        report
    }
}
