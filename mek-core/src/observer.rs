//! Passive observation.
//!
//! The hub is fire-and-forget: the Guard emits, subscribers listen, and
//! nothing a subscriber does (panic, block, disappear) can alter an
//! admission outcome. Removing every observer yields byte-identical results.
//!
//! Two subscriber styles: implement [`Observer`] directly (delivery happens
//! inside a panic-swallowing boundary), or take a [`ChannelObserver`] whose
//! bounded queue drops events when the consumer falls behind.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::trace;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

/// Closed catalog of kernel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObserverEventKind {
    CapabilityRegistered,
    GrantIssued,
    GrantRevoked,
    AdmissionRefused,
    ExecutionCompleted,
    BundleSealed,
    ProposalIgnored,
}

/// What subscribers receive. Wall-clock timestamp and an opaque detail map;
/// none of this is hashed into evidence.
#[derive(Debug, Clone, Serialize)]
pub struct ObserverEvent {
    pub kind: ObserverEventKind,
    pub at: DateTime<Utc>,
    pub details: BTreeMap<String, String>,
}

/// Passive subscriber. Must not rely on delivery order across invocations,
/// and may not mutate anything it is handed.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &ObserverEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

pub struct ObserverHub {
    subscribers: RwLock<Vec<(ObserverId, Arc<dyn Observer>)>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        ObserverHub {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = ObserverId(Uuid::new_v4());
        self.subscribers.write().push((id, observer));
        id
    }

    pub fn unregister(&self, id: ObserverId) {
        self.subscribers.write().retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver to every subscriber inside a failure-swallowing boundary.
    /// A panicking observer is silently discarded for this event.
    pub fn emit(&self, kind: ObserverEventKind, details: BTreeMap<String, String>) {
        let subscribers = self.subscribers.read().clone();
        if subscribers.is_empty() {
            return;
        }
        let event = ObserverEvent {
            kind,
            at: Utc::now(),
            details,
        };
        for (_, observer) in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if outcome.is_err() {
                trace!("observer panicked during {:?}; swallowed", kind);
            }
        }
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded-queue observer: the hub enqueues, the consumer drains at its own
/// pace, and a full queue drops the event rather than blocking the Guard.
pub struct ChannelObserver {
    tx: SyncSender<ObserverEvent>,
}

impl ChannelObserver {
    pub fn bounded(depth: usize) -> (Self, Receiver<ObserverEvent>) {
        let (tx, rx) = sync_channel(depth);
        (ChannelObserver { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn on_event(&self, event: &ObserverEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Detail-map helper used at emit sites.
pub fn details<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
