//! Ad lifecycle events and the broadcast bus that carries them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ads::{AdKind, ShownAd};

/// Every state change in the ad subsystem produces an Event.
/// The UI subscribes to refresh native placements; the CLI prints them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AdEvent {
    /// A fetch was issued to one provider of the waterfall.
    LoadStarted {
        kind: AdKind,
        provider_id: String,
        at: DateTime<Utc>,
    },
    AttemptFailed {
        kind: AdKind,
        provider_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    Loaded {
        kind: AdKind,
        provider_id: String,
        at: DateTime<Utc>,
    },
    /// Every provider in the waterfall failed.
    Exhausted {
        kind: AdKind,
        at: DateTime<Utc>,
    },
    Presented {
        kind: AdKind,
        ad_id: Uuid,
        at: DateTime<Utc>,
    },
    Impression {
        kind: AdKind,
        ad_id: Uuid,
        show_count: u32,
        at: DateTime<Utc>,
    },
    Click {
        kind: AdKind,
        ad_id: Uuid,
        click_count: u32,
        at: DateTime<Utc>,
    },
    Closed {
        kind: AdKind,
        ad_id: Uuid,
        at: DateTime<Utc>,
    },
    /// The daily limit tripped; native and interstitial slots were cleared.
    Limited {
        show_count: u32,
        click_count: u32,
        at: DateTime<Utc>,
    },
    Expired {
        kind: AdKind,
        count: usize,
        at: DateTime<Utc>,
    },
    /// The native placement changed. `None` means "hide the ad view".
    NativeUpdated {
        ad: Option<ShownAd>,
        at: DateTime<Utc>,
    },
}

/// Broadcast channel for ad events.
///
/// Thin wrapper over [`tokio::sync::broadcast`]. Publishing never blocks;
/// slow subscribers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AdEvent>,
}

impl EventBus {
    /// Creates a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Errors are ignored if there are no active subscribers.
    pub fn publish(&self, event: AdEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdEvent> {
        self.tx.subscribe()
    }
}
