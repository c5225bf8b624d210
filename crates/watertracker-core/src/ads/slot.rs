//! Per-placement ad queues.
//!
//! ```text
//! loading -> loaded -> displayed
//!               \-> expired (sweep)
//! ```
//!
//! A handle lives in exactly one of the three queues. Every transition
//! removes it from the old queue before it is pushed to the next one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::ProviderEntry;
use super::provider::{ActivityReceiver, FetchedAd, NativeAssets};
use super::AdKind;

/// One ad instance, from the first fetch attempt until it is discarded.
#[derive(Debug)]
pub struct AdHandle {
    pub id: Uuid,
    pub kind: AdKind,
    pub provider_id: String,
    pub creative_id: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub assets: Option<NativeAssets>,
    activity: Option<ActivityReceiver>,
}

/// What the UI layer gets to see of a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShownAd {
    pub id: Uuid,
    pub kind: AdKind,
    pub provider_id: String,
    pub creative_id: Option<String>,
    #[serde(default)]
    pub assets: Option<NativeAssets>,
}

impl AdHandle {
    pub fn new(kind: AdKind, provider_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            provider_id: provider_id.into(),
            creative_id: None,
            loaded_at: None,
            assets: None,
            activity: None,
        }
    }

    /// Attach the fetched creative and stamp the load time.
    pub fn fill(&mut self, ad: FetchedAd, now: DateTime<Utc>) {
        self.creative_id = Some(ad.creative_id);
        self.assets = ad.assets;
        self.activity = Some(ad.activity);
        self.loaded_at = Some(now);
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match self.loaded_at {
            Some(at) => now - at > ttl,
            None => false,
        }
    }

    /// Hand out the activity subscription. Only the first caller gets it.
    pub fn take_activity(&mut self) -> Option<ActivityReceiver> {
        self.activity.take()
    }

    pub fn view(&self) -> ShownAd {
        ShownAd {
            id: self.id,
            kind: self.kind,
            provider_id: self.provider_id.clone(),
            creative_id: self.creative_id.clone(),
            assets: self.assets.clone(),
        }
    }
}

/// Progress through the provider list of one load.
#[derive(Debug, Clone)]
pub struct Waterfall {
    pub id: Uuid,
    pub providers: Vec<ProviderEntry>,
    pub index: usize,
}

impl Waterfall {
    pub fn current(&self) -> Option<&ProviderEntry> {
        self.providers.get(self.index)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounts {
    pub loading: usize,
    pub loaded: usize,
    pub displayed: usize,
}

#[derive(Debug)]
pub struct AdSlot {
    kind: AdKind,
    loading: Vec<AdHandle>,
    loaded: Vec<AdHandle>,
    displayed: Vec<AdHandle>,
    /// Whether the last load finished, successfully or not.
    load_completed: bool,
    last_impression_at: Option<DateTime<Utc>>,
    waterfall: Option<Waterfall>,
}

impl AdSlot {
    pub fn new(kind: AdKind) -> Self {
        Self {
            kind,
            loading: Vec::new(),
            loaded: Vec::new(),
            displayed: Vec::new(),
            load_completed: false,
            last_impression_at: None,
            waterfall: None,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn kind(&self) -> AdKind {
        self.kind
    }

    pub fn is_loading(&self) -> bool {
        !self.loading.is_empty()
    }

    pub fn has_loaded(&self) -> bool {
        !self.loaded.is_empty()
    }

    pub fn is_displayed(&self) -> bool {
        !self.displayed.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.load_completed && self.has_loaded()
    }

    pub fn last_impression_at(&self) -> Option<DateTime<Utc>> {
        self.last_impression_at
    }

    pub fn counts(&self) -> SlotCounts {
        SlotCounts {
            loading: self.loading.len(),
            loaded: self.loaded.len(),
            displayed: self.displayed.len(),
        }
    }

    pub fn loaded(&self) -> &[AdHandle] {
        &self.loaded
    }

    pub fn displayed(&self) -> &[AdHandle] {
        &self.displayed
    }

    // ── Transitions ──────────────────────────────────────────────────

    pub fn set_load_completed(&mut self, completed: bool) {
        self.load_completed = completed;
    }

    pub fn waterfall_mut(&mut self) -> Option<&mut Waterfall> {
        self.waterfall.as_mut()
    }

    pub fn start_waterfall(&mut self, providers: Vec<ProviderEntry>) {
        self.waterfall = Some(Waterfall {
            id: Uuid::new_v4(),
            providers,
            index: 0,
        });
    }

    pub fn end_waterfall(&mut self) {
        self.waterfall = None;
    }

    pub fn begin_attempt(&mut self, handle: AdHandle) {
        self.loading.push(handle);
    }

    /// Remove an attempt from `loading`. `None` if the slot was purged meanwhile.
    pub fn finish_attempt(&mut self, id: Uuid) -> Option<AdHandle> {
        let pos = self.loading.iter().position(|h| h.id == id)?;
        Some(self.loading.remove(pos))
    }

    pub fn push_loaded(&mut self, handle: AdHandle) {
        self.loaded.push(handle);
    }

    pub fn first_loaded_mut(&mut self) -> Option<&mut AdHandle> {
        self.loaded.first_mut()
    }

    /// The loaded ads went on screen: they become the displayed set.
    pub fn display(&mut self, now: DateTime<Utc>) {
        self.displayed = std::mem::take(&mut self.loaded);
        self.last_impression_at = Some(now);
    }

    pub fn close_display(&mut self) {
        self.displayed.clear();
    }

    /// Drop every handle and abandon any load in progress.
    pub fn clean(&mut self) {
        self.loading.clear();
        self.loaded.clear();
        self.displayed.clear();
        self.waterfall = None;
    }

    /// Remove loaded handles older than `ttl`. Returns how many were removed.
    pub fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let before = self.loaded.len();
        self.loaded.retain(|h| !h.is_expired(now, ttl));
        before - self.loaded.len()
    }
}
