//! Ad slot controller.
//!
//! A synchronous state machine over one [`AdSlot`] per placement. It never
//! performs I/O and never spawns: a load returns the next fetch to issue,
//! and the caller feeds each fetch result back through
//! [`AdController::complete_attempt`]. [`AdService`](super::AdService) is
//! the async driver; tests drive the controller directly.
//!
//! ## Load
//!
//! ```text
//! begin_load -> Fetch(p0) -> complete_attempt(err) -> Fetch(p1) -> ... -> Finished
//! ```
//!
//! State changes are queued as [`AdEvent`]s; drain them with
//! [`AdController::drain_events`].

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::config::AdConfig;
use super::limit::{LimitEvent, LimitStatus, RateLimitState, LIMIT_KEY};
use super::provider::{ActivityReceiver, AdActivity, FetchedAd};
use super::slot::{AdHandle, AdSlot, ShownAd};
use super::{AdFormat, AdKind};
use crate::clock::{Clock, SystemClock};
use crate::error::{AdError, CoreError, ProviderError};
use crate::events::AdEvent;
use crate::storage::{KeyValueStore, ModelStore};

/// Storage key of the cached placement config.
pub const CONFIG_KEY: &str = "adConfig";

/// Default lifetime of a loaded-but-unused ad.
pub const DEFAULT_EXPIRY_SECS: i64 = 3000;

/// A fetch the driver must issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub kind: AdKind,
    /// Identifies the waterfall this attempt belongs to. Stable across retries.
    pub load_id: Uuid,
    pub handle_id: Uuid,
    pub provider_id: String,
}

/// How a `load` ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// The waterfall filled the slot.
    Loaded { provider_id: String },
    /// The slot already held an unused ad.
    AlreadyLoaded,
    /// Another load for the slot is still running; nothing was started.
    InFlight,
    /// Every provider failed.
    Exhausted,
    /// The slot was purged while the fetch was outstanding; the result was dropped.
    Discarded,
    /// No configuration, or the daily limit is reached.
    Failed { reason: String },
}

impl LoadOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded { .. } | LoadOutcome::AlreadyLoaded)
    }
}

impl From<AdError> for LoadOutcome {
    fn from(err: AdError) -> Self {
        LoadOutcome::Failed {
            reason: err.to_string(),
        }
    }
}

/// Next step of a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStep {
    Fetch(FetchRequest),
    Finished(LoadOutcome),
}

/// What `show` produced for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "ad", rename_all = "snake_case")]
pub enum ShowOutcome {
    /// A full-screen ad is (to be) presented by the provider.
    Presented(ShownAd),
    /// A native ad for the caller to render.
    Ready(ShownAd),
    /// A native ad is already on screen. Nothing new is handed out and the
    /// caller keeps what it has.
    AlreadyDisplayed,
    NoAd,
}

/// Result of [`AdController::show`]: the outcome plus the activity
/// subscription the driver must wire, if the ad was not wired before.
#[derive(Debug)]
pub struct Showing {
    pub outcome: ShowOutcome,
    pub activity: Option<ActivityReceiver>,
}

impl Showing {
    fn none(outcome: ShowOutcome) -> Self {
        Self {
            outcome,
            activity: None,
        }
    }
}

/// Follow-up work after handling ad activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    /// Start a fresh background load for the slot.
    Reload(AdKind),
}

pub struct AdController<C: Clock = SystemClock> {
    slots: BTreeMap<AdKind, AdSlot>,
    config: Option<AdConfig>,
    limit: RateLimitState,
    store: Box<dyn KeyValueStore>,
    clock: C,
    expiry: Duration,
    events: Vec<AdEvent>,
}

impl AdController<SystemClock> {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<C: Clock> AdController<C> {
    /// Build a controller over `store`, restoring the cached config and the
    /// limit counters if present.
    pub fn with_clock(store: Box<dyn KeyValueStore>, clock: C) -> Self {
        let now = clock.now();
        let config = store.model::<AdConfig>(CONFIG_KEY);
        let limit = store
            .model::<RateLimitState>(LIMIT_KEY)
            .unwrap_or_else(|| RateLimitState::fresh(now));
        Self {
            slots: AdKind::ALL.iter().map(|k| (*k, AdSlot::new(*k))).collect(),
            config,
            limit,
            store,
            clock,
            expiry: Duration::seconds(DEFAULT_EXPIRY_SECS),
            events: Vec::new(),
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Make the controller ready for a session.
    ///
    /// Without a cached config, `bootstrap` supplies one (the bundled
    /// document, usually) and it is cached. A limit record that is missing
    /// or from an earlier day is replaced by a fresh one.
    ///
    /// # Errors
    /// Returns an error only if persisting fails. A failing `bootstrap` is
    /// logged and leaves the controller unconfigured.
    pub fn prepare<F>(&mut self, bootstrap: F) -> Result<(), CoreError>
    where
        F: FnOnce() -> Result<AdConfig, CoreError>,
    {
        if self.config.is_none() {
            match bootstrap() {
                Ok(config) => {
                    tracing::info!("read local ad config");
                    self.set_config(config)?;
                }
                Err(e) => tracing::warn!(error = %e, "failed to read local ad config"),
            }
        }

        let now = self.clock.now();
        self.limit.roll_over(now);
        self.store.set_model(LIMIT_KEY, Some(&self.limit))?;
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn config(&self) -> Option<&AdConfig> {
        self.config.as_ref()
    }

    pub fn slot(&self, kind: AdKind) -> &AdSlot {
        &self.slots[&kind]
    }

    /// Whether `kind` holds an unused ad from a finished load.
    pub fn is_loaded(&self, kind: AdKind) -> bool {
        self.slot(kind).is_loaded()
    }

    pub fn is_limited(&mut self) -> bool {
        let today = self.clock.today();
        self.roll_over_limit();
        match &self.config {
            Some(config) => self.limit.is_limited(today, config),
            None => self.limit.is_limited(today, &AdConfig::default()),
        }
    }

    pub fn limit_status(&mut self) -> LimitStatus {
        let today = self.clock.today();
        self.roll_over_limit();
        let fallback = AdConfig::default();
        let config = self.config.as_ref().unwrap_or(&fallback);
        LimitStatus::new(&self.limit, config, today)
    }

    pub fn drain_events(&mut self) -> Vec<AdEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Replace (and cache) the placement config.
    ///
    /// # Errors
    /// Returns an error if the config cannot be persisted. The in-memory
    /// config is replaced either way.
    pub fn set_config(&mut self, config: AdConfig) -> Result<(), CoreError> {
        let result = self.store.set_model(CONFIG_KEY, Some(&config));
        self.config = Some(config);
        result
    }

    /// Zero today's counters.
    ///
    /// # Errors
    /// Returns an error if the record cannot be persisted.
    pub fn reset_limits(&mut self) -> Result<(), CoreError> {
        self.limit = RateLimitState::fresh(self.clock.now());
        self.store.set_model(LIMIT_KEY, Some(&self.limit))
    }

    /// Start loading `kind`.
    pub fn begin_load(&mut self, kind: AdKind) -> LoadStep {
        let slot = self.slot_mut(kind);
        slot.set_load_completed(false);

        if slot.has_loaded() {
            slot.set_load_completed(true);
            tracing::debug!(%kind, "ad already loaded");
            return LoadStep::Finished(LoadOutcome::AlreadyLoaded);
        }
        if slot.is_loading() {
            tracing::debug!(%kind, "ad already loading");
            return LoadStep::Finished(LoadOutcome::InFlight);
        }

        let providers = self
            .config
            .as_ref()
            .map(|c| c.providers_for(kind))
            .unwrap_or_default();
        if providers.is_empty() {
            let err = AdError::ConfigMissing(kind);
            tracing::warn!(%kind, "{err}");
            self.slot_mut(kind).set_load_completed(true);
            return LoadStep::Finished(err.into());
        }

        tracing::debug!(%kind, count = providers.len(), "starting waterfall");
        self.slot_mut(kind).start_waterfall(providers);
        self.next_attempt(kind)
    }

    /// Feed back the result of a fetch issued by [`LoadStep::Fetch`].
    pub fn complete_attempt(
        &mut self,
        request: &FetchRequest,
        result: Result<FetchedAd, ProviderError>,
    ) -> LoadStep {
        let kind = request.kind;
        let now = self.clock.now();
        let Some(mut handle) = self.slot_mut(kind).finish_attempt(request.handle_id) else {
            tracing::debug!(%kind, provider_id = %request.provider_id, "dropping result for purged slot");
            return LoadStep::Finished(LoadOutcome::Discarded);
        };

        match result {
            Ok(ad) => {
                tracing::info!(%kind, provider_id = %request.provider_id, "ad loaded");
                handle.fill(ad, now);
                let slot = self.slot_mut(kind);
                slot.push_loaded(handle);
                slot.end_waterfall();
                slot.set_load_completed(true);
                self.events.push(AdEvent::Loaded {
                    kind,
                    provider_id: request.provider_id.clone(),
                    at: now,
                });
                LoadStep::Finished(LoadOutcome::Loaded {
                    provider_id: request.provider_id.clone(),
                })
            }
            Err(e) => {
                let err = AdError::ProviderFetchFailed {
                    kind,
                    provider_id: request.provider_id.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(%kind, "{err}, trying next provider");
                self.events.push(AdEvent::AttemptFailed {
                    kind,
                    provider_id: request.provider_id.clone(),
                    reason: e.to_string(),
                    at: now,
                });
                if let Some(waterfall) = self.slot_mut(kind).waterfall_mut() {
                    waterfall.index += 1;
                }
                self.next_attempt(kind)
            }
        }
    }

    /// Take the ad to show for `kind`.
    pub fn show(&mut self, kind: AdKind) -> Showing {
        if self.is_limited() {
            let err = self.limited_error();
            tracing::info!(%kind, "{err}");
            self.clear_limited_slots();
            return Showing::none(ShowOutcome::NoAd);
        }

        let slot = self.slot_mut(kind);
        let displayed = slot.is_displayed();
        match kind.format() {
            AdFormat::FullScreen => match slot.first_loaded_mut() {
                Some(handle) => Showing {
                    activity: handle.take_activity(),
                    outcome: ShowOutcome::Presented(handle.view()),
                },
                None => Showing::none(ShowOutcome::NoAd),
            },
            AdFormat::Native => match slot.first_loaded_mut() {
                Some(_) if displayed => Showing::none(ShowOutcome::AlreadyDisplayed),
                Some(handle) => Showing {
                    activity: handle.take_activity(),
                    outcome: ShowOutcome::Ready(handle.view()),
                },
                None if displayed => Showing::none(ShowOutcome::AlreadyDisplayed),
                None => Showing::none(ShowOutcome::NoAd),
            },
        }
    }

    /// Apply activity reported for ad `ad_id` in slot `kind`.
    pub fn on_activity(&mut self, kind: AdKind, ad_id: Uuid, activity: AdActivity) -> Option<Followup> {
        let now = self.clock.now();
        match activity {
            AdActivity::Impression => {
                if !self.count(LimitEvent::Show) {
                    return None;
                }
                self.slot_mut(kind).display(now);
                self.events.push(AdEvent::Impression {
                    kind,
                    ad_id,
                    show_count: self.limit.show_count,
                    at: now,
                });
                Some(Followup::Reload(kind))
            }
            AdActivity::Click => {
                self.count(LimitEvent::Click);
                self.events.push(AdEvent::Click {
                    kind,
                    ad_id,
                    click_count: self.limit.click_count,
                    at: now,
                });
                None
            }
            AdActivity::Close => {
                self.events.push(AdEvent::Closed { kind, ad_id, at: now });
                self.disappear(kind);
                None
            }
        }
    }

    /// The ad in `kind` left the screen.
    pub fn disappear(&mut self, kind: AdKind) {
        let slot = self.slot_mut(kind);
        slot.close_display();
        if kind == AdKind::Interstitial && !slot.has_loaded() {
            tracing::debug!(%kind, "purging stale slot");
            slot.clean();
        }
        if kind == AdKind::Native {
            self.notify_native(None);
        }
    }

    /// Remove loaded ads older than the expiry from every slot.
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        let ttl = self.expiry;
        let mut total = 0;
        for (kind, slot) in self.slots.iter_mut() {
            let count = slot.expire(now, ttl);
            if count > 0 {
                tracing::debug!(%kind, count, "expired loaded ads");
                self.events.push(AdEvent::Expired {
                    kind: *kind,
                    count,
                    at: now,
                });
                total += count;
            }
        }
        total
    }

    /// The provider accepted a full-screen ad for presentation.
    pub fn mark_presented(&mut self, kind: AdKind, ad_id: Uuid) {
        tracing::debug!(%kind, %ad_id, "ad presented");
        self.events.push(AdEvent::Presented {
            kind,
            ad_id,
            at: self.clock.now(),
        });
    }

    /// Publish the native placement's new content.
    pub fn notify_native(&mut self, ad: Option<ShownAd>) {
        self.events.push(AdEvent::NativeUpdated {
            ad,
            at: self.clock.now(),
        });
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn slot_mut(&mut self, kind: AdKind) -> &mut AdSlot {
        self.slots
            .entry(kind)
            .or_insert_with(|| AdSlot::new(kind))
    }

    fn next_attempt(&mut self, kind: AdKind) -> LoadStep {
        let limited = self.is_limited();
        let limited_err = self.limited_error();
        let slot = self.slot_mut(kind);

        let entry = slot
            .waterfall_mut()
            .and_then(|w| w.current().cloned().map(|e| (w.id, e)));
        let outcome = match entry {
            None => {
                tracing::warn!(%kind, "no more providers to try");
                self.events.push(AdEvent::Exhausted {
                    kind,
                    at: self.clock.now(),
                });
                LoadOutcome::Exhausted
            }
            Some(_) if limited => {
                tracing::info!(%kind, "{limited_err}");
                limited_err.into()
            }
            Some(_) if slot.has_loaded() || slot.is_loading() => {
                tracing::debug!(%kind, "slot filled while loading");
                LoadOutcome::AlreadyLoaded
            }
            Some((load_id, entry)) => {
                let handle = AdHandle::new(kind, entry.provider_id.clone());
                let request = FetchRequest {
                    kind,
                    load_id,
                    handle_id: handle.id,
                    provider_id: entry.provider_id,
                };
                slot.begin_attempt(handle);
                self.events.push(AdEvent::LoadStarted {
                    kind,
                    provider_id: request.provider_id.clone(),
                    at: self.clock.now(),
                });
                return LoadStep::Fetch(request);
            }
        };

        let slot = self.slot_mut(kind);
        slot.end_waterfall();
        slot.set_load_completed(true);
        LoadStep::Finished(outcome)
    }

    /// Returns `false` if the event was dropped because the limit was
    /// already reached.
    fn count(&mut self, event: LimitEvent) -> bool {
        if event == LimitEvent::Show && self.is_limited() {
            tracing::info!("{}", self.limited_error());
            self.clear_limited_slots();
            return false;
        }

        self.roll_over_limit();
        self.limit.record(event);
        self.persist_limit();
        tracing::debug!(
            show_count = self.limit.show_count,
            click_count = self.limit.click_count,
            "ad limit counters"
        );

        if self.is_limited() {
            tracing::info!("{}", self.limited_error());
            self.clear_limited_slots();
        }
        true
    }

    fn clear_limited_slots(&mut self) {
        self.slot_mut(AdKind::Interstitial).clean();
        self.slot_mut(AdKind::Native).clean();
        self.notify_native(None);
        self.events.push(AdEvent::Limited {
            show_count: self.limit.show_count,
            click_count: self.limit.click_count,
            at: self.clock.now(),
        });
    }

    fn limited_error(&self) -> AdError {
        AdError::RateLimited {
            show_count: self.limit.show_count,
            click_count: self.limit.click_count,
        }
    }

    fn roll_over_limit(&mut self) {
        if self.limit.roll_over(self.clock.now()) {
            tracing::info!("new day, ad limit counters reset");
            self.persist_limit();
        }
    }

    fn persist_limit(&self) {
        if let Err(e) = self.store.set_model(LIMIT_KEY, Some(&self.limit)) {
            tracing::warn!(error = %e, "failed to persist ad limit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads::config::ProviderEntry;
    use crate::ads::provider::{activity_channel, ActivitySender};
    use crate::clock::MockClock;
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use std::sync::Arc;

    fn config(show_limit: u32, click_limit: u32) -> AdConfig {
        let entries = |ids: &[(i32, &str)]| {
            ids.iter()
                .map(|(p, id)| ProviderEntry {
                    priority: *p,
                    provider_id: id.to_string(),
                })
                .collect::<Vec<_>>()
        };
        let mut config = AdConfig {
            show_limit: Some(show_limit),
            click_limit: Some(click_limit),
            ..AdConfig::default()
        };
        config
            .placements
            .insert(AdKind::Interstitial, entries(&[(1, "A"), (2, "B")]));
        config.placements.insert(AdKind::Native, entries(&[(1, "N")]));
        config.placements.insert(AdKind::Open, entries(&[(1, "O")]));
        config
    }

    fn controller(cfg: AdConfig) -> (AdController<MockClock>, MockClock) {
        let clock = MockClock::new(Utc::now());
        let mut ctl = AdController::with_clock(Box::new(MemoryStore::new()), clock.clone());
        ctl.prepare(|| Ok(cfg)).unwrap();
        (ctl, clock)
    }

    fn fetched() -> (FetchedAd, ActivitySender) {
        let (tx, rx) = activity_channel();
        (
            FetchedAd {
                creative_id: "creative".into(),
                assets: None,
                activity: rx,
            },
            tx,
        )
    }

    fn expect_fetch(step: LoadStep) -> FetchRequest {
        match step {
            LoadStep::Fetch(req) => req,
            other => panic!("expected fetch, got {other:?}"),
        }
    }

    /// Load `kind` with the first provider succeeding.
    fn load(ctl: &mut AdController<MockClock>, kind: AdKind) -> ActivitySender {
        let req = expect_fetch(ctl.begin_load(kind));
        let (ad, tx) = fetched();
        assert!(matches!(
            ctl.complete_attempt(&req, Ok(ad)),
            LoadStep::Finished(LoadOutcome::Loaded { .. })
        ));
        tx
    }

    fn shown_id(showing: &Showing) -> Uuid {
        match &showing.outcome {
            ShowOutcome::Presented(ad) | ShowOutcome::Ready(ad) => ad.id,
            other => panic!("expected an ad, got {other:?}"),
        }
    }

    #[test]
    fn second_load_while_loading_is_a_noop() {
        let (mut ctl, _) = controller(config(10, 10));
        let _req = expect_fetch(ctl.begin_load(AdKind::Interstitial));

        assert_eq!(
            ctl.begin_load(AdKind::Interstitial),
            LoadStep::Finished(LoadOutcome::InFlight)
        );
        assert_eq!(ctl.slot(AdKind::Interstitial).counts().loading, 1);
    }

    #[test]
    fn waterfall_tries_highest_priority_first() {
        let (mut ctl, _) = controller(config(10, 10));

        let first = expect_fetch(ctl.begin_load(AdKind::Interstitial));
        assert_eq!(first.provider_id, "B");

        let second = expect_fetch(
            ctl.complete_attempt(&first, Err(ProviderError::NoFill("B".into()))),
        );
        assert_eq!(second.provider_id, "A");

        let (ad, _tx) = fetched();
        assert_eq!(
            ctl.complete_attempt(&second, Ok(ad)),
            LoadStep::Finished(LoadOutcome::Loaded {
                provider_id: "A".into()
            })
        );
        assert_eq!(ctl.slot(AdKind::Interstitial).loaded()[0].provider_id, "A");
        assert!(ctl.is_loaded(AdKind::Interstitial));
    }

    #[test]
    fn exhausted_waterfall_leaves_slot_empty() {
        let (mut ctl, _) = controller(config(10, 10));
        let req = expect_fetch(ctl.begin_load(AdKind::Open));

        assert_eq!(
            ctl.complete_attempt(&req, Err(ProviderError::NoFill("O".into()))),
            LoadStep::Finished(LoadOutcome::Exhausted)
        );
        assert!(!ctl.is_loaded(AdKind::Open));
        assert_eq!(ctl.slot(AdKind::Open).counts().loading, 0);
        assert!(ctl
            .drain_events()
            .iter()
            .any(|e| matches!(e, AdEvent::Exhausted { kind: AdKind::Open, .. })));
    }

    #[test]
    fn already_loaded_short_circuits() {
        let (mut ctl, _) = controller(config(10, 10));
        let _tx = load(&mut ctl, AdKind::Open);
        assert_eq!(
            ctl.begin_load(AdKind::Open),
            LoadStep::Finished(LoadOutcome::AlreadyLoaded)
        );
        assert!(ctl.is_loaded(AdKind::Open));
    }

    #[test]
    fn missing_config_fails_without_fetch() {
        let clock = MockClock::new(Utc::now());
        let mut ctl = AdController::with_clock(Box::new(MemoryStore::new()), clock);
        ctl.prepare(|| Err(CoreError::ServiceClosed)).unwrap();

        let step = ctl.begin_load(AdKind::Native);
        assert!(matches!(step, LoadStep::Finished(LoadOutcome::Failed { .. })));
        assert!(ctl.config().is_none());
    }

    #[test]
    fn config_is_cached_in_store() {
        let store: Box<dyn KeyValueStore> = Box::new(MemoryStore::new());
        store.set_model(CONFIG_KEY, Some(&config(1, 1))).unwrap();

        let mut ctl = AdController::with_clock(store, MockClock::new(Utc::now()));
        ctl.prepare(|| panic!("bootstrap must not run with a cached config"))
            .unwrap();
        assert_eq!(ctl.config(), Some(&config(1, 1)));
    }

    #[test]
    fn expired_ad_is_swept_and_never_shown() {
        let (mut ctl, clock) = controller(config(10, 10));
        let _tx = load(&mut ctl, AdKind::Interstitial);

        clock.advance(Duration::seconds(2999));
        assert_eq!(ctl.sweep(), 0);

        clock.advance(Duration::seconds(2));
        assert_eq!(ctl.sweep(), 1);
        assert!(!ctl.is_loaded(AdKind::Interstitial));
        assert_eq!(ctl.show(AdKind::Interstitial).outcome, ShowOutcome::NoAd);
    }

    #[test]
    fn impression_counts_displays_and_requests_reload() {
        let (mut ctl, _) = controller(config(10, 10));
        let _tx = load(&mut ctl, AdKind::Interstitial);

        let showing = ctl.show(AdKind::Interstitial);
        assert!(showing.activity.is_some());
        let id = shown_id(&showing);

        let followup = ctl.on_activity(AdKind::Interstitial, id, AdActivity::Impression);
        assert_eq!(followup, Some(Followup::Reload(AdKind::Interstitial)));
        assert_eq!(ctl.limit_status().show_count, 1);

        let counts = ctl.slot(AdKind::Interstitial).counts();
        assert_eq!((counts.loaded, counts.displayed), (0, 1));
        assert!(ctl.slot(AdKind::Interstitial).last_impression_at().is_some());
    }

    #[test]
    fn close_purges_interstitial_without_loaded() {
        let (mut ctl, _) = controller(config(10, 10));
        let _tx = load(&mut ctl, AdKind::Interstitial);
        let id = shown_id(&ctl.show(AdKind::Interstitial));
        ctl.on_activity(AdKind::Interstitial, id, AdActivity::Impression);

        ctl.on_activity(AdKind::Interstitial, id, AdActivity::Close);
        assert_eq!(ctl.slot(AdKind::Interstitial).counts(), Default::default());
        assert!(!ctl.is_loaded(AdKind::Interstitial));
    }

    #[test]
    fn disappear_interstitial_with_empty_loaded_purges_slot() {
        let (mut ctl, _) = controller(config(10, 10));
        let _req = expect_fetch(ctl.begin_load(AdKind::Interstitial));

        ctl.disappear(AdKind::Interstitial);
        assert_eq!(ctl.slot(AdKind::Interstitial).counts(), Default::default());
        assert!(!ctl.is_loaded(AdKind::Interstitial));
    }

    #[test]
    fn disappear_keeps_loaded_open_ad() {
        let (mut ctl, _) = controller(config(10, 10));
        let _tx = load(&mut ctl, AdKind::Open);
        ctl.disappear(AdKind::Open);
        assert!(ctl.is_loaded(AdKind::Open));
    }

    #[test]
    fn result_for_purged_slot_is_discarded() {
        let (mut ctl, _) = controller(config(10, 10));
        let req = expect_fetch(ctl.begin_load(AdKind::Interstitial));
        ctl.disappear(AdKind::Interstitial);

        let (ad, _tx) = fetched();
        assert_eq!(
            ctl.complete_attempt(&req, Ok(ad)),
            LoadStep::Finished(LoadOutcome::Discarded)
        );
        assert!(!ctl.slot(AdKind::Interstitial).has_loaded());
    }

    #[test]
    fn native_already_displayed_returns_early() {
        let (mut ctl, _) = controller(config(10, 10));
        let _tx = load(&mut ctl, AdKind::Native);
        let id = shown_id(&ctl.show(AdKind::Native));
        ctl.on_activity(AdKind::Native, id, AdActivity::Impression);

        // Preloaded replacement arrives while the first one is on screen.
        let _tx2 = load(&mut ctl, AdKind::Native);
        let showing = ctl.show(AdKind::Native);
        assert_eq!(showing.outcome, ShowOutcome::AlreadyDisplayed);
        assert!(showing.activity.is_none());

        ctl.disappear(AdKind::Native);
        assert!(matches!(ctl.show(AdKind::Native).outcome, ShowOutcome::Ready(_)));
    }

    #[test]
    fn fourth_impression_trips_limit_and_clears_slots() {
        let (mut ctl, _) = controller(config(3, 10));

        for _ in 0..3 {
            let _tx = load(&mut ctl, AdKind::Interstitial);
            let id = shown_id(&ctl.show(AdKind::Interstitial));
            ctl.on_activity(AdKind::Interstitial, id, AdActivity::Impression);
            ctl.disappear(AdKind::Interstitial);
        }
        assert!(ctl.is_limited());

        let _tx = load_ignoring_limit(&mut ctl, AdKind::Native);
        ctl.on_activity(AdKind::Interstitial, Uuid::new_v4(), AdActivity::Impression);

        assert!(ctl.is_limited());
        assert_eq!(ctl.limit_status().show_count, 3);
        assert_eq!(ctl.slot(AdKind::Native).counts(), Default::default());
        assert_eq!(ctl.slot(AdKind::Interstitial).counts(), Default::default());
        assert_eq!(ctl.show(AdKind::Interstitial).outcome, ShowOutcome::NoAd);
        assert!(ctl
            .drain_events()
            .iter()
            .any(|e| matches!(e, AdEvent::Limited { show_count: 3, .. })));
    }

    /// Put a loaded handle straight into a slot, bypassing the limit gate.
    fn load_ignoring_limit(ctl: &mut AdController<MockClock>, kind: AdKind) -> ActivitySender {
        let (ad, tx) = fetched();
        let mut handle = AdHandle::new(kind, "manual");
        handle.fill(ad, ctl.clock.now());
        ctl.slot_mut(kind).push_loaded(handle);
        tx
    }

    #[test]
    fn limited_user_gets_no_ad_and_no_fetch() {
        let (mut ctl, _) = controller(config(10, 1));
        let _tx = load(&mut ctl, AdKind::Interstitial);
        let id = shown_id(&ctl.show(AdKind::Interstitial));
        ctl.on_activity(AdKind::Interstitial, id, AdActivity::Click);

        assert!(ctl.is_limited());
        assert_eq!(ctl.show(AdKind::Native).outcome, ShowOutcome::NoAd);
        assert!(matches!(
            ctl.begin_load(AdKind::Open),
            LoadStep::Finished(LoadOutcome::Failed { .. })
        ));
    }

    #[test]
    fn counters_reset_on_new_day() {
        let (mut ctl, clock) = controller(config(1, 10));
        let _tx = load(&mut ctl, AdKind::Open);
        let id = shown_id(&ctl.show(AdKind::Open));
        ctl.on_activity(AdKind::Open, id, AdActivity::Impression);
        assert!(ctl.is_limited());

        clock.advance(Duration::days(1));
        assert!(!ctl.is_limited());
        assert_eq!(ctl.limit_status().show_count, 0);
    }

    #[test]
    fn stale_limit_record_is_reset_by_prepare() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let stale = RateLimitState {
            show_count: 9,
            click_count: 9,
            date: now - Duration::days(1),
        };
        store.set_model(LIMIT_KEY, Some(&stale)).unwrap();

        let mut ctl = AdController::with_clock(Box::new(SharedStore(store.clone())), MockClock::new(now));
        ctl.prepare(|| Ok(config(10, 10))).unwrap();

        let persisted: RateLimitState = store.model(LIMIT_KEY).unwrap();
        assert_eq!((persisted.show_count, persisted.click_count), (0, 0));
    }

    #[test]
    fn retries_keep_the_waterfall_id() {
        let (mut ctl, _) = controller(config(10, 10));
        let first = expect_fetch(ctl.begin_load(AdKind::Interstitial));
        let second = expect_fetch(
            ctl.complete_attempt(&first, Err(ProviderError::NoFill("B".into()))),
        );
        assert_eq!(first.load_id, second.load_id);
        assert_ne!(first.handle_id, second.handle_id);

        // A purge and a new load start a different waterfall.
        ctl.disappear(AdKind::Interstitial);
        let fresh = expect_fetch(ctl.begin_load(AdKind::Interstitial));
        assert_ne!(fresh.load_id, first.load_id);
    }

    #[test]
    fn impression_while_limited_is_dropped() {
        let (mut ctl, _) = controller(config(1, 10));
        let _tx = load(&mut ctl, AdKind::Open);
        let id = shown_id(&ctl.show(AdKind::Open));
        ctl.on_activity(AdKind::Open, id, AdActivity::Impression);
        assert!(ctl.is_limited());
        ctl.drain_events();

        let _tx = load_ignoring_limit(&mut ctl, AdKind::Native);
        let followup = ctl.on_activity(AdKind::Native, Uuid::new_v4(), AdActivity::Impression);

        assert_eq!(followup, None);
        assert_eq!(ctl.limit_status().show_count, 1);
        assert!(ctl.slot(AdKind::Native).last_impression_at().is_none());
        let events = ctl.drain_events();
        assert!(!events.iter().any(|e| matches!(e, AdEvent::Impression { .. })));
        assert!(events.iter().any(|e| matches!(e, AdEvent::Limited { .. })));
    }

    struct SharedStore(Arc<MemoryStore>);

    impl KeyValueStore for SharedStore {
        fn get(&self, key: &str) -> Result<Option<String>, crate::error::DatabaseError> {
            self.0.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), crate::error::DatabaseError> {
            self.0.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), crate::error::DatabaseError> {
            self.0.remove(key)
        }
    }
}
