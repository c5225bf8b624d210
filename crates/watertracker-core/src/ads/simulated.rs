//! In-process ad network.
//!
//! Fills every request except for units marked as failing. Used for
//! development runs without a network SDK (`watertracker-cli ads simulate`)
//! and by the tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::provider::{activity_channel, ActivitySender, AdActivity, AdProvider, FetchedAd, NativeAssets};
use super::{AdFormat, AdKind, ShownAd};
use crate::error::ProviderError;

#[derive(Debug, Default)]
pub struct SimulatedProvider {
    latency: Duration,
    auto_impression: bool,
    auto_close: bool,
    failing: Mutex<HashSet<String>>,
    live: Mutex<HashMap<String, ActivitySender>>,
    requests: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report an impression as soon as an ad is presented.
    pub fn with_auto_impression(mut self, enabled: bool) -> Self {
        self.auto_impression = enabled;
        self
    }

    /// Report a close right after the impression of a presented ad.
    pub fn with_auto_close(mut self, enabled: bool) -> Self {
        self.auto_close = enabled;
        self
    }

    pub fn with_failing<I, S>(self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.failing).extend(units.into_iter().map(Into::into));
        self
    }

    pub fn fail_unit(&self, unit_id: &str) {
        lock(&self.failing).insert(unit_id.to_string());
    }

    pub fn restore_unit(&self, unit_id: &str) {
        lock(&self.failing).remove(unit_id);
    }

    /// Unit ids in the order they were requested.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }

    /// Report activity for a creative handed out earlier.
    ///
    /// Returns `false` if the creative is unknown, already closed, or nobody
    /// listens anymore. A close ends the creative.
    pub fn emit(&self, creative_id: &str, activity: AdActivity) -> bool {
        let mut live = lock(&self.live);
        let Some(tx) = live.get(creative_id) else {
            return false;
        };
        let sent = tx.send(activity).is_ok();
        if !sent || activity == AdActivity::Close {
            live.remove(creative_id);
        }
        sent
    }

    fn creative(&self, kind: AdKind, unit_id: &str) -> FetchedAd {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let creative_id = format!("sim-{unit_id}-{n}");
        let (tx, rx) = activity_channel();
        let mut live = lock(&self.live);
        // Drop creatives whose ad was discarded without a close.
        live.retain(|_, tx| !tx.is_closed());
        live.insert(creative_id.clone(), tx);
        drop(live);

        let assets = match kind.format() {
            AdFormat::Native => Some(NativeAssets {
                headline: "Stay hydrated".to_string(),
                body: Some(format!("Simulated creative from {unit_id}")),
                call_to_action: Some("Open".to_string()),
                advertiser: Some("WaterTracker".to_string()),
                icon_url: None,
            }),
            AdFormat::FullScreen => None,
        };

        FetchedAd {
            creative_id,
            assets,
            activity: rx,
        }
    }
}

impl AdProvider for SimulatedProvider {
    fn fetch(
        &self,
        kind: AdKind,
        unit_id: &str,
    ) -> impl Future<Output = Result<FetchedAd, ProviderError>> + Send {
        let unit_id = unit_id.to_string();
        async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            lock(&self.requests).push(unit_id.clone());
            if lock(&self.failing).contains(&unit_id) {
                return Err(ProviderError::NoFill(unit_id));
            }
            Ok(self.creative(kind, &unit_id))
        }
    }

    fn present(&self, ad: &ShownAd) -> Result<(), ProviderError> {
        let creative_id = ad
            .creative_id
            .as_deref()
            .ok_or_else(|| ProviderError::PresentFailed(format!("ad {} has no creative", ad.id)))?;
        if !lock(&self.live).contains_key(creative_id) {
            return Err(ProviderError::PresentFailed(format!(
                "unknown creative {creative_id}"
            )));
        }
        if self.auto_impression {
            self.emit(creative_id, AdActivity::Impression);
            if self.auto_close {
                self.emit(creative_id, AdActivity::Close);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_units_return_no_fill() {
        let provider = SimulatedProvider::new().with_failing(["bad"]);

        let err = provider.fetch(AdKind::Open, "bad").await.unwrap_err();
        assert_eq!(err, ProviderError::NoFill("bad".into()));
        assert!(provider.fetch(AdKind::Open, "good").await.is_ok());
        assert_eq!(provider.requests(), vec!["bad", "good"]);

        provider.restore_unit("bad");
        assert!(provider.fetch(AdKind::Open, "bad").await.is_ok());
    }

    #[tokio::test]
    async fn native_fetch_carries_assets() {
        let provider = SimulatedProvider::new();
        let ad = provider.fetch(AdKind::Native, "n").await.unwrap();
        assert!(ad.assets.is_some());
        let ad = provider.fetch(AdKind::Interstitial, "i").await.unwrap();
        assert!(ad.assets.is_none());
    }

    #[tokio::test]
    async fn emit_reaches_the_creative_subscription() {
        let provider = SimulatedProvider::new();
        let mut ad = provider.fetch(AdKind::Interstitial, "i").await.unwrap();

        assert!(provider.emit(&ad.creative_id, AdActivity::Click));
        assert_eq!(ad.activity.recv().await, Some(AdActivity::Click));
        assert!(!provider.emit("missing", AdActivity::Click));
    }

    #[tokio::test]
    async fn closed_creative_is_forgotten() {
        let provider = SimulatedProvider::new();
        let ad = provider.fetch(AdKind::Interstitial, "i").await.unwrap();

        assert!(provider.emit(&ad.creative_id, AdActivity::Close));
        assert!(!provider.emit(&ad.creative_id, AdActivity::Click));
        assert!(lock(&provider.live).is_empty());
    }

    #[tokio::test]
    async fn discarded_creatives_are_pruned() {
        let provider = SimulatedProvider::new();
        let dropped = provider.fetch(AdKind::Open, "o").await.unwrap();
        let dropped_id = dropped.creative_id.clone();
        drop(dropped);

        let kept = provider.fetch(AdKind::Open, "o").await.unwrap();
        let live = lock(&provider.live);
        assert_eq!(live.len(), 1);
        assert!(live.contains_key(&kept.creative_id));
        assert!(!live.contains_key(&dropped_id));
    }

    #[tokio::test]
    async fn present_with_auto_impression_and_close() {
        let provider = SimulatedProvider::new()
            .with_auto_impression(true)
            .with_auto_close(true);
        let mut ad = provider.fetch(AdKind::Open, "o").await.unwrap();
        let shown = ShownAd {
            id: uuid::Uuid::new_v4(),
            kind: AdKind::Open,
            provider_id: "o".into(),
            creative_id: Some(ad.creative_id.clone()),
            assets: None,
        };

        provider.present(&shown).unwrap();
        assert_eq!(ad.activity.recv().await, Some(AdActivity::Impression));
        assert_eq!(ad.activity.recv().await, Some(AdActivity::Close));
    }
}
