//! Ad network SDK interface.
//!
//! The controller never talks to a network directly. A provider fetches one
//! creative per call and reports what happens to it afterwards (impression,
//! click, close) over an activity channel owned by the fetched ad.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::mpsc;

use super::{AdKind, ShownAd};
use crate::error::ProviderError;

/// Something the user did with (or saw of) an ad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdActivity {
    Impression,
    Click,
    Close,
}

pub type ActivitySender = mpsc::UnboundedSender<AdActivity>;
pub type ActivityReceiver = mpsc::UnboundedReceiver<AdActivity>;

/// Channel a provider uses to report activity for one creative.
pub fn activity_channel() -> (ActivitySender, ActivityReceiver) {
    mpsc::unbounded_channel()
}

/// Assets the host UI needs to render a native ad.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeAssets {
    pub headline: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub call_to_action: Option<String>,
    #[serde(default)]
    pub advertiser: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
}

/// A successfully fetched creative.
#[derive(Debug)]
pub struct FetchedAd {
    /// Identifier assigned by the network.
    pub creative_id: String,
    /// Present for native placements.
    pub assets: Option<NativeAssets>,
    pub activity: ActivityReceiver,
}

/// An ad network SDK.
///
/// `fetch` completes exactly once. `present` hands a full-screen creative to
/// the SDK; its outcome arrives later on the creative's activity channel.
pub trait AdProvider: Send + Sync + 'static {
    fn fetch(
        &self,
        kind: AdKind,
        unit_id: &str,
    ) -> impl Future<Output = Result<FetchedAd, ProviderError>> + Send;

    fn present(&self, ad: &ShownAd) -> Result<(), ProviderError>;
}
