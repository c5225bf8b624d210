mod config;
mod controller;
mod kind;
mod limit;
mod provider;
mod service;
mod simulated;
mod slot;

pub use config::{AdConfig, ProviderEntry};
pub use controller::{
    AdController, FetchRequest, Followup, LoadOutcome, LoadStep, ShowOutcome, Showing, CONFIG_KEY,
    DEFAULT_EXPIRY_SECS,
};
pub use kind::{AdFormat, AdKind};
pub use limit::{LimitEvent, LimitStatus, RateLimitState, LIMIT_KEY};
pub use provider::{
    activity_channel, ActivityReceiver, ActivitySender, AdActivity, AdProvider, FetchedAd,
    NativeAssets,
};
pub use service::{AdService, AdServiceHandle};
pub use simulated::SimulatedProvider;
pub use slot::{AdHandle, AdSlot, ShownAd, SlotCounts, Waterfall};
