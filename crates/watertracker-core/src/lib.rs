//! # WaterTracker Core Library
//!
//! Ad placement logic for the WaterTracker app: which ad network to ask,
//! when a fetched ad is still fresh, and when the user has seen enough ads
//! for the day. The UI only ever asks to load, show and hide a placement.
//!
//! ## Architecture
//!
//! - **Controller**: A synchronous state machine over one slot per placement
//!   (native, interstitial, app-open). The caller feeds fetch results and
//!   ad activity back in.
//! - **Service**: A tokio task that drives the controller against an
//!   [`AdProvider`] and broadcasts [`AdEvent`]s
//! - **Storage**: SQLite key-value store for the cached placement config and
//!   the daily counters, TOML-based application configuration
//!
//! ## Key Components
//!
//! - [`AdController`]: Slot lifecycle, waterfall and daily limit
//! - [`AdServiceHandle`]: Async entry point for the UI layer
//! - [`Database`]: Key-value persistence
//! - [`Config`]: Application configuration management

pub mod ads;
pub mod clock;
pub mod error;
pub mod events;
pub mod storage;

pub use ads::{
    AdConfig, AdController, AdKind, AdProvider, AdService, AdServiceHandle, LimitStatus,
    LoadOutcome, ShowOutcome, ShownAd, SimulatedProvider,
};
pub use clock::{Clock, SystemClock};
pub use error::{AdError, ConfigError, CoreError, DatabaseError, ProviderError};
pub use events::{AdEvent, EventBus};
pub use storage::{Config, Database, KeyValueStore, MemoryStore, ModelStore};
