use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use watertracker_core::ads::{AdActivity, AdConfig, AdController, AdKind, AdServiceHandle};
use watertracker_core::storage::{AdsSettings, KeyValueStore};
use watertracker_core::{
    AdEvent, AdService, Config, CoreError, Database, LoadOutcome, MemoryStore, ShowOutcome,
    ShownAd, SimulatedProvider,
};

#[derive(Subcommand)]
pub enum AdsAction {
    /// Print the effective placement config
    Config {
        /// Use a throwaway in-memory store
        #[arg(long)]
        memory: bool,
    },
    /// Show today's show/click counters and limits
    Limits {
        #[arg(long)]
        memory: bool,
    },
    /// Zero today's counters
    ResetLimits,
    /// Drive the ad service against the simulated network
    Simulate {
        /// Placement to exercise (native, interstitial, open)
        #[arg(long, default_value = "interstitial")]
        kind: AdKind,
        /// Unit ids that never fill
        #[arg(long = "fail")]
        failing: Vec<String>,
        /// Number of load/show rounds
        #[arg(long, default_value_t = 1)]
        impressions: u32,
        /// Click the ad in the first N rounds
        #[arg(long, default_value_t = 0)]
        clicks: u32,
        /// Fetch latency in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
        /// Use a throwaway in-memory store
        #[arg(long)]
        memory: bool,
    },
}

pub fn run(action: AdsAction) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_or_default();
    match action {
        AdsAction::Config { memory } => {
            let controller = open_controller(&config.ads, memory)?;
            print_json(&controller.config())?;
        }
        AdsAction::Limits { memory } => {
            let mut controller = open_controller(&config.ads, memory)?;
            print_json(&controller.limit_status())?;
        }
        AdsAction::ResetLimits => {
            let mut controller = open_controller(&config.ads, false)?;
            controller.reset_limits()?;
            print_json(&controller.limit_status())?;
        }
        AdsAction::Simulate {
            kind,
            failing,
            impressions,
            clicks,
            latency_ms,
            memory,
        } => {
            let controller = open_controller(&config.ads, memory)?;
            let provider = SimulatedProvider::new()
                .with_latency(Duration::from_millis(latency_ms))
                .with_auto_impression(true)
                .with_failing(failing);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(simulate(
                controller,
                Arc::new(provider),
                &config.ads,
                kind,
                impressions,
                clicks,
            ))?;
        }
    }
    Ok(())
}

/// Placement config used when nothing is cached yet.
fn bootstrap(settings: &AdsSettings) -> Result<AdConfig, CoreError> {
    match &settings.config_file {
        Some(path) => AdConfig::load_file(Path::new(path)),
        None => Ok(AdConfig::bundled()?),
    }
}

fn open_controller(settings: &AdsSettings, memory: bool) -> Result<AdController, CoreError> {
    let store: Box<dyn KeyValueStore> = if memory {
        Box::new(MemoryStore::new())
    } else {
        Box::new(Database::open()?)
    };
    let mut controller = AdController::new(store);
    controller.prepare(|| bootstrap(settings))?;
    Ok(controller)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn simulate(
    controller: AdController,
    provider: Arc<SimulatedProvider>,
    settings: &AdsSettings,
    kind: AdKind,
    rounds: u32,
    clicks: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let (handle, task) = AdService::spawn(controller, Arc::clone(&provider), settings);

    let mut printer_rx = handle.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match printer_rx.recv().await {
                Ok(event) => {
                    if let Err(e) = print_json(&event) {
                        tracing::warn!(error = %e, "failed to print event");
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let mut watch = handle.subscribe();

    for round in 0..rounds {
        let outcome = load_settled(&handle, kind).await?;
        print_json(&outcome)?;
        if !outcome.succeeded() {
            break;
        }

        let shown = handle.show(kind).await?;
        print_json(&shown)?;
        let ad = match shown {
            ShowOutcome::Presented(ad) => ad,
            ShowOutcome::Ready(ad) => {
                if let Some(creative) = &ad.creative_id {
                    provider.emit(creative, AdActivity::Impression);
                }
                ad
            }
            ShowOutcome::AlreadyDisplayed | ShowOutcome::NoAd => break,
        };

        if round < clicks {
            if let Some(creative) = &ad.creative_id {
                provider.emit(creative, AdActivity::Click);
            }
        }

        let limited = wait_for_impression(&mut watch, &ad).await;
        close(&handle, &provider, &mut watch, &ad).await?;
        if limited {
            break;
        }
    }

    let status = handle.limit_status().await?;
    handle.shutdown().await?;
    task.await?;
    drop(handle);
    printer.await?;
    print_json(&status)?;
    Ok(())
}

/// Load `kind`, waiting out a background reload that is still running.
async fn load_settled(handle: &AdServiceHandle, kind: AdKind) -> Result<LoadOutcome, CoreError> {
    for _ in 0..100 {
        match handle.load(kind).await? {
            LoadOutcome::InFlight | LoadOutcome::Discarded => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            outcome => return Ok(outcome),
        }
    }
    Ok(LoadOutcome::InFlight)
}

/// Dismiss `ad` the way a user would and wait for the service to see it.
async fn close(
    handle: &AdServiceHandle,
    provider: &SimulatedProvider,
    rx: &mut broadcast::Receiver<AdEvent>,
    ad: &ShownAd,
) -> Result<(), CoreError> {
    let closed = ad
        .creative_id
        .as_deref()
        .is_some_and(|creative| provider.emit(creative, AdActivity::Close));
    if !closed {
        // Purged by the limit; nothing on screen to close.
        return handle.disappear(ad.kind).await;
    }

    let wait = async {
        loop {
            match rx.recv().await {
                Ok(AdEvent::Closed { ad_id, .. }) if ad_id == ad.id => return,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(2), wait).await.is_err() {
        tracing::warn!(ad_id = %ad.id, "close not reported");
    }
    Ok(())
}

/// Wait until the impression of `ad` was counted. Returns `true` if the
/// daily limit tripped instead.
async fn wait_for_impression(rx: &mut broadcast::Receiver<AdEvent>, ad: &ShownAd) -> bool {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(AdEvent::Impression { ad_id, .. }) if ad_id == ad.id => return false,
                Ok(AdEvent::Limited { .. }) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return true,
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(2), wait).await {
        Ok(limited) => limited,
        Err(_) => {
            tracing::warn!(ad_id = %ad.id, "no impression reported");
            false
        }
    }
}
