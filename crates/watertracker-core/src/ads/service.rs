//! Async driver for [`AdController`].
//!
//! The controller lives inside one tokio task. Everything that mutates it
//! arrives over a channel: UI commands through [`AdServiceHandle`], fetch
//! completions and ad activity from the tasks this service spawns, and the
//! periodic expiry sweep from an interval in the same `select!` loop. No
//! slot state is ever touched from two places at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::controller::{AdController, FetchRequest, Followup, LoadOutcome, LoadStep, ShowOutcome};
use super::limit::LimitStatus;
use super::provider::{ActivityReceiver, AdActivity, AdProvider, FetchedAd};
use super::{AdConfig, AdKind};
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, ProviderError};
use crate::events::{AdEvent, EventBus};
use crate::storage::AdsSettings;

enum Command {
    Load {
        kind: AdKind,
        reply: Option<oneshot::Sender<LoadOutcome>>,
    },
    Show {
        kind: AdKind,
        reply: oneshot::Sender<ShowOutcome>,
    },
    Disappear {
        kind: AdKind,
    },
    IsLoaded {
        kind: AdKind,
        reply: oneshot::Sender<bool>,
    },
    SetConfig {
        config: AdConfig,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    LimitStatus {
        reply: oneshot::Sender<LimitStatus>,
    },
    Shutdown,
}

/// Messages from tasks spawned by the service itself.
enum Internal {
    Fetched {
        request: FetchRequest,
        result: Result<FetchedAd, ProviderError>,
    },
    Activity {
        kind: AdKind,
        ad_id: Uuid,
        activity: AdActivity,
    },
}

/// Cloneable entry point for the UI layer.
#[derive(Clone)]
pub struct AdServiceHandle {
    commands: mpsc::Sender<Command>,
    bus: EventBus,
}

impl AdServiceHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CoreError::ServiceClosed)?;
        rx.await.map_err(|_| CoreError::ServiceClosed)
    }

    /// Load `kind` and wait for the waterfall to finish.
    pub async fn load(&self, kind: AdKind) -> Result<LoadOutcome, CoreError> {
        self.request(|reply| Command::Load {
            kind,
            reply: Some(reply),
        })
        .await
    }

    /// Start loading `kind` without waiting for the outcome.
    pub async fn preload(&self, kind: AdKind) -> Result<(), CoreError> {
        self.commands
            .send(Command::Load { kind, reply: None })
            .await
            .map_err(|_| CoreError::ServiceClosed)
    }

    pub async fn show(&self, kind: AdKind) -> Result<ShowOutcome, CoreError> {
        self.request(|reply| Command::Show { kind, reply }).await
    }

    pub async fn disappear(&self, kind: AdKind) -> Result<(), CoreError> {
        self.commands
            .send(Command::Disappear { kind })
            .await
            .map_err(|_| CoreError::ServiceClosed)
    }

    pub async fn is_loaded(&self, kind: AdKind) -> Result<bool, CoreError> {
        self.request(|reply| Command::IsLoaded { kind, reply }).await
    }

    /// Swap in a new placement config (e.g. fetched remotely).
    pub async fn set_config(&self, config: AdConfig) -> Result<(), CoreError> {
        self.request(|reply| Command::SetConfig { config, reply })
            .await?
    }

    pub async fn limit_status(&self) -> Result<LimitStatus, CoreError> {
        self.request(|reply| Command::LimitStatus { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdEvent> {
        self.bus.subscribe()
    }

    /// Stop the service task. Outstanding fetches are abandoned.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| CoreError::ServiceClosed)
    }
}

pub struct AdService<P: AdProvider, C: Clock + 'static = SystemClock> {
    controller: AdController<C>,
    provider: Arc<P>,
    bus: EventBus,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    /// Callers waiting on a load, keyed by waterfall.
    waiters: HashMap<Uuid, oneshot::Sender<LoadOutcome>>,
    sweep_interval: Duration,
}

impl<P: AdProvider, C: Clock + 'static> AdService<P, C> {
    /// Spawn the service on the current tokio runtime.
    pub fn spawn(
        controller: AdController<C>,
        provider: Arc<P>,
        settings: &AdsSettings,
    ) -> (AdServiceHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(settings.command_capacity.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(settings.event_capacity);

        let service = Self {
            controller: controller.with_expiry(settings.expiry()),
            provider,
            bus: bus.clone(),
            commands,
            internal_tx,
            internal_rx,
            waiters: HashMap::new(),
            sweep_interval: settings.sweep_interval(),
        };
        let task = tokio::spawn(service.run());

        (
            AdServiceHandle {
                commands: commands_tx,
                bus,
            },
            task,
        )
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = self.internal_rx.recv() => self.handle_internal(message),
                _ = sweep.tick() => {
                    self.controller.sweep();
                }
            }
            self.publish_events();
        }

        tracing::debug!("ad service stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Load { kind, reply } => self.start_load(kind, reply),
            Command::Show { kind, reply } => {
                let outcome = self.show(kind);
                let _ = reply.send(outcome);
            }
            Command::Disappear { kind } => self.controller.disappear(kind),
            Command::IsLoaded { kind, reply } => {
                let _ = reply.send(self.controller.is_loaded(kind));
            }
            Command::SetConfig { config, reply } => {
                let _ = reply.send(self.controller.set_config(config));
            }
            Command::LimitStatus { reply } => {
                let _ = reply.send(self.controller.limit_status());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Fetched { request, result } => {
                match self.controller.complete_attempt(&request, result) {
                    LoadStep::Fetch(next) => self.spawn_fetch(next),
                    LoadStep::Finished(outcome) => {
                        let reply = self.waiters.remove(&request.load_id);
                        self.finish_load(request.kind, outcome, reply);
                    }
                }
            }
            Internal::Activity {
                kind,
                ad_id,
                activity,
            } => {
                if let Some(Followup::Reload(kind)) = self.controller.on_activity(kind, ad_id, activity) {
                    self.start_load(kind, None);
                }
            }
        }
    }

    fn start_load(&mut self, kind: AdKind, reply: Option<oneshot::Sender<LoadOutcome>>) {
        match self.controller.begin_load(kind) {
            LoadStep::Fetch(request) => {
                if let Some(reply) = reply {
                    self.waiters.insert(request.load_id, reply);
                }
                self.spawn_fetch(request);
            }
            LoadStep::Finished(outcome) => self.finish_load(kind, outcome, reply),
        }
    }

    fn finish_load(
        &mut self,
        kind: AdKind,
        outcome: LoadOutcome,
        reply: Option<oneshot::Sender<LoadOutcome>>,
    ) {
        tracing::debug!(%kind, ?outcome, "load finished");
        if kind == AdKind::Native && outcome.succeeded() {
            match self.show(AdKind::Native) {
                ShowOutcome::Ready(ad) => self.controller.notify_native(Some(ad)),
                ShowOutcome::AlreadyDisplayed => {}
                _ => self.controller.notify_native(None),
            }
        }
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    fn show(&mut self, kind: AdKind) -> ShowOutcome {
        let showing = self.controller.show(kind);
        let ad_id = match &showing.outcome {
            ShowOutcome::Presented(ad) | ShowOutcome::Ready(ad) => Some(ad.id),
            _ => None,
        };
        if let (Some(ad_id), Some(activity)) = (ad_id, showing.activity) {
            self.wire_activity(kind, ad_id, activity);
        }

        match showing.outcome {
            ShowOutcome::Presented(ad) => match self.provider.present(&ad) {
                Ok(()) => {
                    self.controller.mark_presented(kind, ad.id);
                    ShowOutcome::Presented(ad)
                }
                Err(e) => {
                    tracing::warn!(%kind, error = %e, "failed to present ad");
                    self.controller.on_activity(kind, ad.id, AdActivity::Close);
                    ShowOutcome::NoAd
                }
            },
            other => other,
        }
    }

    fn spawn_fetch(&self, request: FetchRequest) {
        let provider = Arc::clone(&self.provider);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = provider.fetch(request.kind, &request.provider_id).await;
            let _ = tx.send(Internal::Fetched { request, result });
        });
    }

    /// Forward a creative's activity back into the service loop.
    ///
    /// Ends after the close, or when either side goes away.
    fn wire_activity(&self, kind: AdKind, ad_id: Uuid, mut activity: ActivityReceiver) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(activity) = activity.recv().await {
                let closed = activity == AdActivity::Close;
                if tx
                    .send(Internal::Activity {
                        kind,
                        ad_id,
                        activity,
                    })
                    .is_err()
                    || closed
                {
                    break;
                }
            }
        });
    }

    fn publish_events(&mut self) {
        for event in self.controller.drain_events() {
            self.bus.publish(event);
        }
    }
}
