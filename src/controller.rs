//! Device controller: periodic discovery and the outbound dispatch path.
use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::device::DeviceProvider;
use crate::job::{self, JobContext, JobMessage};
use crate::message::{self, Message};
use crate::registry::{DiscoveryDiff, RegistryError, RegistryHandle, Route};

pub const ATTACHED: &str = "attached";
pub const DETACHED: &str = "detached";

pub struct DeviceController {
    registry: RegistryHandle,
    provider: Arc<dyn DeviceProvider>,
    device_in: Sender<Message>,
    jobs: JobContext,
    config: DiscoveryConfig,
}

impl DeviceController {
    pub fn new(
        registry: RegistryHandle,
        provider: Arc<dyn DeviceProvider>,
        device_in: Sender<Message>,
        jobs: JobContext,
        config: DiscoveryConfig,
    ) -> Self {
        Self { registry, provider, device_in, jobs, config }
    }

    /// Spawns the discovery and dispatch loops.
    pub fn spawn(
        self,
        device_out: Receiver<Message>,
        shutdown: CancellationToken,
    ) -> [JoinHandle<()>; 2] {
        let controller = Arc::new(self);
        let discovery = tokio::spawn(controller.clone().run_discovery(shutdown));
        let dispatch = tokio::spawn(controller.run_dispatch(device_out));
        [discovery, dispatch]
    }

    async fn run_discovery(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Discovery loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.discover_once().await {
                        tracing::error!("Discovery tick failed: {}", e);
                    }
                }
            }
        }
    }

    /// One discovery tick: diff the attached set against the registry, open
    /// new devices, drop vanished ones and announce each change.
    ///
    /// A device that fails its connect handshake stays unregistered and is
    /// retried on the next tick.
    pub async fn discover_once(&self) -> Result<DiscoveryDiff, RegistryError> {
        let current = match self.provider.attached().await {
            Ok(current) => current,
            Err(e) => {
                tracing::error!("Unable to enumerate devices: {}", e);
                return Ok(DiscoveryDiff::default());
            }
        };
        let known = self.registry.names().await?;
        let diff = DiscoveryDiff::between(&known, &current);
        let mut applied = DiscoveryDiff::default();

        for name in diff.detached {
            self.registry.remove(&name).await?;
            tracing::info!(device = %name, "Device detached");
            self.notify(Message::inform(name.as_str(), DETACHED)).await;
            applied.detached.push(name);
        }
        for name in diff.attached {
            match self.provider.connect(&name).await {
                Ok(device) => {
                    self.registry.insert(device).await?;
                    tracing::info!(device = %name, "Device attached");
                    self.notify(Message::inform(name.as_str(), ATTACHED)).await;
                    applied.attached.push(name);
                }
                Err(e) => tracing::error!(device = %name, "Unable to connect: {}", e),
            }
        }

        if current.is_empty() && known.is_empty() {
            tracing::warn!("No device(s) detected. Please attach or power on a valid device");
        }
        Ok(applied)
    }

    async fn run_dispatch(self: Arc<Self>, mut device_out: Receiver<Message>) {
        while let Some(msg) = device_out.recv().await {
            if let Err(e) = self.dispatch(msg).await {
                tracing::error!("Dispatch failed: {}", e);
                break;
            }
        }
        tracing::debug!("Dispatch loop finished");
    }

    /// Delivers one device-bound message. Only a stopped registry is an error;
    /// device failures are reported to the client and the message dropped.
    pub async fn dispatch(&self, msg: Message) -> Result<(), RegistryError> {
        let device = msg.device.clone();
        match self.registry.resolve(msg.clone()).await? {
            Route::Unknown => {
                tracing::error!(device = %device, "Invalid device provided");
                self.notify(Message::error(device.as_str(), format!("unknown device {device:?}")))
                    .await;
            }
            Route::Direct(target) => match target.execute(&msg.action, &msg.body).await {
                Ok(Some(reply)) => self.notify(reply).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        device = %device,
                        "Unable to complete action {}: {}",
                        msg.action,
                        e
                    );
                    self.notify(Message::error(device.as_str(), e.to_string())).await;
                }
            },
            Route::Job(queue) => {
                if queue.send(JobMessage::Client(msg)).await.is_err() {
                    tracing::warn!(device = %device, "Job ended before the message was delivered");
                }
            }
            Route::Start(start) => {
                // Runs on its own; the handle is not needed here.
                let _ = job::spawn(start, self.jobs.clone());
            }
            Route::Attached => {
                tracing::info!(device = %device, "Program attached ({} bytes)", msg.body.len());
                self.notify(Message::response(device.as_str(), message::UPLOAD, "ok")).await;
            }
            Route::NoProgram => {
                tracing::error!(device = %device, "Job requested without a program");
                self.notify(Message::error(device.as_str(), "no program attached")).await;
            }
        }
        Ok(())
    }

    async fn notify(&self, msg: Message) {
        if self.device_in.send(msg).await.is_err() {
            tracing::warn!("Device-in queue closed");
        }
    }
}
