//! Wires the queues and actors together.
//!
//! ```text
//! UI -> client-in -> Switchboard -> device-out -> DeviceController -> device | job queue
//!                                                                          |
//! UI <- client-out <- Switchboard <- device-in <------------------------------
//! ```
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::controller::DeviceController;
use crate::device::DeviceProvider;
use crate::job::JobContext;
use crate::message::Message;
use crate::registry::{Registry, RegistryHandle};
use crate::switchboard::Switchboard;

/// The client-facing ends of the core queues.
pub struct ClientQueues {
    pub inbound: mpsc::Sender<Message>,
    pub outbound: mpsc::Receiver<Message>,
}

pub struct Daemon {
    registry: RegistryHandle,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn start(config: &Config, provider: Arc<dyn DeviceProvider>) -> (Self, ClientQueues) {
        let capacity = config.channels.capacity.max(1);
        let (client_in_tx, client_in_rx) = mpsc::channel(capacity);
        let (client_out_tx, client_out_rx) = mpsc::channel(capacity);
        let (device_in_tx, device_in_rx) = mpsc::channel(capacity);
        let (device_out_tx, device_out_rx) = mpsc::channel(capacity);

        let registry = Registry::new(config.job.queue_capacity).spawn();
        let shutdown = CancellationToken::new();

        let jobs = JobContext {
            registry: registry.clone(),
            device_in: device_in_tx.clone(),
            config: config.job.clone(),
        };
        let controller = DeviceController::new(
            registry.clone(),
            provider,
            device_in_tx,
            jobs,
            config.discovery.clone(),
        );

        let mut tasks = Vec::with_capacity(4);
        tasks.extend(Switchboard::new(registry.clone()).spawn(
            client_in_rx,
            client_out_tx,
            device_in_rx,
            device_out_tx,
        ));
        tasks.extend(controller.spawn(device_out_rx, shutdown.clone()));
        tracing::info!("Core started");

        let daemon = Self { registry, shutdown, tasks };
        (daemon, ClientQueues { inbound: client_in_tx, outbound: client_out_rx })
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub async fn shutdown(self) {
        tracing::info!("Shutting down core");
        self.shutdown.cancel();
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
    }
}
