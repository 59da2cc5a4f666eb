//! Message routing between the client side and the device side.
//!
//! Two independent loops: client-in → (core handling | device-out), and
//! device-in → client-out. Only the switchboard interprets `core` messages
//! coming from the client.
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;

use crate::message::{self, Kind, Message};
use crate::registry::RegistryHandle;

pub struct Switchboard {
    registry: RegistryHandle,
}

impl Switchboard {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    /// Spawns both routing loops. Each ends when its input queue closes or
    /// its output queue's receiver is dropped.
    pub fn spawn(
        self,
        client_in: Receiver<Message>,
        client_out: Sender<Message>,
        device_in: Receiver<Message>,
        device_out: Sender<Message>,
    ) -> [JoinHandle<()>; 2] {
        let client = tokio::spawn(route_client(
            self.registry,
            client_in,
            client_out.clone(),
            device_out,
        ));
        let device = tokio::spawn(route_device(device_in, client_out));
        [client, device]
    }
}

async fn route_client(
    registry: RegistryHandle,
    mut client_in: Receiver<Message>,
    client_out: Sender<Message>,
    device_out: Sender<Message>,
) {
    while let Some(msg) = client_in.recv().await {
        let delivered = if msg.kind == Kind::Core {
            match handle_core(&registry, &msg).await {
                Some(reply) => client_out.send(reply).await.is_ok(),
                None => true,
            }
        } else {
            device_out.send(msg).await.is_ok()
        };
        if !delivered {
            tracing::warn!("Switchboard output closed, stopping client routing");
            break;
        }
    }
    tracing::debug!("Client routing loop finished");
}

/// Resolves a client `core` request. `dc` answers with the first registered
/// device; with none registered there is no reply.
async fn handle_core(registry: &RegistryHandle, msg: &Message) -> Option<Message> {
    match msg.action.as_str() {
        message::DISCOVER => match registry.first().await {
            Ok(Some((name, greeting))) => {
                Some(Message::response(name, message::DISCOVER, greeting))
            }
            Ok(None) => {
                tracing::debug!("Discover requested with no device attached");
                None
            }
            Err(e) => {
                tracing::error!("Discover failed: {}", e);
                None
            }
        },
        other => {
            tracing::debug!("Unhandled core action {:?}", other);
            None
        }
    }
}

async fn route_device(mut device_in: Receiver<Message>, client_out: Sender<Message>) {
    while let Some(msg) = device_in.recv().await {
        if msg.is(Kind::Core, message::INFORM) {
            tracing::debug!(device = %msg.device, "Device {}", msg.body);
        }
        if client_out.send(msg).await.is_err() {
            tracing::warn!("Client-out queue closed, stopping device routing");
            break;
        }
    }
    tracing::debug!("Device routing loop finished");
}
