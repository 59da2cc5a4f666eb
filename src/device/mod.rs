//! The device capability consumed by the controller and job runner.
//!
//! Transports implement [`Device`] for one open command channel and
//! [`DeviceProvider`] for enumerating and opening devices.

pub mod serial;
pub mod sim;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{self, Message};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Serial port error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timeout waiting for response")]
    Timeout,
    #[error("Device {0} is not connected")]
    NotConnected(String),
    #[error("Device disconnected")]
    Disconnected,
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// One attached device with an open command channel.
///
/// Implementations serialize access to the channel internally; the job
/// consumer and the temperature wait both talk to the device concurrently.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable identifier, e.g. the port name.
    fn name(&self) -> &str;

    /// Banner captured when the device was opened.
    fn greeting(&self) -> &str;

    /// Sends one command line and returns the device's reply.
    async fn send_raw(&self, command: &str) -> Result<String, DeviceError>;

    /// Runs a client action against the device.
    ///
    /// The default understands `cmd` (body is a raw command). Anything else
    /// is [`DeviceError::UnsupportedAction`].
    async fn execute(&self, action: &str, body: &str) -> Result<Option<Message>, DeviceError> {
        match action {
            message::CMD => {
                let command = crate::gcode::normalize(body)
                    .ok_or_else(|| DeviceError::UnsupportedAction("empty command".to_string()))?;
                let reply = self.send_raw(&command).await?;
                Ok(Some(self.response(action, reply)))
            }
            other => Err(DeviceError::UnsupportedAction(other.to_string())),
        }
    }

    /// Response envelope tagged with this device.
    fn response(&self, action: &str, body: String) -> Message {
        Message::response(self.name(), action, body)
    }
}

/// Enumerates attached devices and opens them.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Identifiers of every currently attached device.
    async fn attached(&self) -> Result<BTreeSet<String>, DeviceError>;

    /// Opens `name` and performs the connect handshake.
    async fn connect(&self, name: &str) -> Result<Arc<dyn Device>, DeviceError>;
}
