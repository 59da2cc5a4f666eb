//! Serial-port transport for G-code firmware (Marlin style `ok` handshake).
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serial2_tokio::SerialPort;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout, timeout_at};

use super::{Device, DeviceError, DeviceProvider};
use crate::config::DiscoveryConfig;
use crate::gcode;

/// Port plus the receive state that must stay in step with it.
struct Link {
    port: SerialPort,
    /// Bytes received past the last complete reply.
    pending: Vec<u8>,
    /// Commands written whose reply has not been read yet.
    owed: usize,
}

/// A printer on an open serial port.
///
/// One command is in flight at a time; `send_raw` holds the link lock until
/// the firmware acknowledges. A command abandoned on timeout or cancellation
/// still owes a reply, and that late reply is discarded rather than handed
/// to the next command.
pub struct SerialDevice {
    name: String,
    greeting: String,
    link: Mutex<Link>,
    command_timeout: Duration,
    heatup_timeout: Duration,
}

impl SerialDevice {
    pub async fn open(name: &str, config: &DiscoveryConfig) -> Result<Self, DeviceError> {
        tracing::info!(device = %name, baud = config.baud, "Opening serial device");
        let port = SerialPort::open(name, config.baud)?;
        let greeting = read_banner(&port, config.greeting_timeout()).await?;
        tracing::debug!(device = %name, "Greeting: {}", greeting);
        Ok(Self {
            name: name.to_string(),
            greeting,
            link: Mutex::new(Link { port, pending: Vec::new(), owed: 0 }),
            command_timeout: config.command_timeout(),
            heatup_timeout: config.heatup_timeout(),
        })
    }

    fn reply_window(&self, command: &str) -> Duration {
        if gcode::temperature_wait(command).is_some() {
            self.heatup_timeout
        } else {
            self.command_timeout
        }
    }
}

#[async_trait]
impl Device for SerialDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn greeting(&self) -> &str {
        &self.greeting
    }

    async fn send_raw(&self, command: &str) -> Result<String, DeviceError> {
        let mut link = self.link.lock().await;
        let Link { port, pending, owed } = &mut *link;
        tracing::debug!(device = %self.name, "<- {}", command.trim_end());
        port.write_all(command.as_bytes()).await?;
        *owed += 1;
        let window = self.reply_window(command);
        let reply = match timeout(window, read_reply(port, pending, owed)).await {
            Ok(reply) => reply?,
            Err(_) => {
                tracing::warn!(
                    device = %self.name,
                    "No reply to {} ({} outstanding)",
                    command.trim_end(),
                    owed
                );
                return Err(DeviceError::Timeout);
            }
        };
        tracing::debug!(device = %self.name, "-> {}", reply.trim_end());
        Ok(reply)
    }
}

/// Reads until the terminal line answering the most recent command.
///
/// Terminal lines beyond the last `owed` one belong to commands that were
/// abandoned earlier; they and the lines before them are dropped.
async fn read_reply<R>(
    reader: &mut R,
    pending: &mut Vec<u8>,
    owed: &mut usize,
) -> Result<String, DeviceError>
where
    R: AsyncRead + Unpin,
{
    let mut reply = String::new();
    let mut buf = [0u8; 256];
    loop {
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8(line)?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            reply.push_str(line);
            reply.push('\n');
            if !is_terminal_line(line) {
                continue;
            }
            if *owed > 1 {
                *owed -= 1;
                tracing::debug!("Dropping late reply: {}", reply.trim_end());
                reply.clear();
                continue;
            }
            *owed = 0;
            return Ok(reply);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(DeviceError::Disconnected);
        }
        pending.extend_from_slice(&buf[..n]);
    }
}

fn is_terminal_line(line: &str) -> bool {
    line.starts_with("ok") || line.starts_with("Error") || line.starts_with("!!")
}

/// Collects whatever the firmware prints after the port opens (most boards
/// reset on open and print a banner).
async fn read_banner(port: &SerialPort, window: Duration) -> Result<String, DeviceError> {
    let deadline = Instant::now() + window;
    let mut banner = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match timeout_at(deadline, port.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => banner.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(String::from_utf8_lossy(&banner).trim().to_string())
}

/// Discovers serial printers by matching port names against
/// [`DiscoveryConfig::port_patterns`].
pub struct SerialProvider {
    config: DiscoveryConfig,
}

impl SerialProvider {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    fn matches(&self, port: &str) -> bool {
        self.config.port_patterns.iter().any(|p| port.contains(p.as_str()))
    }
}

#[async_trait]
impl DeviceProvider for SerialProvider {
    async fn attached(&self) -> Result<BTreeSet<String>, DeviceError> {
        let ports = SerialPort::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| self.matches(p))
            .collect())
    }

    async fn connect(&self, name: &str) -> Result<Arc<dyn Device>, DeviceError> {
        Ok(Arc::new(SerialDevice::open(name, &self.config).await?))
    }
}
