// Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use printcore::config::JobConfig;
use printcore::device::{Device, DeviceError};
use printcore::job::JobContext;
use printcore::message::Message;
use printcore::registry::{Registry, RegistryHandle};
use tokio::sync::mpsc;

/// A device that records every command and answers `M105` from a script.
pub struct ScriptedDevice {
    name: String,
    sent: Mutex<Vec<String>>,
    reports: Mutex<VecDeque<String>>,
    /// Reply once the script runs out.
    idle_report: String,
    /// Commands starting with this fail with a timeout.
    failing: Option<String>,
    /// Time each command takes to answer.
    delay: Duration,
}

impl ScriptedDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
            reports: Mutex::new(VecDeque::new()),
            idle_report: "ok T:20.0 /0.0 B:20.0 /0.0 @:0 B@:0\n".to_string(),
            failing: None,
            delay: Duration::ZERO,
        }
    }

    pub fn with_reports(self, reports: &[&str]) -> Self {
        *self.reports.lock().unwrap() = reports.iter().map(|r| format!("{r}\n")).collect();
        self
    }

    pub fn failing_on(mut self, prefix: &str) -> Self {
        self.failing = Some(prefix.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.sent().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl Device for ScriptedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn greeting(&self) -> &str {
        "start\nok"
    }

    async fn send_raw(&self, command: &str) -> Result<String, DeviceError> {
        self.sent.lock().unwrap().push(command.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.as_deref().is_some_and(|p| command.starts_with(p)) {
            return Err(DeviceError::Timeout);
        }
        if command.starts_with("M105") {
            let next = self.reports.lock().unwrap().pop_front();
            return Ok(next.unwrap_or_else(|| self.idle_report.clone()));
        }
        Ok("ok\n".to_string())
    }
}

pub fn job_config() -> JobConfig {
    JobConfig { temp_wait_timeout_secs: 600, ..JobConfig::default() }
}

/// A running registry holding `device`, plus a job context writing to the
/// returned device-in receiver.
pub async fn job_fixture(
    device: Arc<ScriptedDevice>,
    config: JobConfig,
) -> (RegistryHandle, JobContext, mpsc::Receiver<Message>) {
    let registry = Registry::new(config.queue_capacity).spawn();
    registry.insert(device).await.unwrap();
    let (device_in, rx) = mpsc::channel(256);
    let ctx = JobContext { registry: registry.clone(), device_in, config };
    (registry, ctx, rx)
}

/// Everything currently buffered on `rx`.
pub fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

/// Receives until `pred` matches, failing after `limit` of (virtual) time.
pub async fn recv_until(
    rx: &mut mpsc::Receiver<Message>,
    limit: Duration,
    pred: impl Fn(&Message) -> bool,
) -> Vec<Message> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(limit, async {
        while let Some(msg) = rx.recv().await {
            let done = pred(&msg);
            seen.push(msg);
            if done {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met, saw {seen:?}");
    seen
}
