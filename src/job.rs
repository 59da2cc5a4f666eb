//! The job runner: streams a G-code program to one device.
//!
//! Two tasks cooperate per job. The producer walks the program, feeding
//! commands into the job queue and handling heat-up waits itself. The
//! consumer drains the job queue, executing commands and applying
//! `pause` / `resume` / `stop` requests redirected from the dispatch loop.
//! The device is released only after the consumer has exited.
//!
//! ```text
//! Streaming -> WaitingForTemp -> Streaming -> Paused -> Streaming -> Completed
//!      \______________________________________________\-> Stopped | Failed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::JobConfig;
use crate::device::Device;
use crate::gcode::{self, Sensor, WaitTarget};
use crate::message::{self, Message};
use crate::registry::{JobStart, RegistryHandle};

/// Body of the job message sent when the program is exhausted.
pub const COMPLETED: &str = "completed";
pub const STOPPED: &str = "stopped";
pub const FAILED: &str = "failed";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job stopped")]
    Stopped,
    #[error("{sensor} did not reach {target:?} within the wait timeout")]
    TemperatureTimeout { sensor: Sensor, target: Option<f64> },
    #[error("job queue closed")]
    QueueClosed,
}

/// What travels on a job queue.
#[derive(Debug)]
pub enum JobMessage {
    /// A program line queued by the producer.
    Line(String),
    /// A client message redirected by the dispatch loop.
    Client(Message),
    /// The producer has queued its last line.
    Completion,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobPhase {
    Streaming,
    WaitingForTemp(WaitTarget),
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Stopped | JobPhase::Failed)
    }
}

/// State shared by the producer and consumer of one job.
pub struct JobState {
    paused: watch::Sender<bool>,
    phase: watch::Sender<JobPhase>,
    line: AtomicUsize,
    /// Producer commands the consumer has finished executing.
    acked: watch::Sender<usize>,
}

impl JobState {
    pub(crate) fn new() -> Self {
        Self {
            paused: watch::Sender::new(false),
            phase: watch::Sender::new(JobPhase::Streaming),
            line: AtomicUsize::new(0),
            acked: watch::Sender::new(0),
        }
    }

    pub fn paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn phase(&self) -> JobPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<JobPhase> {
        self.phase.subscribe()
    }

    /// Index of the program line the producer is on.
    pub fn line(&self) -> usize {
        self.line.load(Ordering::Relaxed)
    }
}

/// Collaborators every job needs.
#[derive(Clone)]
pub struct JobContext {
    pub registry: RegistryHandle,
    pub device_in: mpsc::Sender<Message>,
    pub config: JobConfig,
}

pub struct JobHandle {
    pub id: Uuid,
    pub state: Arc<JobState>,
    pub task: JoinHandle<JobPhase>,
}

/// Starts the producer and consumer for `start` and returns immediately.
pub fn spawn(start: JobStart, ctx: JobContext) -> JobHandle {
    let JobStart { id, device, program, state, queue, inbox, cancel } = start;
    tracing::info!(job = %id, device = %device.name(), "Starting job");

    let consumer = Consumer {
        id,
        device: device.clone(),
        state: state.clone(),
        inbox,
        cancel: cancel.clone(),
        device_in: ctx.device_in.clone(),
    };
    let consumer = tokio::spawn(consumer.run());

    let producer = Producer {
        id,
        device,
        state: state.clone(),
        queue,
        cancel,
        sent: 0,
        ctx,
    };
    let task = tokio::spawn(async move { producer.run(&program, consumer).await });
    JobHandle { id, state, task }
}

fn timed_out(wait: WaitTarget) -> JobError {
    JobError::TemperatureTimeout { sensor: wait.sensor, target: wait.target }
}

struct Producer {
    id: Uuid,
    device: Arc<dyn Device>,
    state: Arc<JobState>,
    queue: mpsc::Sender<JobMessage>,
    cancel: CancellationToken,
    /// Lines this producer has queued.
    sent: usize,
    ctx: JobContext,
}

impl Producer {
    async fn run(mut self, program: &str, consumer: JoinHandle<()>) -> JobPhase {
        let mut result = self.stream(program).await;
        if result.is_ok() {
            result = self.close_queue().await;
        } else {
            self.cancel.cancel();
        }
        if let Err(e) = consumer.await {
            tracing::error!(job = %self.id, "Job consumer panicked: {}", e);
        }
        if result.is_ok() && self.cancel.is_cancelled() {
            result = Err(JobError::Stopped);
        }

        let name = self.device.name().to_string();
        match self.ctx.registry.finish_job(&name, self.id).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(job = %self.id, "Job already released"),
            Err(e) => tracing::error!(job = %self.id, "Unable to release device: {}", e),
        }

        let phase = match result {
            Ok(()) => {
                tracing::info!(job = %self.id, device = %name, "Job completed");
                self.report(COMPLETED).await;
                JobPhase::Completed
            }
            Err(JobError::Stopped) | Err(JobError::QueueClosed) => {
                tracing::info!(job = %self.id, device = %name, "Job stopped");
                self.report(STOPPED).await;
                JobPhase::Stopped
            }
            Err(e) => {
                tracing::error!(job = %self.id, device = %name, "Job failed: {}", e);
                self.send_client(Message::error(name.as_str(), e.to_string())).await;
                self.report(FAILED).await;
                JobPhase::Failed
            }
        };
        self.state.phase.send_replace(phase);
        phase
    }

    /// Queues the completion marker behind every line; the consumer exits
    /// once it reaches it.
    async fn close_queue(&self) -> Result<(), JobError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(JobError::Stopped),
            sent = self.queue.send(JobMessage::Completion) => {
                sent.map_err(|_| JobError::QueueClosed)
            }
        }
    }

    async fn stream(&mut self, program: &str) -> Result<(), JobError> {
        let status_every = self.ctx.config.status_every.max(1);
        let mut lines_sent = 0usize;
        for (idx, line) in program.lines().enumerate() {
            self.state.line.store(idx, Ordering::Relaxed);
            let Some(cmd) = gcode::normalize(line) else {
                continue;
            };

            if let Some(wait) = gcode::temperature_wait(&cmd) {
                self.drain().await?;
                let deadline = Instant::now() + self.ctx.config.temp_wait_timeout();
                self.state.phase.send_replace(JobPhase::WaitingForTemp(wait));
                self.prime(&cmd, wait, deadline).await?;
                self.wait_for_temperature(wait, deadline).await?;
                self.state.phase.send_replace(JobPhase::Streaming);
                continue;
            }

            self.wait_while_paused().await?;
            self.enqueue(cmd).await?;
            lines_sent += 1;
            if lines_sent % status_every == 0 {
                self.enqueue(gcode::status_query()).await?;
            }
        }
        self.state.line.store(program.lines().count(), Ordering::Relaxed);
        Ok(())
    }

    async fn enqueue(&mut self, cmd: String) -> Result<(), JobError> {
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Err(JobError::Stopped),
            sent = self.queue.send(JobMessage::Line(cmd)) => sent,
        };
        sent.map_err(|_| JobError::QueueClosed)?;
        self.sent += 1;
        Ok(())
    }

    /// Waits until the consumer has executed everything queued so far, so a
    /// direct command cannot overtake queued ones.
    async fn drain(&self) -> Result<(), JobError> {
        let mut acked = self.state.acked.subscribe();
        let sent = self.sent;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(JobError::Stopped),
            res = async { acked.wait_for(|n| *n >= sent).await.map(|_| ()) } => {
                res.map_err(|_| JobError::QueueClosed)
            }
        }
    }

    /// Sends the heat-up command straight to the device. Firmware that
    /// holds its `ok` until the heater is at temperature keeps this pending
    /// for the whole wait.
    async fn prime(&self, cmd: &str, wait: WaitTarget, deadline: Instant) -> Result<(), JobError> {
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Err(JobError::Stopped),
            _ = sleep_until(deadline) => return Err(timed_out(wait)),
            sent = self.device.send_raw(cmd) => sent,
        };
        if let Err(e) = sent {
            tracing::error!(job = %self.id, "Unable to send {}: {}", cmd.trim_end(), e);
            self.send_client(Message::error(self.device.name(), e.to_string())).await;
        }
        Ok(())
    }

    async fn wait_for_temperature(
        &self,
        wait: WaitTarget,
        deadline: Instant,
    ) -> Result<(), JobError> {
        tracing::info!(job = %self.id, "Waiting for {} to reach {:?}", wait.sensor, wait.target);
        let status = gcode::status_query();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(JobError::Stopped),
                _ = sleep_until(deadline) => return Err(timed_out(wait)),
                _ = sleep(self.ctx.config.temp_poll()) => {}
            }
            let reply = tokio::select! {
                _ = self.cancel.cancelled() => return Err(JobError::Stopped),
                _ = sleep_until(deadline) => return Err(timed_out(wait)),
                reply = self.device.send_raw(&status) => reply,
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(job = %self.id, "Temperature poll failed: {}", e);
                    continue;
                }
            };
            self.send_client(self.device.response(message::JOB, reply.clone())).await;
            match gcode::read_temperature(&reply, wait.sensor) {
                Ok(Some(reading)) if wait.reached(reading) => {
                    tracing::info!(job = %self.id, "{} reached {:.1}", wait.sensor, reading);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(job = %self.id, "{}", e),
            }
        }
    }

    async fn wait_while_paused(&self) -> Result<(), JobError> {
        let mut paused = self.state.paused.subscribe();
        if !*paused.borrow_and_update() {
            return Ok(());
        }
        self.state.phase.send_replace(JobPhase::Paused);
        while *paused.borrow_and_update() {
            tracing::info!(job = %self.id, "Job appears to be paused...");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(JobError::Stopped),
                _ = paused.changed() => {}
                _ = sleep(self.ctx.config.pause_poll()) => {}
            }
        }
        self.state.phase.send_replace(JobPhase::Streaming);
        Ok(())
    }

    async fn report(&self, outcome: &str) {
        self.send_client(self.device.response(message::JOB, outcome.to_string())).await;
    }

    async fn send_client(&self, msg: Message) {
        if self.ctx.device_in.send(msg).await.is_err() {
            tracing::warn!(job = %self.id, "Device-in queue closed");
        }
    }
}

struct Consumer {
    id: Uuid,
    device: Arc<dyn Device>,
    state: Arc<JobState>,
    inbox: mpsc::Receiver<JobMessage>,
    cancel: CancellationToken,
    device_in: mpsc::Sender<Message>,
}

impl Consumer {
    async fn run(mut self) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg {
                JobMessage::Line(cmd) => {
                    tracing::debug!(job = %self.id, "current cmd: {}", cmd.trim_end());
                    self.execute(&cmd).await;
                    self.state.acked.send_modify(|n| *n += 1);
                }
                JobMessage::Client(msg) => {
                    if !self.handle_client(msg).await {
                        break;
                    }
                }
                JobMessage::Completion => break,
            }
        }
        tracing::debug!(job = %self.id, "Job consumer finished");
    }

    /// Applies one redirected client message. False once the job is stopped.
    async fn handle_client(&self, msg: Message) -> bool {
        match msg.action.as_str() {
            message::CMD => self.execute(&msg.body).await,
            message::PAUSE => {
                tracing::info!(job = %self.id, "Pausing job");
                self.state.paused.send_replace(true);
            }
            message::RESUME | message::CONTINUE => {
                tracing::info!(job = %self.id, "Resuming job");
                self.state.paused.send_replace(false);
            }
            message::STOP => {
                tracing::info!(job = %self.id, "Stopping job");
                self.cancel.cancel();
                return false;
            }
            message::JOB => {
                let name = self.device.name();
                tracing::warn!(job = %self.id, "A job is already running on {}", name);
                self.send(Message::error(name, "a job is already running")).await;
            }
            other => tracing::debug!(job = %self.id, "Ignoring {} during job", other),
        }
        true
    }

    async fn execute(&self, body: &str) {
        let Some(cmd) = gcode::normalize(body) else {
            return;
        };
        match self.device.send_raw(&cmd).await {
            Ok(reply) => self.send(self.device.response(message::JOB, reply)).await,
            Err(e) => {
                tracing::error!(job = %self.id, "Unable to run {}: {}", cmd.trim_end(), e);
                self.send(Message::error(self.device.name(), e.to_string())).await;
            }
        }
    }

    async fn send(&self, msg: Message) {
        if self.device_in.send(msg).await.is_err() {
            tracing::warn!(job = %self.id, "Device-in queue closed");
        }
    }
}
