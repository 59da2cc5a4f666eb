//! The Device Registry.
//!
//! A single task owns every device record. Discovery, dispatch and the job
//! runners reach it through a cloneable [`RegistryHandle`]; each request is
//! answered on a oneshot channel, so every read-modify-write (in particular
//! the "is a job running? then start one" check) happens atomically inside
//! the owning task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::Device;
use crate::job::{JobMessage, JobPhase, JobState};
use crate::message::{self, Message};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device registry is no longer running")]
    Closed,
}

/// Point-in-time view of one registered device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub greeting: String,
    pub job_running: bool,
    pub program: Option<String>,
    /// Phase of the running job.
    pub phase: Option<JobPhase>,
    /// Program line the running job is on.
    pub line: Option<usize>,
}

/// Ids that appeared and disappeared between two discovery snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryDiff {
    pub attached: Vec<String>,
    pub detached: Vec<String>,
}

impl DiscoveryDiff {
    pub fn between(known: &BTreeSet<String>, current: &BTreeSet<String>) -> Self {
        Self {
            attached: current.difference(known).cloned().collect(),
            detached: known.difference(current).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

/// Everything a new job runner needs, handed out when a `job` message claims
/// an idle device.
pub struct JobStart {
    pub id: Uuid,
    pub device: Arc<dyn Device>,
    pub program: String,
    pub state: Arc<JobState>,
    /// Sender side of the job queue; the dispatch loop holds a clone.
    pub queue: mpsc::Sender<JobMessage>,
    pub inbox: mpsc::Receiver<JobMessage>,
    /// Cancelled on `stop` or when the device detaches.
    pub cancel: CancellationToken,
}

/// Where the dispatch loop should deliver a device-bound message.
pub enum Route {
    /// No such device.
    Unknown,
    /// Idle device: call it directly.
    Direct(Arc<dyn Device>),
    /// A job owns the device: forward to its queue.
    Job(mpsc::Sender<JobMessage>),
    /// The message claimed the device for a new job.
    Start(JobStart),
    /// The program was attached to the device.
    Attached,
    /// A `job` arrived but there is nothing to print.
    NoProgram,
}

struct JobSlot {
    id: Uuid,
    state: Arc<JobState>,
    queue: mpsc::Sender<JobMessage>,
    cancel: CancellationToken,
}

struct Entry {
    device: Arc<dyn Device>,
    program: Option<String>,
    job: Option<JobSlot>,
}

/// The map itself. Only the owning task touches it.
pub struct Registry {
    devices: BTreeMap<String, Entry>,
    job_queue_capacity: usize,
}

impl Registry {
    pub fn new(job_queue_capacity: usize) -> Self {
        Self { devices: BTreeMap::new(), job_queue_capacity: job_queue_capacity.max(1) }
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn insert(&mut self, device: Arc<dyn Device>) {
        let name = device.name().to_string();
        self.devices.insert(name, Entry { device, program: None, job: None });
    }

    /// Drops `name`, cancelling its job if one is running.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.devices.remove(name) {
            Some(entry) => {
                if let Some(job) = entry.job {
                    job.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Id and greeting of the first device in id order.
    pub fn first(&self) -> Option<(String, String)> {
        self.devices
            .iter()
            .next()
            .map(|(name, entry)| (name.clone(), entry.device.greeting().to_string()))
    }

    pub fn resolve(&mut self, msg: &Message) -> Route {
        let Some(entry) = self.devices.get_mut(&msg.device) else {
            return Route::Unknown;
        };
        if let Some(job) = &entry.job {
            return Route::Job(job.queue.clone());
        }
        match msg.action.as_str() {
            message::UPLOAD => {
                entry.program = Some(msg.body.clone());
                Route::Attached
            }
            message::JOB => {
                if !msg.body.trim().is_empty() {
                    entry.program = Some(msg.body.clone());
                }
                let Some(program) = entry.program.clone() else {
                    return Route::NoProgram;
                };
                let (queue, inbox) = mpsc::channel(self.job_queue_capacity);
                let id = Uuid::new_v4();
                let cancel = CancellationToken::new();
                let state = Arc::new(JobState::new());
                entry.job = Some(JobSlot {
                    id,
                    state: state.clone(),
                    queue: queue.clone(),
                    cancel: cancel.clone(),
                });
                Route::Start(JobStart {
                    id,
                    device: entry.device.clone(),
                    program,
                    state,
                    queue,
                    inbox,
                    cancel,
                })
            }
            _ => Route::Direct(entry.device.clone()),
        }
    }

    /// Marks job `id` on `name` finished. True only for the first call.
    pub fn finish_job(&mut self, name: &str, id: Uuid) -> bool {
        match self.devices.get_mut(name) {
            Some(entry) if entry.job.as_ref().is_some_and(|j| j.id == id) => {
                entry.job = None;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .map(|(name, entry)| DeviceInfo {
                name: name.clone(),
                greeting: entry.device.greeting().to_string(),
                job_running: entry.job.is_some(),
                program: entry.program.clone(),
                phase: entry.job.as_ref().map(|j| j.state.phase()),
                line: entry.job.as_ref().map(|j| j.state.line()),
            })
            .collect()
    }

    /// Spawns the owning task and returns its handle.
    pub fn spawn(self) -> RegistryHandle {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(self.run(rx));
        RegistryHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RegistryRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                RegistryRequest::Names { respond_to } => {
                    let _ = respond_to.send(self.names());
                }
                RegistryRequest::Insert { device, respond_to } => {
                    self.insert(device);
                    let _ = respond_to.send(());
                }
                RegistryRequest::Remove { name, respond_to } => {
                    let _ = respond_to.send(self.remove(&name));
                }
                RegistryRequest::First { respond_to } => {
                    let _ = respond_to.send(self.first());
                }
                RegistryRequest::Resolve { message, respond_to } => {
                    let _ = respond_to.send(self.resolve(&message));
                }
                RegistryRequest::FinishJob { name, id, respond_to } => {
                    let _ = respond_to.send(self.finish_job(&name, id));
                }
                RegistryRequest::Snapshot { respond_to } => {
                    let _ = respond_to.send(self.snapshot());
                }
            }
        }
        tracing::debug!("Device registry shutting down");
    }
}

enum RegistryRequest {
    Names { respond_to: oneshot::Sender<BTreeSet<String>> },
    Insert { device: Arc<dyn Device>, respond_to: oneshot::Sender<()> },
    Remove { name: String, respond_to: oneshot::Sender<bool> },
    First { respond_to: oneshot::Sender<Option<(String, String)>> },
    Resolve { message: Message, respond_to: oneshot::Sender<Route> },
    FinishJob { name: String, id: Uuid, respond_to: oneshot::Sender<bool> },
    Snapshot { respond_to: oneshot::Sender<Vec<DeviceInfo>> },
}

/// Cloneable client of the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryRequest>,
}

impl RegistryHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryRequest,
    ) -> Result<T, RegistryError> {
        let (respond_to, response) = oneshot::channel();
        self.tx.send(build(respond_to)).await.map_err(|_| RegistryError::Closed)?;
        response.await.map_err(|_| RegistryError::Closed)
    }

    pub async fn names(&self) -> Result<BTreeSet<String>, RegistryError> {
        self.request(|respond_to| RegistryRequest::Names { respond_to }).await
    }

    pub async fn insert(&self, device: Arc<dyn Device>) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryRequest::Insert { device, respond_to }).await
    }

    pub async fn remove(&self, name: &str) -> Result<bool, RegistryError> {
        let name = name.to_string();
        self.request(|respond_to| RegistryRequest::Remove { name, respond_to }).await
    }

    pub async fn first(&self) -> Result<Option<(String, String)>, RegistryError> {
        self.request(|respond_to| RegistryRequest::First { respond_to }).await
    }

    pub async fn resolve(&self, message: Message) -> Result<Route, RegistryError> {
        self.request(|respond_to| RegistryRequest::Resolve { message, respond_to }).await
    }

    pub async fn finish_job(&self, name: &str, id: Uuid) -> Result<bool, RegistryError> {
        let name = name.to_string();
        self.request(|respond_to| RegistryRequest::FinishJob { name, id, respond_to }).await
    }

    pub async fn snapshot(&self) -> Result<Vec<DeviceInfo>, RegistryError> {
        self.request(|respond_to| RegistryRequest::Snapshot { respond_to }).await
    }
}
