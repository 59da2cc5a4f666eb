//! The envelope passed on every queue, plus its JSON wire form.
//!
//! ```json
//! { "Type": "core", "Action": "dc", "Device": "", "Body": "" }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discover request from the UI, answered by the switchboard.
pub const DISCOVER: &str = "dc";
/// Attach / detach notification produced by discovery.
pub const INFORM: &str = "inform";
/// Raw G-code command.
pub const CMD: &str = "cmd";
/// Start a print job.
pub const JOB: &str = "job";
/// Attach a G-code program to a device without starting it.
pub const UPLOAD: &str = "upload";
pub const PAUSE: &str = "pause";
pub const RESUME: &str = "resume";
/// Legacy spelling of [`RESUME`].
pub const CONTINUE: &str = "continue";
pub const STOP: &str = "stop";
/// Sent by a job producer to end its consumer.
pub const COMPLETION: &str = "completion";
/// Failure report for the client.
pub const ERROR: &str = "error";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Origin / target class of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Handled by the core itself.
    Core,
    /// Addressed to a device.
    Device,
    /// Produced by a device or job, addressed to the client.
    Response,
    /// Internal traffic on a job queue.
    Job,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Type")]
    pub kind: Kind,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Device", default)]
    pub device: String,
    #[serde(rename = "Body", default)]
    pub body: String,
}

impl Message {
    pub fn new(
        kind: Kind,
        action: impl Into<String>,
        device: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            action: action.into(),
            device: device.into(),
            body: body.into(),
        }
    }

    /// A `response` message tagged with `device`.
    pub fn response(
        device: impl Into<String>,
        action: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(Kind::Response, action, device, body)
    }

    /// A `response/error` message for the client.
    pub fn error(device: impl Into<String>, body: impl Into<String>) -> Self {
        Self::response(device, ERROR, body)
    }

    /// A `core/inform` discovery notification.
    pub fn inform(device: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Kind::Core, INFORM, device, body)
    }

    pub fn is(&self, kind: Kind, action: &str) -> bool {
        self.kind == kind && self.action == action
    }

    pub fn to_wire(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}
