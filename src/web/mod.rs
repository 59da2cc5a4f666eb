//! HTTP surface: UI assets, the index page and the `/abs` client socket.
//! This file declares the other files in this directory as sub-modules.

pub mod api;
pub mod session;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::message::Message;

/// Shared by every handler.
pub struct AppStateInner {
    pub client_in: mpsc::Sender<Message>,
    /// Every UI session subscribes here.
    pub outbound: broadcast::Sender<Message>,
    pub ui_dir: PathBuf,
    pub listen: String,
}
pub type AppState = Arc<AppStateInner>;

/// Relays the core's client-out queue to every connected session.
pub async fn fanout(mut client_out: mpsc::Receiver<Message>, outbound: broadcast::Sender<Message>) {
    while let Some(msg) = client_out.recv().await {
        if outbound.send(msg).is_err() {
            tracing::debug!("No UI session connected, message dropped");
        }
    }
    tracing::debug!("Client fan-out finished");
}

/// Fails unless `dir` holds an `index.html`.
pub fn check_ui_dir(dir: &Path) -> std::io::Result<()> {
    let index = dir.join(api::INDEX_PAGE);
    if !index.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("UI index page not found at {}", index.display()),
        ));
    }
    Ok(())
}
