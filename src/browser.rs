//! Opening the UI in the desktop's default browser once the server answers.
use std::net::SocketAddr;
use std::process::Command;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;

const READY_TRIES: u32 = 20;
const READY_BACKOFF: Duration = Duration::from_millis(100);

/// The platform's "open this URL" command and its leading arguments.
pub fn opener() -> (&'static str, &'static [&'static str]) {
    if cfg!(target_os = "macos") {
        ("open", &[])
    } else if cfg!(target_os = "windows") {
        ("cmd", &["/c", "start"])
    } else {
        ("xdg-open", &[])
    }
}

/// Probes `addr` up to `tries` times. True once a connection is accepted.
pub async fn wait_until_ready(addr: SocketAddr, tries: u32) -> bool {
    for _ in 0..tries {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        sleep(READY_BACKOFF).await;
    }
    false
}

/// Spawns the platform opener for `url` without waiting for it.
pub fn launch(url: &str) -> std::io::Result<()> {
    let (program, args) = opener();
    Command::new(program).args(args).arg(url).spawn()?;
    Ok(())
}

/// Waits for the listener at `addr`, then opens `url`.
pub async fn open_when_ready(addr: SocketAddr, url: String) {
    if !wait_until_ready(addr, READY_TRIES).await {
        tracing::warn!("Unable to open your browser. Please open and visit {}", url);
        return;
    }
    match launch(&url) {
        Ok(()) => tracing::info!("A browser window should open. If not, please visit {}", url),
        Err(e) => {
            tracing::warn!("Unable to open your browser ({}). Please open and visit {}", e, url)
        }
    }
}
