//! Listening sockets and accept loops.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::error::ServerError;
use crate::router::serve_connection;
use crate::server::Server;

/// One configured listen address: `tcp:HOST:PORT` or `unix:PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("tcp", addr)) if is_host_port(addr) => Ok(Self::Tcp(addr.to_string())),
            Some(("unix", path)) if !path.is_empty() => Ok(Self::Unix(PathBuf::from(path))),
            _ => Err(ServerError::InvalidAddress(s.to_string())),
        }
    }
}

fn is_host_port(addr: &str) -> bool {
    addr.rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

enum Bound {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

/// Every bound listener plus the sessions they spawned.
pub struct Listeners {
    tracker: TaskTracker,
    local_addrs: Vec<String>,
}

impl Listeners {
    /// Addresses actually bound, resolved (`tcp:` ports filled in).
    pub fn local_addrs(&self) -> &[String] {
        &self.local_addrs
    }

    /// Wait for accept loops and sessions to finish after the server's
    /// cancel token fires.
    pub async fn wait(self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Bind every address and start accepting.
///
/// An address that fails to bind is logged and skipped; startup fails only
/// if none could be bound.
pub async fn bind_all(server: Arc<Server>, addrs: &[ListenAddr]) -> Result<Listeners, ServerError> {
    let tracker = TaskTracker::new();
    let mut local_addrs = Vec::new();

    for addr in addrs {
        match bind(addr).await {
            Ok(bound) => {
                let local = describe(&bound);
                info!("Listening on {}", local);
                local_addrs.push(local);
                tracker.spawn(accept_loop(server.clone(), bound, tracker.clone()));
            }
            Err(e) => error!("{}", e),
        }
    }

    if local_addrs.is_empty() {
        return Err(ServerError::NoListeners);
    }
    Ok(Listeners {
        tracker,
        local_addrs,
    })
}

async fn bind(addr: &ListenAddr) -> Result<Bound, ServerError> {
    let bind_error = |source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };
    match addr {
        ListenAddr::Tcp(host_port) => TcpListener::bind(host_port.as_str())
            .await
            .map(Bound::Tcp)
            .map_err(bind_error),
        #[cfg(unix)]
        ListenAddr::Unix(path) => {
            remove_stale_socket(path).map_err(bind_error)?;
            UnixListener::bind(path)
                .map(|l| Bound::Unix(l, path.clone()))
                .map_err(bind_error)
        }
        #[cfg(not(unix))]
        ListenAddr::Unix(_) => Err(bind_error(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "local sockets are not available on this platform",
        ))),
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn describe(bound: &Bound) -> String {
    match bound {
        Bound::Tcp(l) => match l.local_addr() {
            Ok(a) => format!("tcp:{a}"),
            Err(_) => "tcp:?".to_string(),
        },
        #[cfg(unix)]
        Bound::Unix(_, path) => format!("unix:{}", path.display()),
    }
}

async fn accept_loop(server: Arc<Server>, bound: Bound, tracker: TaskTracker) {
    let cancel = server.cancel_token();
    match bound {
        Bound::Tcp(listener) => loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tracker.spawn(serve_connection(server.clone(), stream, peer.to_string()));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        },
        #[cfg(unix)]
        Bound::Unix(listener, path) => {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let peer = format!("unix:{}", path.display());
                            tracker.spawn(serve_connection(server.clone(), stream, peer));
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    },
                }
            }
            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "Failed to remove socket file: {}", e);
            }
        }
    }
    info!("Accept loop stopped");
}
