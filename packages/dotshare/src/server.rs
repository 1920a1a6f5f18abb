//! Shared server state.
//!
//! One [`Server`] value holds everything that is process-wide: the tty tree
//! with its connection table, the exclusive ownership slot, the parameter
//! registry and the device snapshot. Every component gets it by `Arc`.
//!
//! Lock order, outermost first. Never take them in reverse and never hold
//! two siblings at once:
//!
//! 1. `params`
//! 2. `sessions` (tree + connection table)
//! 3. `ownership`
//! 4. one connection's key filter *or* its window *or* its subscriptions
//! 5. `device`, then `rendered`
//!
//! None of these are ever held across an `.await`; calls into the core go
//! through the [`DriverGateway`] after every guard is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use dot_driver::{DeviceInfo, DriverGateway, Geometry};
use dot_proto::{ErrorCode, Response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::metrics::ServerMetrics;
use crate::ownership::Ownership;
use crate::params::ParamRegistry;
use crate::tty::{ConnId, TtyTree};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The tree and the connections it refers to, under one lock.
#[derive(Debug, Default)]
pub(crate) struct Sessions {
    pub tree: TtyTree,
    pub conns: HashMap<ConnId, Arc<Connection>>,
}

impl Sessions {
    pub fn get(&self, id: ConnId) -> Option<&Arc<Connection>> {
        self.conns.get(&id)
    }
}

pub struct Server {
    config: ServerConfig,
    gateway: DriverGateway,
    authenticator: Arc<dyn Authenticator>,
    pub(crate) params: Mutex<ParamRegistry>,
    pub(crate) sessions: Mutex<Sessions>,
    pub(crate) ownership: Mutex<Ownership>,
    pub(crate) device: RwLock<DeviceInfo>,
    /// Cells most recently sent to the display.
    pub(crate) rendered: Mutex<Vec<u8>>,
    core_active: AtomicBool,
    pub(crate) cursor_dots: AtomicU8,
    pub(crate) cursor_blink_ms: AtomicU32,
    pub(crate) cell_size: AtomicU8,
    unauthenticated: AtomicUsize,
    next_id: AtomicU64,
    pub(crate) started: Instant,
    metrics: ServerMetrics,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        gateway: DriverGateway,
        authenticator: Arc<dyn Authenticator>,
        device: DeviceInfo,
    ) -> Arc<Self> {
        let mut sessions = Sessions::default();
        sessions.tree.set_root_focus(config.root_focus);
        let blink_ms = u32::try_from(config.cursor_blink.as_millis()).unwrap_or(u32::MAX);
        Arc::new(Self {
            cursor_dots: AtomicU8::new(config.cursor_dots),
            cursor_blink_ms: AtomicU32::new(blink_ms),
            cell_size: AtomicU8::new(8),
            config,
            gateway,
            authenticator,
            params: Mutex::new(ParamRegistry::default()),
            sessions: Mutex::new(sessions),
            ownership: Mutex::new(Ownership::Free),
            device: RwLock::new(device),
            rendered: Mutex::new(Vec::new()),
            core_active: AtomicBool::new(false),
            unauthenticated: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            started: Instant::now(),
            metrics: ServerMetrics::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn gateway(&self) -> &DriverGateway {
        &self.gateway
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Token cancelled by [`Server::shutdown`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        info!("Server shutting down");
        self.cancel.cancel();
    }

    pub fn device(&self) -> DeviceInfo {
        read(&self.device).clone()
    }

    pub fn geometry(&self) -> Geometry {
        read(&self.device).geometry
    }

    pub fn ownership(&self) -> Ownership {
        *lock(&self.ownership)
    }

    pub fn connection(&self, id: ConnId) -> Option<Arc<Connection>> {
        lock(&self.sessions).get(id).cloned()
    }

    /// Tty path a connection is in, if it is in tty mode.
    pub fn tty_path(&self, id: ConnId) -> Option<Vec<u32>> {
        let sessions = lock(&self.sessions);
        sessions.tree.tty_of(id).map(|node| sessions.tree.path(node))
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.sessions).conns.len()
    }

    pub fn unauthenticated_count(&self) -> usize {
        self.unauthenticated.load(Ordering::SeqCst)
    }

    pub fn request_flush(&self) {
        self.gateway.request_flush();
    }

    /// Register a freshly accepted transport.
    ///
    /// Refused with `ConnRefused` when the unauthenticated limit is reached;
    /// a refused transport is never added to the pool.
    pub fn accept(
        &self,
        peer: &str,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Response>), ErrorCode> {
        let limit = self.config.max_unauthenticated;
        if self
            .unauthenticated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            self.metrics.connection_refused();
            return Err(ErrorCode::ConnRefused);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.outbound_queue);
        let conn = Arc::new(Connection::new(id, peer, tx));
        {
            let mut sessions = lock(&self.sessions);
            sessions.tree.attach(id);
            sessions.conns.insert(id, conn.clone());
        }
        self.metrics.connection_opened();
        debug!(conn = id, %peer, "Connection accepted");
        Ok((conn, rx))
    }

    /// The handshake succeeded.
    pub fn authenticated(&self, conn: &Connection) {
        if conn.mark_authenticated() {
            self.unauthenticated.fetch_sub(1, Ordering::SeqCst);
            info!(conn = conn.id(), peer = %conn.peer(), "Client authenticated");
        }
    }

    /// Tear a connection down: release exclusive ownership (recovering the
    /// device), drop its watches, leave its tty and forget it.
    pub async fn disconnect(&self, conn: &Arc<Connection>) {
        let id = conn.id();

        let held = lock(&self.ownership).release(id);
        match held {
            Ownership::RawHeld(_) => {
                warn!(conn = id, "Raw mode holder went away, resetting device");
                if let Err(e) = self.gateway.reset().await {
                    error!(conn = id, "Device reset failed: {}", e);
                }
            }
            Ownership::SuspendHeld(_) => {
                warn!(conn = id, "Suspend holder went away, resuming device");
                if let Err(e) = self.gateway.resume().await {
                    warn!(conn = id, "Failed to resume device: {}", e);
                }
            }
            Ownership::Free => {}
        }

        {
            let mut registry = lock(&self.params);
            for sub in conn.take_subscriptions() {
                registry.remove_subscriber(sub.param, sub.global);
            }
        }
        {
            let mut sessions = lock(&self.sessions);
            sessions.tree.detach(id);
            sessions.conns.remove(&id);
        }
        conn.leave_tty();

        if !conn.is_authenticated() {
            self.unauthenticated.fetch_sub(1, Ordering::SeqCst);
        }
        self.metrics.connection_closed();
        info!(conn = id, peer = %conn.peer(), "Connection closed");
        self.request_flush();
    }

    /// The owning application is (or stops) using the display itself.
    pub fn set_core_active(&self, active: bool) {
        self.core_active.store(active, Ordering::SeqCst);
        debug!(active, "Core activity changed");
        self.request_flush();
    }

    pub fn core_active(&self) -> bool {
        self.core_active.load(Ordering::SeqCst)
    }

    /// Which top-level tty is active.
    pub fn set_root_focus(&self, focus: Option<u32>) {
        lock(&self.sessions).tree.set_root_focus(focus);
        debug!(?focus, "Root focus changed");
        self.request_flush();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::auth::NoAuth;
    use dot_driver::{CoreConfig, CoreThread, DriverCore, VirtualDisplay, VirtualDriver};
    use std::time::Duration;

    pub struct Harness {
        pub server: Arc<Server>,
        pub display: VirtualDisplay,
        core: Option<CoreThread>,
    }

    impl Harness {
        pub fn new(config: ServerConfig) -> Self {
            Self::start(config, false)
        }

        /// Start with the owning application holding the display, so the
        /// core never releases an idle device.
        pub fn holding_display(config: ServerConfig) -> Self {
            Self::start(config, true)
        }

        fn start(config: ServerConfig, core_active: bool) -> Self {
            let (driver, display) = VirtualDriver::new("virtual", "vd", Geometry::new(8, 1));
            let (gateway, inbox) = dot_driver::gateway(16);
            let device = DeviceInfo {
                driver_name: "virtual".into(),
                model: "vd".into(),
                geometry: Geometry::new(8, 1),
                capabilities: Default::default(),
                online: false,
            };
            let server = Server::new(config, gateway, Arc::new(NoAuth), device);
            server.set_core_active(core_active);
            let core = DriverCore::spawn(
                Box::new(driver),
                inbox,
                server.clone(),
                CoreConfig {
                    poll_interval: Duration::from_millis(5),
                    max_reads_per_poll: 16,
                    reopen_interval: Duration::from_millis(5),
                },
            )
            .unwrap();
            Self {
                server,
                display,
                core: Some(core),
            }
        }

        /// Accept and authenticate a connection.
        pub fn connect(&self) -> (Arc<Connection>, mpsc::Receiver<Response>) {
            let (conn, rx) = self.server.accept("test").unwrap();
            self.server.authenticated(&conn);
            (conn, rx)
        }

        pub async fn stop(mut self) {
            self.server.gateway().shutdown().await;
            if let Some(core) = self.core.take() {
                tokio::task::spawn_blocking(move || core.join()).await.unwrap();
            }
        }
    }

    pub async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn unauthenticated_limit_refuses() {
        let h = Harness::new(ServerConfig {
            max_unauthenticated: 1,
            ..Default::default()
        });
        let (first, _rx) = h.server.accept("a").unwrap();
        assert_eq!(h.server.accept("b").unwrap_err(), ErrorCode::ConnRefused);
        assert_eq!(h.server.connection_count(), 1);

        h.server.authenticated(&first);
        let (second, _rx2) = h.server.accept("c").unwrap();
        assert_eq!(h.server.unauthenticated_count(), 1);

        h.server.disconnect(&second).await;
        assert_eq!(h.server.unauthenticated_count(), 0);
        h.stop().await;
    }

    #[tokio::test]
    async fn disconnect_releases_raw_and_resets() {
        let h = Harness::holding_display(ServerConfig::default());
        let (a, _rx) = h.connect();
        eventually(|| h.display.is_open()).await;
        lock(&h.server.ownership).enter_raw(a.id()).unwrap();
        let resets = h.display.reset_count();

        h.server.disconnect(&a).await;
        assert_eq!(h.server.ownership(), Ownership::Free);
        assert_eq!(h.display.reset_count(), resets + 1);
        assert!(h.server.connection(a.id()).is_none());
        h.stop().await;
    }

    #[tokio::test]
    async fn disconnect_releases_suspend_and_resumes() {
        let h = Harness::holding_display(ServerConfig::default());
        let (a, _rx) = h.connect();
        lock(&h.server.ownership).enter_suspend(a.id()).unwrap();
        h.server.gateway().suspend().await.unwrap();
        assert!(!h.display.is_open());

        h.server.disconnect(&a).await;
        assert!(h.server.ownership().is_free());
        assert!(h.display.is_open());
        h.stop().await;
    }
}
