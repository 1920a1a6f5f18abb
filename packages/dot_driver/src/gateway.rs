//! The core thread and the gateway used to reach it.
//!
//! The core thread owns the driver outright; nothing else ever holds a
//! reference to it. Callers submit a [`DriverTask`] through the
//! [`DriverGateway`] and wait on a oneshot reply, so the single-owner rule
//! needs no lock around the driver.
//!
//! Besides executing tasks the core loop polls the driver for input and
//! flushes output. Flush requests go through a `Notify`, which keeps at most
//! one pending permit: any number of requests made before the core gets to
//! them collapse into one flush of the latest state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::driver::{BrailleDriver, DeviceInfo, Geometry, KeyEvent};
use crate::error::DriverError;

/// Work that must run on the core thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverTask {
    /// Open the device (resume).
    Construct,
    /// Close the device (suspend).
    Destruct,
    /// Recover the device in place.
    Reset,
    WritePacket(Vec<u8>),
    WriteWindow(Vec<u8>),
}

/// What the core should do with the display on a flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushAction {
    /// Show these cells.
    Write(Vec<u8>),
    /// Nobody wants the display; close the device.
    Suspend,
    /// Leave the display alone.
    Idle,
}

/// Callbacks the core makes into the server. All run on the core thread.
pub trait CoreHooks: Send + Sync + 'static {
    /// Decide what the display should show right now.
    fn compose(&self, geometry: Geometry) -> FlushAction;

    /// Whether input should be read as raw packets instead of commands.
    fn raw_mode(&self) -> bool;

    /// Offer a key press to clients. Returns `false` if nobody took it.
    fn key_pressed(&self, event: KeyEvent) -> bool;

    fn packet_received(&self, data: Vec<u8>);

    /// The device snapshot changed (opened, closed, resized).
    fn device_changed(&self, info: &DeviceInfo);

    /// The device failed during I/O. Recovery is about to be attempted.
    fn device_failed(&self, error: &DriverError);

    /// A failed device is working again.
    fn device_recovered(&self);
}

/// Core loop tuning.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// How often input is polled and the display refreshed.
    pub poll_interval: Duration,
    /// Upper bound on reads drained per poll.
    pub max_reads_per_poll: usize,
    /// Delay between attempts to reopen a failed device.
    pub reopen_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(40),
            max_reads_per_poll: 16,
            reopen_interval: Duration::from_secs(2),
        }
    }
}

enum CoreRequest {
    Task(DriverTask),
    Shutdown,
}

struct CoreMessage {
    request: CoreRequest,
    respond_to: oneshot::Sender<Result<(), DriverError>>,
}

/// Handle used by every other thread to reach the core.
#[derive(Clone)]
pub struct DriverGateway {
    sender: mpsc::Sender<CoreMessage>,
    flush: Arc<Notify>,
}

/// Receiving side of a gateway, consumed by [`DriverCore::spawn`].
pub struct CoreInbox {
    receiver: mpsc::Receiver<CoreMessage>,
    flush: Arc<Notify>,
}

/// Create a connected gateway/inbox pair.
pub fn gateway(queue: usize) -> (DriverGateway, CoreInbox) {
    let (sender, receiver) = mpsc::channel(queue);
    let flush = Arc::new(Notify::new());
    (
        DriverGateway {
            sender,
            flush: flush.clone(),
        },
        CoreInbox { receiver, flush },
    )
}

impl DriverGateway {
    /// Run a task on the core thread and wait for its result.
    pub async fn run_on_core(&self, task: DriverTask) -> Result<(), DriverError> {
        self.call(CoreRequest::Task(task)).await
    }

    async fn call(&self, request: CoreRequest) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoreMessage {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| DriverError::Channel("Failed to reach driver core".into()))?;
        rx.await
            .map_err(|_| DriverError::Channel("Driver core dropped the request".into()))?
    }

    /// Close the device.
    pub async fn suspend(&self) -> Result<(), DriverError> {
        self.run_on_core(DriverTask::Destruct).await
    }

    /// Reopen the device.
    pub async fn resume(&self) -> Result<(), DriverError> {
        self.run_on_core(DriverTask::Construct).await
    }

    pub async fn reset(&self) -> Result<(), DriverError> {
        self.run_on_core(DriverTask::Reset).await
    }

    pub async fn write_packet(&self, data: Vec<u8>) -> Result<(), DriverError> {
        self.run_on_core(DriverTask::WritePacket(data)).await
    }

    pub async fn write_window(&self, cells: Vec<u8>) -> Result<(), DriverError> {
        self.run_on_core(DriverTask::WriteWindow(cells)).await
    }

    /// Ask the core to recompute the display. Coalesces with any request
    /// still pending.
    pub fn request_flush(&self) {
        self.flush.notify_one();
    }

    /// Close the device and stop the core loop.
    pub async fn shutdown(&self) {
        if let Err(e) = self.call(CoreRequest::Shutdown).await {
            debug!("Driver core already stopped: {}", e);
        }
    }
}

/// Join handle for the core thread.
pub struct CoreThread {
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CoreThread {
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Driver core thread panicked");
            }
        }
    }
}

/// The driver-owning actor.
pub struct DriverCore {
    driver: Box<dyn BrailleDriver>,
    hooks: Arc<dyn CoreHooks>,
    inbox: CoreInbox,
    config: CoreConfig,
    info: DeviceInfo,
    constructed: bool,
    failed: bool,
    next_reopen: Instant,
    last_cells: Option<Vec<u8>>,
}

impl DriverCore {
    /// Move the driver onto a dedicated core thread and start the loop.
    pub fn spawn(
        driver: Box<dyn BrailleDriver>,
        inbox: CoreInbox,
        hooks: Arc<dyn CoreHooks>,
        config: CoreConfig,
    ) -> std::io::Result<CoreThread> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let info = DeviceInfo {
            driver_name: driver.name().to_string(),
            model: driver.model().to_string(),
            geometry: driver.geometry(),
            capabilities: driver.capabilities(),
            online: false,
        };
        let core = Self {
            driver,
            hooks,
            inbox,
            config,
            info,
            constructed: false,
            failed: false,
            next_reopen: Instant::now(),
            last_cells: None,
        };

        let handle = std::thread::Builder::new()
            .name("dot-core".into())
            .spawn(move || runtime.block_on(core.run()))?;

        Ok(CoreThread {
            handle: Some(handle),
        })
    }

    async fn run(mut self) {
        info!(driver = %self.info.driver_name, "Driver core started");
        self.hooks.device_changed(&self.info);
        if let Err(e) = self.construct() {
            warn!("Initial device open failed: {}", e);
            self.failed = true;
        }

        let mut tick = tokio::time::interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let flush = self.inbox.flush.clone();

        loop {
            tokio::select! {
                biased;
                msg = self.inbox.receiver.recv() => {
                    let Some(msg) = msg else { break };
                    match msg.request {
                        CoreRequest::Task(task) => {
                            let result = self.execute(task);
                            let _ = msg.respond_to.send(result);
                        }
                        CoreRequest::Shutdown => {
                            self.destruct();
                            let _ = msg.respond_to.send(Ok(()));
                            break;
                        }
                    }
                }
                _ = flush.notified() => self.flush(),
                _ = tick.tick() => {
                    self.poll_input();
                    self.flush();
                }
            }
        }

        self.destruct();
        info!("Driver core stopped");
    }

    fn execute(&mut self, task: DriverTask) -> Result<(), DriverError> {
        debug!(?task, "Running core task");
        match task {
            DriverTask::Construct => self.construct(),
            DriverTask::Destruct => {
                // A closed failed device stays closed until asked to reopen.
                self.failed = false;
                self.destruct();
                Ok(())
            }
            DriverTask::Reset => self.reset(),
            DriverTask::WritePacket(data) => {
                if !self.constructed {
                    return Err(DriverError::NotConstructed);
                }
                self.driver.write_packet(&data)
            }
            DriverTask::WriteWindow(cells) => self.write_window(cells),
        }
    }

    fn construct(&mut self) -> Result<(), DriverError> {
        if self.constructed {
            return Ok(());
        }
        let geometry = self.driver.construct()?;
        self.constructed = true;
        self.failed = false;
        self.last_cells = None;
        self.info.geometry = geometry;
        self.info.online = true;
        info!(columns = geometry.columns, rows = geometry.rows, "Device opened");
        self.hooks.device_changed(&self.info);
        Ok(())
    }

    fn destruct(&mut self) {
        if !self.constructed {
            return;
        }
        self.driver.destruct();
        self.constructed = false;
        self.last_cells = None;
        self.info.online = false;
        info!("Device closed");
        self.hooks.device_changed(&self.info);
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        if !self.constructed {
            return self.construct();
        }
        match self.driver.reset() {
            Ok(()) => {
                self.last_cells = None;
                Ok(())
            }
            Err(e) => {
                error!("Device reset failed, closing it: {}", e);
                self.destruct();
                self.failed = true;
                self.next_reopen = Instant::now() + self.config.reopen_interval;
                Err(e)
            }
        }
    }

    fn write_window(&mut self, cells: Vec<u8>) -> Result<(), DriverError> {
        if self.last_cells.as_ref() == Some(&cells) && self.constructed {
            return Ok(());
        }
        self.construct()?;
        self.driver.write_window(&cells)?;
        self.last_cells = Some(cells);
        Ok(())
    }

    fn flush(&mut self) {
        if self.failed {
            return;
        }
        match self.hooks.compose(self.info.geometry) {
            FlushAction::Write(cells) => {
                if let Err(e) = self.write_window(cells) {
                    self.fail(e);
                }
            }
            FlushAction::Suspend => {
                if self.constructed {
                    debug!("Nobody fills the display, releasing device");
                    self.destruct();
                }
            }
            FlushAction::Idle => {}
        }
    }

    fn poll_input(&mut self) {
        if !self.constructed {
            if self.failed && Instant::now() >= self.next_reopen {
                self.reopen();
            }
            return;
        }

        let geometry = self.driver.geometry();
        if geometry != self.info.geometry {
            info!(
                columns = geometry.columns,
                rows = geometry.rows,
                "Display geometry changed"
            );
            self.info.geometry = geometry;
            self.last_cells = None;
            self.hooks.device_changed(&self.info);
        }

        for _ in 0..self.config.max_reads_per_poll {
            let more = if self.hooks.raw_mode() {
                match self.driver.read_packet() {
                    Ok(Some(data)) => {
                        self.hooks.packet_received(data);
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        self.fail(e);
                        false
                    }
                }
            } else {
                match self.driver.read_command() {
                    Ok(Some(event)) => {
                        if !self.hooks.key_pressed(event) {
                            debug!(keycode = event.keycode, "Key kept by core");
                        }
                        true
                    }
                    Ok(None) => false,
                    Err(e) => {
                        self.fail(e);
                        false
                    }
                }
            };
            if !more {
                break;
            }
        }
    }

    fn fail(&mut self, error: DriverError) {
        warn!("Device failed: {}", error);
        self.info.online = false;
        self.hooks.device_failed(&error);
        match self.reset() {
            Ok(()) => {
                info!("Device recovered after reset");
                self.info.online = true;
                self.hooks.device_recovered();
            }
            Err(_) => {
                self.hooks.device_changed(&self.info);
            }
        }
    }

    fn reopen(&mut self) {
        match self.construct() {
            Ok(()) => {
                info!("Failed device reopened");
                self.hooks.device_recovered();
            }
            Err(e) => {
                debug!("Device still unavailable: {}", e);
                self.next_reopen = Instant::now() + self.config.reopen_interval;
            }
        }
    }
}
