//! Driver core - the only place that touches the braille device
//!
//! This crate owns the physical-driver side of the daemon. A [`BrailleDriver`]
//! is moved onto a dedicated core thread and every operation on it
//! (open, close, reset, reads, writes) runs there. Other threads reach it
//! through a cloneable [`DriverGateway`], which submits a task and waits for
//! the core to execute it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dot_driver::{
//!     CoreConfig, CoreHooks, DeviceInfo, DriverCore, DriverError, FlushAction, Geometry,
//!     KeyEvent, VirtualDriver, gateway,
//! };
//!
//! struct Quiet;
//!
//! impl CoreHooks for Quiet {
//!     fn compose(&self, _geometry: Geometry) -> FlushAction { FlushAction::Idle }
//!     fn raw_mode(&self) -> bool { false }
//!     fn key_pressed(&self, _event: KeyEvent) -> bool { false }
//!     fn packet_received(&self, _data: Vec<u8>) {}
//!     fn device_changed(&self, _info: &DeviceInfo) {}
//!     fn device_failed(&self, _error: &DriverError) {}
//!     fn device_recovered(&self) {}
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let (driver, _display) = VirtualDriver::new("virtual", "vd40", Geometry::new(40, 1));
//!     let (gateway, inbox) = gateway(32);
//!     let core = DriverCore::spawn(Box::new(driver), inbox, Arc::new(Quiet), CoreConfig::default())
//!         .unwrap();
//!
//!     gateway.write_window(vec![0x01; 40]).await.unwrap();
//!     gateway.shutdown().await;
//!     core.join();
//! }
//! ```

mod driver;
mod error;
mod gateway;
mod virtual_driver;

pub use driver::{BrailleDriver, Capabilities, DeviceInfo, Geometry, KeyEvent};
pub use error::DriverError;
pub use gateway::{
    CoreConfig, CoreHooks, CoreInbox, CoreThread, DriverCore, DriverGateway, DriverTask,
    FlushAction, gateway,
};
pub use virtual_driver::{VirtualDisplay, VirtualDriver};
