//! Braille display sharing server.
//!
//! Many clients talk to one braille display through a small binary
//! protocol. Clients that enter tty mode are placed in a tree of virtual
//! terminals; the tree decides whose window is shown and who gets each key.
//! A client may instead take the device exclusively, either to exchange raw
//! packets with it or to keep it closed.
//!
//! The device itself is only ever touched by the driver core from the
//! `dot_driver` crate. [`Server`] implements the core's callbacks and talks
//! to it through a [`DriverGateway`](dot_driver::DriverGateway).

pub mod auth;
pub mod cells;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
mod flush;
pub mod listener;
pub mod metrics;
pub mod ownership;
pub mod params;
pub mod ranges;
pub mod router;
mod routing;
pub mod server;
pub mod tty;
pub mod window;

pub use auth::{Authenticator, KeyAuth, NoAuth};
pub use config::{DotshareConfig, FileConfig, ServerConfig, load_config};
pub use connection::{Connection, KeyDelivery};
pub use error::{HandshakeError, ServerError, TreeError};
pub use listener::{ListenAddr, Listeners, bind_all};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use ownership::Ownership;
pub use ranges::KeyRangeSet;
pub use router::serve_connection;
pub use server::Server;
pub use tty::{ConnId, TtyTree};
