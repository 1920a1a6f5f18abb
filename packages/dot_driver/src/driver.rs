use dot_proto::KeyCode;

use crate::error::DriverError;

/// Display dimensions in cells.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub columns: u32,
    pub rows: u32,
}

impl Geometry {
    pub const fn new(columns: u32, rows: u32) -> Self {
        Self { columns, rows }
    }

    pub fn cells(&self) -> usize {
        self.columns as usize * self.rows as usize
    }
}

/// What a driver can do beyond showing cells and reporting commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Raw device packets can be passed through to a client.
    pub raw_packets: bool,
    /// Undecoded key codes can be reported.
    pub keycodes: bool,
}

/// One key press as reported by a driver.
///
/// `keycode` is the undecoded driver code; `command` is what the key means
/// once the driver's key table has been applied, when it means anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub keycode: KeyCode,
    pub command: Option<KeyCode>,
}

/// Snapshot of the device as last seen by the core.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub driver_name: String,
    pub model: String,
    pub geometry: Geometry,
    pub capabilities: Capabilities,
    pub online: bool,
}

/// Contract implemented by a physical display driver.
///
/// Every method runs on the core thread. Reads must not block: return
/// `Ok(None)` when nothing is pending.
pub trait BrailleDriver: Send + 'static {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Open the device and report its geometry.
    fn construct(&mut self) -> Result<Geometry, DriverError>;

    /// Close the device. Must be safe to call on a closed device.
    fn destruct(&mut self);

    /// Recover a misbehaving device without closing it.
    fn reset(&mut self) -> Result<(), DriverError>;

    /// Current geometry. Drivers whose geometry changes at runtime report
    /// the new value here and the core picks it up on its next poll.
    fn geometry(&self) -> Geometry;

    fn read_command(&mut self) -> Result<Option<KeyEvent>, DriverError>;

    fn read_packet(&mut self) -> Result<Option<Vec<u8>>, DriverError>;

    fn write_packet(&mut self, data: &[u8]) -> Result<(), DriverError>;

    fn write_window(&mut self, cells: &[u8]) -> Result<(), DriverError>;
}
