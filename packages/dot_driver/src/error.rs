/// Errors that can occur during driver operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// Failed to open the device
    #[error("failed to open device: {0}")]
    ConstructFailed(String),
    /// The device is closed (suspended, idle-released, or failed)
    #[error("device is not open")]
    NotConstructed,
    /// Device I/O failed
    #[error("device I/O failed: {0}")]
    Io(String),
    /// The driver cannot do this
    #[error("operation not supported by driver")]
    Unsupported,
    /// Core thread communication error
    #[error("core channel error: {0}")]
    Channel(String),
}
