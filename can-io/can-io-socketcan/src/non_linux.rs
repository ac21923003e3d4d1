use std::fmt;

/// Returned when attempting to use SocketCAN adapters on a non-Linux target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedPlatformError;

impl fmt::Display for UnsupportedPlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "can-io-socketcan is only supported on Linux targets")
    }
}

impl std::error::Error for UnsupportedPlatformError {}

/// SocketCAN adapter (non-Linux stub).
#[derive(Debug, Default)]
pub struct SocketCan;

impl SocketCan {
    /// Always returns [`UnsupportedPlatformError`] on non-Linux targets.
    pub fn open(_iface: &str) -> Result<Self, UnsupportedPlatformError> {
        Err(UnsupportedPlatformError)
    }
}
