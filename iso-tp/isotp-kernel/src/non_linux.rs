use std::fmt;

/// Returned when attempting to use kernel ISO-TP sockets on a non-Linux target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedPlatformError;

impl fmt::Display for UnsupportedPlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "isotp-kernel is only supported on Linux targets")
    }
}

impl std::error::Error for UnsupportedPlatformError {}

/// Kernel ISO-TP endpoint (non-Linux stub).
#[derive(Debug, Default)]
pub struct KernelIsoTp;

impl KernelIsoTp {
    /// Always returns [`UnsupportedPlatformError`] on non-Linux targets.
    pub fn open(_iface: &str) -> Result<Self, UnsupportedPlatformError> {
        Err(UnsupportedPlatformError)
    }
}
