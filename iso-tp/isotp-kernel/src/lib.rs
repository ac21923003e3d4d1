#![warn(missing_docs)]

//! Linux kernel ISO-TP socket backend.
//!
//! When the host kernel provides `CAN_ISOTP` sockets, the entire user-space
//! transport engine in `isotp-net` can be bypassed: each connection becomes
//! one kernel socket that accepts and yields whole reassembled payloads. The
//! surface here mirrors the user-space one (a flow-control profile per
//! connection, whole-message send/receive); selection between the two paths
//! is the application's choice at construction time.
//!
//! On non-Linux targets the types are present but the constructor returns
//! [`UnsupportedPlatformError`].

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(not(target_os = "linux"))]
mod non_linux;

#[cfg(not(target_os = "linux"))]
pub use non_linux::*;
