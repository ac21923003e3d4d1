#![warn(missing_docs)]

//! Linux SocketCAN adapter implementing the `can-io-interface` traits.
//!
//! Wraps the [`socketcan`] crate's tokio socket so an interface like `can0`
//! or `vcan0` can back an ISO-TP network. On non-Linux targets the types are
//! present but the constructor returns [`UnsupportedPlatformError`].

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(not(target_os = "linux"))]
mod non_linux;

#[cfg(not(target_os = "linux"))]
pub use non_linux::*;
