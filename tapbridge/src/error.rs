//! Common error types for tapbridge.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use std::path::PathBuf;
use thiserror::Error;

use crate::bridge::Direction;

/// Main error type for tapbridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The process lacks the privilege needed to create the interface
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The tun/tap control node is missing
    #[error(
        "{} not found; the tun kernel module is probably not loaded (try `sudo modprobe tun`)",
        .0.display()
    )]
    DeviceUnavailable(PathBuf),

    /// Discovery produced no usable serial device
    #[error("no serial device found: {0}")]
    NotFound(String),

    /// The serial device could not be opened
    #[error("failed to open serial device {}: {source}", .path.display())]
    SerialOpen {
        path: PathBuf,
        #[source]
        source: tokio_serial::Error,
    },

    /// An interface with the requested name is held by someone else
    #[error("interface {0} already exists or is busy")]
    InterfaceExists(String),

    /// The kernel refused to create the interface
    #[error("failed to create interface {name}: {source}")]
    InterfaceCreate {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A read or write failed while forwarding
    #[error("forwarding {direction} failed: {source}")]
    Forwarding {
        direction: Direction,
        #[source]
        source: std::io::Error,
    },

    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for failures that mean the host is not set up to run the bridge
    /// at all, as opposed to a device or interface refusing to open.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::PermissionDenied(_) | Error::DeviceUnavailable(_))
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
