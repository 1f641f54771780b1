//! Physical transport to the peripheral.
//!
//! This module finds the peripheral's USB serial port and opens it, providing
//! raw byte stream access without any protocol knowledge.

pub mod discovery;
pub mod serial;

pub use discovery::{CandidateDevice, DeviceScanner, Scan, SelectedDevice, Selection};
pub use serial::SerialTransport;
