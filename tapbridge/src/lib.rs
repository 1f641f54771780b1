//! Bridge between a USB serial peripheral and a Linux TAP interface.
//!
//! The host sees an ordinary Ethernet interface; every frame it sends is
//! written to the peripheral's serial port and every byte the peripheral sends
//! is injected back as a frame.
//!
//! * [`transport`] finds and opens the peripheral's serial port.
//! * [`tap`] creates the TAP interface.
//! * [`bridge`] forwards between the two.
//! * [`session`] sets both up in order and guarantees they are released.

pub mod bridge;
pub mod config;
pub mod error;
pub mod framing;
pub mod privilege;
pub mod session;
pub mod tap;
pub mod tracing;
pub mod transport;

#[cfg(test)]
mod test_util;
