//! The forwarding loop between the serial port and the TAP interface.
//!
//! One task services both directions. Each iteration:
//!
//! 1. takes whatever the serial port has buffered right now, without waiting,
//!    and writes it to the interface;
//! 2. waits up to the poll timeout for a frame from the interface and writes
//!    it to the serial port.
//!
//! Serial data therefore waits at most one poll timeout, and a busy interface
//! cannot starve the serial direction because step 1 runs between every two
//! interface frames. There is no buffering beyond what the two file
//! descriptors provide.
//!
//! Writes to the serial port are bounded by the serial timeout, so a
//! peripheral that stops draining ends the loop instead of wedging it.
//!
//! The bridge owns both endpoints. [`Bridge::run`] consumes it, so both are
//! closed together when the loop ends, whichever way it ends.

use bytes::BytesMut;
use futures::FutureExt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{Error, Result},
    framing::SerialCodec,
    tracing::prelude::*,
};

/// Which way data was moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
    #[strum(serialize = "serial to interface")]
    SerialToInterface,
    #[strum(serialize = "interface to serial")]
    InterfaceToSerial,
}

/// Traffic counters for one bridge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub serial_to_iface_bytes: u64,
    pub serial_to_iface_frames: u64,
    pub iface_to_serial_bytes: u64,
    pub iface_to_serial_frames: u64,
    /// Interface writes that took fewer bytes than offered
    pub short_iface_writes: u64,
}

/// Forwards traffic between a serial endpoint `S` and an interface endpoint
/// `T`.
///
/// Reads from `T` must return at most one frame; writes to `T` must take one
/// frame. `S` is a plain byte stream.
pub struct Bridge<S, T> {
    serial: S,
    iface: T,
    codec: SerialCodec,
    poll_timeout: Duration,
    write_timeout: Duration,
    serial_buf: Vec<u8>,
    frame_buf: Vec<u8>,
    out_buf: BytesMut,
    stats: BridgeStats,
}

impl<S, T> Bridge<S, T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(serial: S, iface: T, config: &Config) -> Self {
        // The peripheral drops anything longer than one MTU.
        let max_frame = config.bridge.mtu;
        Self {
            serial,
            iface,
            codec: SerialCodec::new(config.bridge.framing, max_frame),
            poll_timeout: config.bridge.poll_timeout(),
            write_timeout: config.serial.timeout(),
            serial_buf: vec![0; config.serial.read_buffer],
            frame_buf: vec![0; max_frame],
            out_buf: BytesMut::with_capacity(max_frame + crate::framing::LENGTH_PREFIX_LEN),
            stats: BridgeStats::default(),
        }
    }

    /// Forward until `cancel` fires or an endpoint fails.
    ///
    /// Cancellation is observed between steps and while waiting on the
    /// interface, never in the middle of a write. Both endpoints are dropped
    /// before this returns.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<BridgeStats> {
        debug!(
            framing = %self.codec.framing(),
            poll_timeout_ms = self.poll_timeout.as_millis() as u64,
            "Forwarding started"
        );

        let result = self.forward(&cancel).await;
        let stats = self.stats;
        drop(self);

        match &result {
            Ok(()) => debug!("Forwarding stopped"),
            Err(e) => error!(error = %e, "Forwarding failed"),
        }
        result.map(|()| stats)
    }

    async fn forward(&mut self, cancel: &CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            self.serial_to_interface().await?;
            if !self.interface_to_serial(cancel).await? {
                break;
            }
        }
        Ok(())
    }

    /// Drain what the serial port has right now into the interface.
    async fn serial_to_interface(&mut self) -> Result<()> {
        let n = match self.serial.read(&mut self.serial_buf).now_or_never() {
            None => return Ok(()),
            Some(Ok(n)) => n,
            Some(Err(e)) if is_no_data(&e) => return Ok(()),
            Some(Err(e)) => return Err(forwarding(Direction::SerialToInterface, e)),
        };
        // Zero bytes means nothing to forward this time, not end of stream.
        if n == 0 {
            return Ok(());
        }
        trace!(bytes = n, "Read from serial");

        self.codec.push(&self.serial_buf[..n]);
        while let Some(frame) = self
            .codec
            .next_frame()
            .map_err(|e| forwarding(Direction::SerialToInterface, e))?
        {
            if frame.is_empty() {
                trace!("Skipping empty frame");
                continue;
            }
            let written = self
                .iface
                .write(&frame)
                .await
                .map_err(|e| forwarding(Direction::SerialToInterface, e))?;
            if written < frame.len() {
                warn!(offered = frame.len(), written, "Short write to interface");
                self.stats.short_iface_writes += 1;
            }
            self.stats.serial_to_iface_bytes += written as u64;
            self.stats.serial_to_iface_frames += 1;
        }
        Ok(())
    }

    /// Wait up to the poll timeout for one frame from the interface and send
    /// it out the serial port. Returns false when cancelled.
    async fn interface_to_serial(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            read = self.iface.read(&mut self.frame_buf) => {
                read.map_err(|e| forwarding(Direction::InterfaceToSerial, e))?
            }
            _ = time::sleep(self.poll_timeout) => return Ok(true),
        };
        if n == 0 {
            return Ok(true);
        }
        trace!(bytes = n, "Read frame from interface");

        self.out_buf.clear();
        self.codec
            .encode(&self.frame_buf[..n], &mut self.out_buf)
            .map_err(|e| forwarding(Direction::InterfaceToSerial, e))?;
        match time::timeout(self.write_timeout, self.serial.write_all(&self.out_buf)).await {
            Ok(result) => result.map_err(|e| forwarding(Direction::InterfaceToSerial, e))?,
            Err(_) => {
                return Err(forwarding(
                    Direction::InterfaceToSerial,
                    io::Error::new(io::ErrorKind::TimedOut, "serial port stopped draining"),
                ))
            }
        }

        self.stats.iface_to_serial_bytes += n as u64;
        self.stats.iface_to_serial_frames += 1;
        Ok(true)
    }
}

fn is_no_data(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn forwarding(direction: Direction, source: io::Error) -> Error {
    Error::Forwarding { direction, source }
}
