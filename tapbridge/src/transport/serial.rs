//! Serial link to the peripheral.
//!
//! A thin owner of the [`SerialStream`], opened at the configured line rate.
//! Bytes pass through untouched; framing, if any, lives in
//! [`crate::framing`]. The port itself never times out, so callers bound
//! their writes.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::{
    config::SerialConfig,
    error::{Error, Result},
    tracing::prelude::*,
};

/// An open serial port, owned by whoever runs the bridge.
#[derive(Debug)]
pub struct SerialTransport {
    stream: SerialStream,
    path: PathBuf,
    baud_rate: u32,
}

impl SerialTransport {
    /// Open `path` with the line settings from `config`.
    pub fn open(path: &Path, config: &SerialConfig) -> Result<Self> {
        let path_str = path.to_string_lossy();
        let mut stream = tokio_serial::new(path_str.as_ref(), config.baud_rate)
            .open_native_async()
            .map_err(|source| Error::SerialOpen {
                path: path.to_path_buf(),
                source,
            })?;

        if config.exclusive {
            if let Err(e) = stream.set_exclusive(true) {
                warn!(device = %path.display(), error = %e, "Could not get exclusive access");
            }
        }

        // Anything the peripheral sent before we attached is stale.
        if let Err(e) = stream.clear(tokio_serial::ClearBuffer::Input) {
            debug!(device = %path.display(), error = %e, "Could not clear input buffer");
        }

        info!(device = %path.display(), baud = config.baud_rate, "Opened serial device");
        Ok(Self {
            stream,
            path: path.to_path_buf(),
            baud_rate: config.baud_rate,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl AsyncRead for SerialTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!(device = %self.path.display(), "Closed serial device");
    }
}
