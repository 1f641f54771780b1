//! Linux TAP interface.
//!
//! Opening `/dev/net/tun` and issuing `TUNSETIFF` with `IFF_TAP | IFF_NO_PI`
//! gives a file descriptor that exchanges bare Ethernet frames with the
//! kernel: one `read` returns one frame, one `write` injects one frame. The
//! interface is not made persistent, so it disappears when the descriptor is
//! closed.
//!
//! Addresses, MTU and routes are configured by separate tooling.

use bitflags::bitflags;
use nix::libc;
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    config::InterfaceConfig,
    error::{Error, Result},
    privilege::Privileged,
    tracing::prelude::*,
};

bitflags! {
    /// `ifr_flags` understood by the tun driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TunFlags: libc::c_short {
        const TUN = 0x0001;
        const TAP = 0x0002;
        /// Do not prepend the 4-byte packet information header
        const NO_PI = 0x1000;
    }
}

mod sys {
    use nix::libc;

    /// The prefix of `struct ifreq` that TUNSETIFF reads and writes.
    #[repr(C)]
    pub struct IfReq {
        pub name: [libc::c_char; libc::IFNAMSIZ],
        pub flags: libc::c_short,
        // Rest of the ifr_ifru union
        pub _pad: [u8; 22],
    }

    nix::ioctl_write_ptr_bad!(
        tun_set_iff,
        nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
        IfReq
    );
}

use sys::IfReq;

impl IfReq {
    fn new(name: &str, flags: TunFlags) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
            return Err(Error::Config(format!("invalid interface name {name:?}")));
        }
        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: flags.bits(),
            _pad: [0; 22],
        };
        for (dst, &b) in req.name.iter_mut().zip(bytes) {
            *dst = b as libc::c_char;
        }
        Ok(req)
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// A TAP interface owned by this process.
#[derive(Debug)]
pub struct TapInterface {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TapInterface {
    /// Check that the tun driver is loaded, without opening anything.
    pub fn check_support(config: &InterfaceConfig) -> Result<()> {
        if config.control_path.exists() {
            Ok(())
        } else {
            Err(Error::DeviceUnavailable(config.control_path.clone()))
        }
    }

    /// Create the interface named in `config`.
    ///
    /// Always asks for a fresh interface; a name held by another process is
    /// [`Error::InterfaceExists`]. Must be called inside a tokio runtime.
    pub fn create(_privilege: &Privileged, config: &InterfaceConfig) -> Result<Self> {
        let control = config.control_path.as_path();
        let fd = rustix::fs::open(
            control,
            OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| {
            if e == Errno::NOENT || e == Errno::NODEV || e == Errno::NXIO {
                Error::DeviceUnavailable(control.to_path_buf())
            } else if e == Errno::ACCESS || e == Errno::PERM {
                Error::PermissionDenied(format!("cannot open {}: {e}", control.display()))
            } else {
                Error::InterfaceCreate {
                    name: config.name.clone(),
                    source: e.into(),
                }
            }
        })?;

        let req = IfReq::new(&config.name, TunFlags::TAP | TunFlags::NO_PI)?;
        // SAFETY: `req` is a properly sized, initialised ifreq that outlives
        // the call, and `fd` is an open tun control descriptor.
        unsafe { sys::tun_set_iff(fd.as_raw_fd(), &req) }.map_err(|e| match e {
            nix::errno::Errno::EPERM => Error::PermissionDenied(format!(
                "TUNSETIFF on {} refused; CAP_NET_ADMIN is required",
                config.name
            )),
            nix::errno::Errno::EBUSY | nix::errno::Errno::EEXIST => {
                Error::InterfaceExists(config.name.clone())
            }
            e => Error::InterfaceCreate {
                name: config.name.clone(),
                source: e.into(),
            },
        })?;

        let name = req.name();
        let fd = AsyncFd::try_new(fd).map_err(|e| Error::InterfaceCreate {
            name: name.clone(),
            source: e.into(),
        })?;

        info!(iface = %name, "Created TAP interface");
        Ok(Self { fd, name })
    }

    /// Name the kernel gave the interface.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsyncRead for TapInterface {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| Ok(rustix::io::read(inner.get_ref(), unfilled)?)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for TapInterface {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| Ok(rustix::io::write(inner.get_ref(), buf)?)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for TapInterface {
    fn drop(&mut self) {
        debug!(iface = %self.name, "Released TAP interface");
    }
}
