//! Bringing up both endpoints and handing them to the bridge.
//!
//! Setup runs in a fixed order: privilege and tun driver checks, device
//! selection, serial port, TAP interface. Each step returns an owned endpoint, so an error part
//! way through drops whatever was already open, exactly once, before the error
//! reaches the caller.

use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{
    bridge::{Bridge, BridgeStats},
    config::{Config, DiscoveryConfig, InterfaceConfig, SerialConfig},
    error::Result,
    privilege::Privileged,
    tap::TapInterface,
    tracing::prelude::*,
    transport::{DeviceScanner, SelectedDevice, SerialTransport},
};

/// The OS facilities the bridge needs.
///
/// [`LinuxHost`] is the real thing; tests substitute fakes.
pub trait Host {
    type Serial: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Interface: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Fails with a precondition error when the process lacks privilege.
    fn require_privilege(&self) -> Result<Privileged>;

    /// Fails with a precondition error when virtual interfaces are
    /// unavailable. Must not open anything.
    fn check_interface_support(&self, config: &InterfaceConfig) -> Result<()>;

    fn discover(&self, config: &DiscoveryConfig) -> Result<SelectedDevice>;

    fn open_serial(&self, path: &Path, config: &SerialConfig) -> Result<Self::Serial>;

    fn acquire_interface(
        &self,
        privilege: &Privileged,
        config: &InterfaceConfig,
    ) -> Result<Self::Interface>;
}

/// sysfs discovery, tokio-serial and `/dev/net/tun`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxHost;

impl Host for LinuxHost {
    type Serial = SerialTransport;
    type Interface = TapInterface;

    fn require_privilege(&self) -> Result<Privileged> {
        Privileged::acquire()
    }

    fn check_interface_support(&self, config: &InterfaceConfig) -> Result<()> {
        TapInterface::check_support(config)
    }

    fn discover(&self, config: &DiscoveryConfig) -> Result<SelectedDevice> {
        DeviceScanner::new(config)?.discover(&config.vendor_id)
    }

    fn open_serial(&self, path: &Path, config: &SerialConfig) -> Result<Self::Serial> {
        SerialTransport::open(path, config)
    }

    fn acquire_interface(
        &self,
        privilege: &Privileged,
        config: &InterfaceConfig,
    ) -> Result<Self::Interface> {
        TapInterface::create(privilege, config)
    }
}

/// Both endpoints open and ready to forward.
pub struct Session<S, T> {
    bridge: Bridge<S, T>,
    device: PathBuf,
    interface: String,
    _privilege: Privileged,
}

impl<S, T> Session<S, T>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Open the serial port and the interface.
    ///
    /// `device` bypasses discovery when given.
    pub fn establish<H>(host: &H, config: &Config, device: Option<PathBuf>) -> Result<Self>
    where
        H: Host<Serial = S, Interface = T>,
    {
        let privilege = host.require_privilege()?;
        host.check_interface_support(&config.interface)?;

        let device = match device {
            Some(path) => {
                info!(device = %path.display(), "Using serial device from arguments");
                path
            }
            None => host.discover(&config.discovery)?.path,
        };

        let serial = host.open_serial(&device, &config.serial)?;
        // On failure `serial` is dropped here, closing the port.
        let iface = host.acquire_interface(&privilege, &config.interface)?;

        Ok(Self {
            bridge: Bridge::new(serial, iface, config),
            device,
            interface: config.interface.name.clone(),
            _privilege: privilege,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Forward until cancelled or an endpoint fails, then release both
    /// endpoints.
    pub async fn run(self, cancel: CancellationToken) -> Result<BridgeStats> {
        info!(
            device = %self.device.display(),
            iface = %self.interface,
            "Bridge running"
        );
        self.bridge.run(cancel).await
    }
}
