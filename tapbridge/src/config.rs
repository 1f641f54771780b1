//! Configuration management for tapbridge.
//!
//! Every component takes its settings from an explicit [`Config`] rather than
//! from process-wide constants. Values are layered: built-in defaults, then an
//! optional TOML file, then `TAPBRIDGE_*` environment variables, then
//! command-line flags (applied by the binary).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::framing::Framing;

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
pub const MAX_IFACE_NAME_LEN: usize = 15;

/// Main configuration structure for the bridge.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Serial device discovery
    pub discovery: DiscoveryConfig,

    /// Serial link parameters
    pub serial: SerialConfig,

    /// Virtual interface parameters
    pub interface: InterfaceConfig,

    /// Forwarding loop parameters
    pub bridge: BridgeConfig,
}

/// How candidate serial devices are enumerated and matched.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// USB vendor ID of the peripheral, as four hex digits
    pub vendor_id: String,

    /// Directory holding the device nodes
    pub device_dir: PathBuf,

    /// Regex matched against file names in `device_dir`
    pub device_pattern: String,

    /// Per-tty sysfs directory (each entry has a `device` link)
    pub sysfs_tty_dir: PathBuf,

    /// How many levels to climb from the tty's device node looking for
    /// `idVendor`/`idProduct`
    pub max_depth: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            vendor_id: "303a".to_string(),
            device_dir: PathBuf::from("/dev"),
            device_pattern: "^ttyACM[0-9]+$".to_string(),
            sysfs_tty_dir: PathBuf::from("/sys/class/tty"),
            max_depth: 5,
        }
    }
}

/// Serial link parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConfig {
    /// Line rate in baud
    pub baud_rate: u32,

    /// Longest a single frame may take to write to the port, in milliseconds
    pub timeout_ms: u64,

    /// Upper bound on bytes drained from the port per forwarding step
    pub read_buffer: usize,

    /// Request exclusive access (TIOCEXCL) after opening
    pub exclusive: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 921_600,
            timeout_ms: 100,
            read_buffer: 4096,
            exclusive: true,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Virtual interface parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterfaceConfig {
    /// Name requested for the TAP interface
    pub name: String,

    /// tun/tap control node
    pub control_path: PathBuf,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: "esp0".to_string(),
            control_path: PathBuf::from("/dev/net/tun"),
        }
    }
}

/// Forwarding loop parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// How long one iteration waits for the interface to become readable,
    /// in milliseconds
    pub poll_timeout_ms: u64,

    /// Link MTU of the virtual interface
    pub mtu: usize,

    /// Framing applied on the serial side
    pub framing: Framing,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            mtu: 1500,
            framing: Framing::Raw,
        }
    }
}

impl BridgeConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a specific TOML file.
    ///
    /// Keys missing from the file keep their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `TAPBRIDGE_*` environment overrides.
    ///
    /// Returns the explicit device path from `TAPBRIDGE_DEVICE`, if set, since
    /// that bypasses discovery rather than configuring it.
    pub fn apply_env(&mut self) -> Result<Option<PathBuf>> {
        if let Some(name) = env_var("TAPBRIDGE_IFACE") {
            self.interface.name = name;
        }
        if let Some(vid) = env_var("TAPBRIDGE_VENDOR_ID") {
            self.discovery.vendor_id = vid;
        }
        if let Some(baud) = env_parse::<u32>("TAPBRIDGE_BAUD")? {
            self.serial.baud_rate = baud;
        }
        if let Some(ms) = env_parse::<u64>("TAPBRIDGE_POLL_TIMEOUT_MS")? {
            self.bridge.poll_timeout_ms = ms;
        }
        Ok(env_var("TAPBRIDGE_DEVICE").map(PathBuf::from))
    }

    /// Check the values for things the kernel or the hardware would reject.
    pub fn validate(&self) -> Result<()> {
        let name = &self.interface.name;
        if name.is_empty() || name.len() > MAX_IFACE_NAME_LEN {
            return Err(Error::Config(format!(
                "interface name {name:?} must be 1 to {MAX_IFACE_NAME_LEN} bytes"
            )));
        }
        if name.contains('/') || name.contains(char::is_whitespace) {
            return Err(Error::Config(format!(
                "interface name {name:?} contains invalid characters"
            )));
        }

        let vid = &self.discovery.vendor_id;
        match hex::decode(vid) {
            Ok(bytes) if bytes.len() == 2 => {}
            _ => {
                return Err(Error::Config(format!("vendor ID {vid:?} must be four hex digits")))
            }
        }

        Regex::new(&self.discovery.device_pattern)
            .map_err(|e| Error::Config(format!("bad device pattern: {e}")))?;

        if self.serial.baud_rate == 0 {
            return Err(Error::Config("baud rate must be non-zero".into()));
        }
        if self.serial.read_buffer == 0 {
            return Err(Error::Config("serial read buffer must be non-zero".into()));
        }
        if self.serial.timeout_ms == 0 {
            return Err(Error::Config("serial timeout must be non-zero".into()));
        }
        // Length-prefixed framing carries the frame length in a u16.
        if self.bridge.mtu == 0 || self.bridge.mtu > u16::MAX as usize {
            return Err(Error::Config(format!("MTU {} out of range", self.bridge.mtu)));
        }
        if self.bridge.poll_timeout_ms == 0 {
            return Err(Error::Config("poll timeout must be non-zero".into()));
        }

        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| Error::Config(format!("{key}={v:?}: {e}")))
        })
        .transpose()
}
