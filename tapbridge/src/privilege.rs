//! Administrative privilege as a capability.
//!
//! Creating a TAP interface needs root (strictly, CAP_NET_ADMIN). The check is
//! done once at startup and proven by holding a [`Privileged`] value, which
//! [`crate::tap::TapInterface::create`] demands.

use nix::unistd::geteuid;

use crate::error::{Error, Result};

/// Proof that the process passed the privilege check.
#[derive(Debug)]
pub struct Privileged {
    _private: (),
}

impl Privileged {
    /// Check that the process runs as root.
    pub fn acquire() -> Result<Self> {
        if geteuid().is_root() {
            Ok(Self { _private: () })
        } else {
            Err(Error::PermissionDenied(
                "this program must be run as root (e.g. with sudo)".to_string(),
            ))
        }
    }

    /// Skip the check, for tests running against fakes.
    #[cfg(test)]
    pub(crate) fn assume() -> Self {
        Self { _private: () }
    }
}
