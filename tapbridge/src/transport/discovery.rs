//! Serial device discovery through sysfs.
//!
//! CDC-ACM ports show up as `/dev/ttyACM*` with no hint of which USB device
//! they belong to. Each tty has a `device` link under `/sys/class/tty`
//! pointing at its USB interface node; climbing from there reaches the USB
//! device node carrying `idVendor` and `idProduct`.
//!
//! Selection is best-effort: when nothing carries the expected vendor ID the
//! first enumerated port is used anyway. Callers that need a strict match pass
//! an explicit path and never get here.

use regex::Regex;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{
    config::DiscoveryConfig,
    error::{Error, Result},
    tracing::prelude::*,
};

/// A serial port whose USB identity could be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDevice {
    pub path: PathBuf,
    /// Lowercase hex, as in sysfs
    pub vendor_id: String,
    /// Lowercase hex, as in sysfs
    pub product_id: String,
}

/// Why a port was dropped from vendor matching.
#[derive(Debug)]
pub enum SkipReason {
    /// No ancestor within the depth bound has `idVendor` and `idProduct`
    NoUsbParent,
    /// The ID attributes exist but could not be read
    Unreadable(io::Error),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoUsbParent => {
                write!(f, "no USB parent sysfs node with idVendor/idProduct")
            }
            SkipReason::Unreadable(e) => write!(f, "failed to read idVendor/idProduct: {e}"),
        }
    }
}

/// Everything one pass over the device directory found.
#[derive(Debug, Default)]
pub struct Scan {
    /// Every port matching the name pattern, sorted by path
    pub enumerated: Vec<PathBuf>,
    /// Ports whose USB IDs were read
    pub identified: Vec<CandidateDevice>,
    /// Ports whose USB IDs could not be determined
    pub skipped: Vec<(PathBuf, SkipReason)>,
}

/// How the selected port was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Exactly one port had the expected vendor ID
    Matched,
    /// Several ports had the expected vendor ID; the first by path won
    Ambiguous { matches: usize },
    /// No port had the expected vendor ID; the first port overall was taken
    Fallback,
}

/// The port chosen for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedDevice {
    pub path: PathBuf,
    /// Present when the port's USB IDs were read
    pub device: Option<CandidateDevice>,
    pub selection: Selection,
}

/// Finds the peripheral's serial port among the CDC-ACM ports on the host.
#[derive(Debug, Clone)]
pub struct DeviceScanner {
    device_dir: PathBuf,
    pattern: Regex,
    sysfs_tty_dir: PathBuf,
    max_depth: usize,
}

impl DeviceScanner {
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let pattern = Regex::new(&config.device_pattern)
            .map_err(|e| Error::Config(format!("bad device pattern: {e}")))?;
        Ok(Self {
            device_dir: config.device_dir.clone(),
            pattern,
            sysfs_tty_dir: config.sysfs_tty_dir.clone(),
            max_depth: config.max_depth,
        })
    }

    /// Locate the port belonging to `vendor_id`.
    pub fn discover(&self, vendor_id: &str) -> Result<SelectedDevice> {
        let scan = self.scan()?;
        select(&scan.enumerated, &scan.identified, vendor_id)
    }

    /// Enumerate ports and read the USB IDs of each.
    ///
    /// Ports whose IDs cannot be read are logged and recorded in
    /// [`Scan::skipped`]; they remain eligible for the fallback.
    pub fn scan(&self) -> Result<Scan> {
        let mut scan = Scan {
            enumerated: self.enumerate()?,
            ..Default::default()
        };

        if scan.enumerated.is_empty() {
            info!(
                dir = %self.device_dir.display(),
                pattern = %self.pattern,
                "No candidate serial devices found"
            );
            return Ok(scan);
        }

        for path in &scan.enumerated {
            match self.identify(path) {
                Ok(device) => {
                    info!(
                        device = %path.display(),
                        vid = %device.vendor_id,
                        pid = %device.product_id,
                        "Found serial device"
                    );
                    scan.identified.push(device);
                }
                Err(reason) => {
                    warn!(device = %path.display(), "Skipping: {reason}");
                    scan.skipped.push((path.clone(), reason));
                }
            }
        }

        Ok(scan)
    }

    fn enumerate(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.device_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(dir = %self.device_dir.display(), "Device directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if self.pattern.is_match(name) {
                    paths.push(entry.path());
                }
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn identify(&self, path: &Path) -> std::result::Result<CandidateDevice, SkipReason> {
        let usb = self.usb_parent(path).ok_or(SkipReason::NoUsbParent)?;
        let vendor_id = read_id(&usb.join("idVendor")).map_err(SkipReason::Unreadable)?;
        let product_id = read_id(&usb.join("idProduct")).map_err(SkipReason::Unreadable)?;
        Ok(CandidateDevice {
            path: path.to_path_buf(),
            vendor_id,
            product_id,
        })
    }

    /// Find the sysfs node of the USB device a tty belongs to.
    ///
    /// Starts at the resolved `device` link of the tty and climbs at most
    /// `max_depth` levels.
    fn usb_parent(&self, path: &Path) -> Option<PathBuf> {
        let tty_name = path.file_name()?;
        let link = self.sysfs_tty_dir.join(tty_name).join("device");
        let mut node = fs::canonicalize(link).ok()?;

        for _ in 0..self.max_depth {
            if node.join("idVendor").exists() && node.join("idProduct").exists() {
                return Some(node);
            }
            match node.parent() {
                Some(parent) => node = parent.to_path_buf(),
                None => break,
            }
        }
        None
    }
}

fn read_id(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_ascii_lowercase())
}

/// Apply the selection policy to the result of a scan.
///
/// The outcome depends only on the sets passed in, not their order:
/// * one vendor match: that port;
/// * several vendor matches: the first by path, flagged ambiguous;
/// * no vendor match: the first of all enumerated ports, flagged fallback;
/// * no ports at all: [`Error::NotFound`].
pub fn select(
    enumerated: &[PathBuf],
    identified: &[CandidateDevice],
    vendor_id: &str,
) -> Result<SelectedDevice> {
    let mut matches: Vec<&CandidateDevice> = identified
        .iter()
        .filter(|d| d.vendor_id.eq_ignore_ascii_case(vendor_id))
        .collect();
    matches.sort_by(|a, b| a.path.cmp(&b.path));

    match matches.as_slice() {
        [only] => {
            info!(device = %only.path.display(), vid = %vendor_id, "Selected serial device");
            Ok(SelectedDevice {
                path: only.path.clone(),
                device: Some((*only).clone()),
                selection: Selection::Matched,
            })
        }
        [first, rest @ ..] => {
            warn!(
                vid = %vendor_id,
                count = rest.len() + 1,
                "Multiple matching devices; using {}, pass the device path explicitly if this is wrong",
                first.path.display()
            );
            for other in rest {
                debug!(device = %other.path.display(), "Also matched");
            }
            Ok(SelectedDevice {
                path: first.path.clone(),
                device: Some((*first).clone()),
                selection: Selection::Ambiguous {
                    matches: rest.len() + 1,
                },
            })
        }
        [] => {
            let first = enumerated.iter().min().ok_or_else(|| {
                Error::NotFound(format!("no serial devices present (expected vendor {vendor_id})"))
            })?;
            warn!(
                vid = %vendor_id,
                "No device with the expected vendor ID; falling back to {}",
                first.display()
            );
            Ok(SelectedDevice {
                path: first.clone(),
                device: identified.iter().find(|d| &d.path == first).cloned(),
                selection: Selection::Fallback,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn candidate(path: &str, vid: &str) -> CandidateDevice {
        CandidateDevice {
            path: PathBuf::from(path),
            vendor_id: vid.to_string(),
            product_id: "1001".to_string(),
        }
    }

    fn paths(list: &[&str]) -> Vec<PathBuf> {
        list.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_single_match_selected() {
        let all = paths(&["/dev/x0", "/dev/x1"]);
        let ids = [candidate("/dev/x0", "303a"), candidate("/dev/x1", "1234")];
        let selected = select(&all, &ids, "303a").unwrap();
        assert_eq!(selected.path, PathBuf::from("/dev/x0"));
        assert_eq!(selected.selection, Selection::Matched);
    }

    #[test]
    fn test_no_match_falls_back_to_first() {
        let all = paths(&["/dev/x1", "/dev/x0"]);
        let ids = [candidate("/dev/x0", "1234"), candidate("/dev/x1", "5678")];
        let selected = select(&all, &ids, "303a").unwrap();
        assert_eq!(selected.path, PathBuf::from("/dev/x0"));
        assert_eq!(selected.selection, Selection::Fallback);
        assert_eq!(selected.device.unwrap().vendor_id, "1234");
    }

    #[test]
    fn test_fallback_considers_unidentified_ports() {
        let all = paths(&["/dev/ttyACM1", "/dev/ttyACM0"]);
        let ids = [candidate("/dev/ttyACM1", "1234")];
        let selected = select(&all, &ids, "303a").unwrap();
        assert_eq!(selected.path, PathBuf::from("/dev/ttyACM0"));
        assert_eq!(selected.device, None);
        assert_eq!(selected.selection, Selection::Fallback);
    }

    #[test]
    fn test_empty_is_not_found() {
        let err = select(&[], &[], "303a").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_vendor_match_ignores_case() {
        let all = paths(&["/dev/x0"]);
        let ids = [candidate("/dev/x0", "303a")];
        let selected = select(&all, &ids, "303A").unwrap();
        assert_eq!(selected.selection, Selection::Matched);
    }

    #[test]
    fn test_selection_independent_of_enumeration_order() {
        let mut all = paths(&[
            "/dev/ttyACM0",
            "/dev/ttyACM1",
            "/dev/ttyACM2",
            "/dev/ttyACM3",
            "/dev/ttyACM4",
        ]);
        let mut ids = vec![
            candidate("/dev/ttyACM0", "1234"),
            candidate("/dev/ttyACM1", "303a"),
            candidate("/dev/ttyACM2", "5678"),
            candidate("/dev/ttyACM3", "303a"),
            candidate("/dev/ttyACM4", "303a"),
        ];
        let mut rng = rand::rng();
        for _ in 0..50 {
            all.shuffle(&mut rng);
            ids.shuffle(&mut rng);
            let selected = select(&all, &ids, "303a").unwrap();
            assert_eq!(selected.path, PathBuf::from("/dev/ttyACM1"));
            assert_eq!(selected.selection, Selection::Ambiguous { matches: 3 });

            let fallback = select(&all, &ids, "ffff").unwrap();
            assert_eq!(fallback.path, PathBuf::from("/dev/ttyACM0"));
        }
    }

    /// A fake /dev and /sys tree.
    struct Fixture {
        root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir_all(root.path().join("dev")).unwrap();
            fs::create_dir_all(root.path().join("sys/class/tty")).unwrap();
            Self { root }
        }

        fn config(&self) -> DiscoveryConfig {
            DiscoveryConfig {
                device_dir: self.root.path().join("dev"),
                sysfs_tty_dir: self.root.path().join("sys/class/tty"),
                ..Default::default()
            }
        }

        fn scanner(&self) -> DeviceScanner {
            DeviceScanner::new(&self.config()).unwrap()
        }

        /// Add a tty whose USB device node sits `depth` levels above the
        /// node its `device` link points at.
        fn add_tty(&self, name: &str, ids: Option<(&str, &str)>, depth: usize) {
            fs::write(self.root.path().join("dev").join(name), b"").unwrap();

            let usb = self
                .root
                .path()
                .join("sys/devices/pci0000:00/usb1")
                .join(format!("1-{name}"));
            let mut iface = usb.clone();
            for level in 0..depth {
                iface = iface.join(format!("{name}:1.{level}"));
            }
            fs::create_dir_all(&iface).unwrap();
            if let Some((vid, pid)) = ids {
                fs::write(usb.join("idVendor"), format!("{vid}\n")).unwrap();
                fs::write(usb.join("idProduct"), format!("{pid}\n")).unwrap();
            }

            let class = self.root.path().join("sys/class/tty").join(name);
            fs::create_dir_all(&class).unwrap();
            symlink(&iface, class.join("device")).unwrap();
        }
    }

    #[test]
    fn test_scan_reads_ids_through_sysfs() {
        let fixture = Fixture::new();
        fixture.add_tty("ttyACM0", Some(("1a86", "55d4")), 1);
        fixture.add_tty("ttyACM1", Some(("303A", "1001")), 1);
        fs::write(fixture.root.path().join("dev/ttyS0"), b"").unwrap();

        let scan = fixture.scanner().scan().unwrap();
        assert_eq!(scan.enumerated.len(), 2);
        assert_eq!(scan.identified.len(), 2);
        assert_eq!(scan.identified[1].vendor_id, "303a");
        assert_eq!(scan.identified[1].product_id, "1001");
        assert!(scan.skipped.is_empty());

        let selected = fixture.scanner().discover("303a").unwrap();
        assert!(selected.path.ends_with("ttyACM1"));
        assert_eq!(selected.selection, Selection::Matched);
    }

    #[test]
    fn test_scan_respects_depth_bound() {
        let fixture = Fixture::new();
        fixture.add_tty("ttyACM0", Some(("303a", "1001")), 4);
        fixture.add_tty("ttyACM1", Some(("303a", "1001")), 5);

        let scan = fixture.scanner().scan().unwrap();
        assert_eq!(scan.identified.len(), 1);
        assert!(scan.identified[0].path.ends_with("ttyACM0"));
        assert_eq!(scan.skipped.len(), 1);
        assert!(matches!(scan.skipped[0].1, SkipReason::NoUsbParent));
    }

    #[test]
    fn test_port_without_ids_still_eligible_for_fallback() {
        let fixture = Fixture::new();
        fixture.add_tty("ttyACM0", None, 1);

        let selected = fixture.scanner().discover("303a").unwrap();
        assert!(selected.path.ends_with("ttyACM0"));
        assert_eq!(selected.selection, Selection::Fallback);
    }

    #[test]
    fn test_missing_sysfs_entry_is_skipped() {
        let fixture = Fixture::new();
        fs::write(fixture.root.path().join("dev/ttyACM5"), b"").unwrap();

        let scan = fixture.scanner().scan().unwrap();
        assert_eq!(scan.enumerated.len(), 1);
        assert!(scan.identified.is_empty());
        assert_eq!(scan.skipped.len(), 1);
    }

    #[test]
    fn test_no_ports_is_not_found() {
        let fixture = Fixture::new();
        let err = fixture.scanner().discover("303a").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_missing_device_dir_is_empty() {
        let config = DiscoveryConfig {
            device_dir: PathBuf::from("/nonexistent/dev"),
            ..Default::default()
        };
        let scan = DeviceScanner::new(&config).unwrap().scan().unwrap();
        assert!(scan.enumerated.is_empty());
    }
}
