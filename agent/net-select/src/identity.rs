//! Stable device identifier.
//!
//! Resolution order:
//! 1. an id file provisioned at install time,
//! 2. the hardware address of the first non-loopback interface,
//! 3. a generated id (changes across restarts; logged so it stands out).

use std::path::Path;

use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    IdFile,
    HardwareAddress { interface: String },
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub source:    IdentitySource,
}

impl DeviceIdentity {
    /// `sysfs_root` is normally `/sys/class/net`.
    pub fn resolve(id_file: &Path, sysfs_root: &Path) -> Self {
        let identity = Self::from_id_file(id_file)
            .or_else(|| Self::from_hardware_address(sysfs_root))
            .unwrap_or_else(Self::generated);

        match &identity.source {
            IdentitySource::Generated => warn!(
                device_id = %identity.device_id,
                id_file   = %id_file.display(),
                "No provisioned id or hardware address; using a generated device id"
            ),
            source => info!(device_id = %identity.device_id, source = ?source, "Device identity resolved"),
        }
        identity
    }

    fn from_id_file(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        let id = raw.trim();
        if id.is_empty() {
            return None;
        }
        Some(Self { device_id: id.to_string(), source: IdentitySource::IdFile })
    }

    fn from_hardware_address(sysfs_root: &Path) -> Option<Self> {
        let mut names: Vec<String> = std::fs::read_dir(sysfs_root)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "lo")
            .collect();
        names.sort();

        names.into_iter().find_map(|name| {
            let raw = std::fs::read_to_string(sysfs_root.join(&name).join("address")).ok()?;
            let mac: String = raw
                .trim()
                .chars()
                .filter(|c| *c != ':')
                .map(|c| c.to_ascii_lowercase())
                .collect();
            if mac.is_empty() || mac.chars().all(|c| c == '0') {
                return None;
            }
            Some(Self {
                device_id: mac,
                source:    IdentitySource::HardwareAddress { interface: name },
            })
        })
    }

    fn generated() -> Self {
        Self {
            device_id: format!("device-{}", uuid::Uuid::new_v4().simple()),
            source:    IdentitySource::Generated,
        }
    }
}
