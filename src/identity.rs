use std::fs;
use std::path::Path;

use crate::config::Config;

pub const UNKNOWN_NETWORK_ID: &str = "unknown";

/// Who produced a record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: u32,
    pub operator: String,
    /// MAC address of the logging interface
    pub network_id: String,
}

impl DeviceIdentity {
    pub fn resolve(config: &Config) -> Self {
        let iface = &config.devices.network_interface;
        let network_id = read_mac_address(Path::new("/sys/class/net"), iface).unwrap_or_else(|| {
            log::warn!(
                "Could not read MAC address of {}, records will carry '{}'",
                iface,
                UNKNOWN_NETWORK_ID
            );
            UNKNOWN_NETWORK_ID.to_string()
        });

        DeviceIdentity {
            device_id: config.user.bike_nr,
            operator: config.user.studentname.clone(),
            network_id,
        }
    }
}

fn read_mac_address(sysfs_net: &Path, iface: &str) -> Option<String> {
    let raw = fs::read_to_string(sysfs_net.join(iface).join("address")).ok()?;
    let mac = raw.trim();
    if mac.is_empty() {
        None
    } else {
        Some(mac.to_string())
    }
}
