//! Network path selection for the device agent.
//!
//! A device may have several uplinks (wired, Wi-Fi, a cellular modem). Each is
//! described by an `InterfaceDescriptor` with a static priority; the selector
//! reports the most preferred one that is usable right now. "Usable" means the
//! OS interface is administratively up and carries an IPv4 address.
//!
//! Selection is a read-only query. It does not bring links up or touch routes.

mod identity;
mod probe;

pub use identity::{DeviceIdentity, IdentitySource};
pub use probe::{InterfaceProbe, SysfsProbe};

use serde::Deserialize;
use tracing::debug;
use wire_protocol::ConnectionType;

/// One candidate network path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InterfaceDescriptor {
    /// Logical label reported to the broker.
    pub name: ConnectionType,
    /// Lower is more preferred. Expected to be distinct across descriptors.
    pub priority: u32,
    /// OS interface to probe, e.g. `eth0`.
    pub system_handle: String,
}

impl InterfaceDescriptor {
    pub fn new(name: ConnectionType, priority: u32, system_handle: impl Into<String>) -> Self {
        Self { name, priority, system_handle: system_handle.into() }
    }
}

/// Uplinks of the stock camera board.
pub fn default_descriptors() -> Vec<InterfaceDescriptor> {
    vec![
        InterfaceDescriptor::new(ConnectionType::Ethernet, 1, "eth0"),
        InterfaceDescriptor::new(ConnectionType::Wifi,     2, "wlan0"),
        InterfaceDescriptor::new(ConnectionType::Cellular, 3, "ppp0"),
    ]
}

/// Most preferred usable descriptor, probing each one exactly once.
///
/// If two usable descriptors share a priority (a misconfiguration), the one
/// that comes first in `descriptors` wins. That outcome is not meaningful but
/// it is stable.
pub fn select<'a>(
    descriptors: &'a [InterfaceDescriptor],
    probe: &dyn InterfaceProbe,
) -> Option<&'a InterfaceDescriptor> {
    let mut best: Option<&InterfaceDescriptor> = None;

    for desc in descriptors {
        let handle = desc.system_handle.as_str();
        if !(probe.is_interface_up(handle) && probe.has_ipv4(handle)) {
            continue;
        }
        debug!(connection = %desc.name, interface = handle, "Found available connection");

        match best {
            Some(current) if current.priority <= desc.priority => {}
            _ => best = Some(desc),
        }
    }

    best
}

/// Label of the best usable path, or `None` when the device is offline.
pub fn best_connection(
    descriptors: &[InterfaceDescriptor],
    probe: &dyn InterfaceProbe,
) -> Option<ConnectionType> {
    select(descriptors, probe).map(|d| d.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Probe answering from a fixed up/down table; counts probes per interface.
    #[derive(Default)]
    struct TableProbe {
        up:     HashSet<String>,
        probed: Mutex<HashMap<String, usize>>,
    }

    impl TableProbe {
        fn with_up(names: &[&str]) -> Self {
            Self { up: names.iter().map(|s| s.to_string()).collect(), ..Default::default() }
        }
    }

    impl InterfaceProbe for TableProbe {
        fn is_interface_up(&self, name: &str) -> bool {
            *self.probed.lock().unwrap().entry(name.to_string()).or_default() += 1;
            self.up.contains(name)
        }
        fn has_ipv4(&self, name: &str) -> bool {
            self.up.contains(name)
        }
    }

    #[test]
    fn prefers_lowest_priority_up_interface() {
        let table = default_descriptors();

        let probe = TableProbe::with_up(&["eth0", "wlan0"]);
        assert_eq!(best_connection(&table, &probe), Some(ConnectionType::Ethernet));

        let probe = TableProbe::with_up(&["wlan0"]);
        assert_eq!(best_connection(&table, &probe), Some(ConnectionType::Wifi));

        let probe = TableProbe::with_up(&[]);
        assert_eq!(best_connection(&table, &probe), None);
    }

    #[test]
    fn descriptor_order_does_not_matter() {
        let mut table = default_descriptors();
        table.reverse();
        let probe = TableProbe::with_up(&["ppp0", "wlan0"]);
        assert_eq!(best_connection(&table, &probe), Some(ConnectionType::Wifi));
    }

    #[test]
    fn each_interface_probed_once_per_call() {
        let table = default_descriptors();
        let probe = TableProbe::with_up(&["eth0", "wlan0", "ppp0"]);
        best_connection(&table, &probe);
        let probed = probe.probed.lock().unwrap();
        assert_eq!(probed.len(), 3);
        assert!(probed.values().all(|&n| n == 1));
    }

    #[test]
    fn duplicate_priority_resolves_to_first_listed() {
        let table = vec![
            InterfaceDescriptor::new(ConnectionType::Cellular, 1, "ppp0"),
            InterfaceDescriptor::new(ConnectionType::Wifi,     1, "wlan0"),
        ];
        let probe = TableProbe::with_up(&["ppp0", "wlan0"]);
        for _ in 0..3 {
            assert_eq!(best_connection(&table, &probe), Some(ConnectionType::Cellular));
        }
    }

    #[test]
    fn up_without_address_is_not_usable() {
        struct NoAddress;
        impl InterfaceProbe for NoAddress {
            fn is_interface_up(&self, _: &str) -> bool { true }
            fn has_ipv4(&self, name: &str) -> bool { name == "ppp0" }
        }
        let table = default_descriptors();
        assert_eq!(best_connection(&table, &NoAddress), Some(ConnectionType::Cellular));
    }

    #[test]
    fn descriptors_deserialize_from_yaml() {
        let yaml = "- { name: wifi, priority: 1, system_handle: wlan1 }\n";
        let table: Vec<InterfaceDescriptor> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table, vec![InterfaceDescriptor::new(ConnectionType::Wifi, 1, "wlan1")]);
    }
}
