//! OS-level interface probing.
//!
//! Administrative state comes from `/sys/class/net/<if>/flags` (the `IFF_UP`
//! bit), which is what `ip link set <if> up|down` toggles. IPv4 presence comes
//! from `getifaddrs(3)`; sysfs does not expose addresses.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::debug;

/// Answers the two questions interface selection needs.
pub trait InterfaceProbe: Send + Sync {
    fn is_interface_up(&self, name: &str) -> bool;
    fn has_ipv4(&self, name: &str) -> bool;
}

const IFF_UP: u32 = 0x1;

pub struct SysfsProbe {
    root: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

impl SysfsProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl InterfaceProbe for SysfsProbe {
    fn is_interface_up(&self, name: &str) -> bool {
        let path = self.root.join(name).join("flags");
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return false;
        };
        match parse_flags(&raw) {
            Some(flags) => flags & IFF_UP != 0,
            None => {
                debug!(path = %path.display(), raw = raw.trim(), "Unparseable interface flags");
                false
            }
        }
    }

    fn has_ipv4(&self, name: &str) -> bool {
        match ipv4_interfaces() {
            Ok(names) => names.contains(name),
            Err(e) => {
                debug!(interface = name, error = %e, "getifaddrs failed");
                false
            }
        }
    }
}

/// sysfs writes flags as `0x1003\n`.
fn parse_flags(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    u32::from_str_radix(hex, 16).ok()
}

/// Names of all interfaces holding at least one IPv4 address.
#[cfg(unix)]
fn ipv4_interfaces() -> std::io::Result<HashSet<String>> {
    use std::ffi::CStr;

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills `head` with a list we own until freeifaddrs.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut names = HashSet::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: cursor is a non-null node of the list returned above; the
        // list is not freed until after the loop.
        let ifa = unsafe { &*cursor };
        if !ifa.ifa_addr.is_null() {
            // SAFETY: ifa_addr is non-null and points at a sockaddr header.
            let family = unsafe { (*ifa.ifa_addr).sa_family } as i32;
            if family == libc::AF_INET && !ifa.ifa_name.is_null() {
                // SAFETY: ifa_name is a NUL-terminated C string owned by the list.
                let name = unsafe { CStr::from_ptr(ifa.ifa_name) };
                names.insert(name.to_string_lossy().into_owned());
            }
        }
        cursor = ifa.ifa_next;
    }

    // SAFETY: head came from a successful getifaddrs and is freed exactly once.
    unsafe { libc::freeifaddrs(head) };
    Ok(names)
}

#[cfg(not(unix))]
fn ipv4_interfaces() -> std::io::Result<HashSet<String>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "interface address probing requires a Unix host",
    ))
}
