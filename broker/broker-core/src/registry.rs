//! Device registry — the single source of truth for which devices are live.
//!
//! Each connected device has one `DeviceEntry`, keyed by `device_id`, in a
//! `DashMap`. Writers are the device connection handlers (register, refresh,
//! deregister) and the staleness sweeper (evict). Readers are status requests.
//!
//! Every mutation happens under the entry's shard lock and replaces whole
//! fields, so a concurrent reader never sees half an update. `snapshot()`
//! copies out and releases the locks before the caller formats anything.
//!
//! The registry never owns a transport. It keeps the sending half of the
//! connection handler's outbound queue, which is how the broker reaches a
//! device; the handler's writer task is the only thing touching the socket.
//!
//! Reconnect without close: `upsert` for an id that is already present
//! replaces the entry, including the link. The superseded connection is not
//! closed here; its handler keeps running until its socket errors or closes,
//! and because it deregisters with `remove_session`, it cannot evict the entry
//! that replaced it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use wire_protocol::{ConnectionType, DeviceStatus, ServerMessage, SessionStatus};

// ──────────────────────────────────────────────────────────────────────────────
// Session identity
// ──────────────────────────────────────────────────────────────────────────────

/// Identifies one accepted device connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Non-owning route to a device connection.
#[derive(Debug, Clone)]
pub struct DeviceLink {
    pub session:  SessionId,
    pub outbound: mpsc::Sender<ServerMessage>,
}

// ──────────────────────────────────────────────────────────────────────────────
// Registry
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct DeviceEntry {
    connection_type: ConnectionType,
    last_seen:       DateTime<Utc>,
    link:            DeviceLink,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self { devices: DashMap::with_capacity(64) }
    }

    /// Register `device_id`, replacing any previous entry.
    ///
    /// Returns the session that was replaced, if any. `last_seen` never moves
    /// backwards, even across a replacement.
    pub fn upsert(
        &self,
        device_id:       &str,
        connection_type: ConnectionType,
        now:             DateTime<Utc>,
        link:            DeviceLink,
    ) -> Option<SessionId> {
        match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let last_seen = occupied.get().last_seen.max(now);
                let previous = occupied.insert(DeviceEntry { connection_type, last_seen, link });
                Some(previous.link.session)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DeviceEntry { connection_type, last_seen: now, link });
                None
            }
        }
    }

    /// Refresh liveness and connection type of a registered device.
    /// Returns false (and changes nothing) when the id is unknown.
    pub fn touch(&self, device_id: &str, now: DateTime<Utc>, connection_type: ConnectionType) -> bool {
        match self.devices.get_mut(device_id) {
            Some(mut entry) => {
                entry.last_seen = entry.last_seen.max(now);
                entry.connection_type = connection_type;
                true
            }
            None => false,
        }
    }

    /// Refresh liveness only, and only if the entry still belongs to `session`.
    pub fn refresh_session(&self, device_id: &str, session: SessionId, now: DateTime<Utc>) -> bool {
        match self.devices.get_mut(device_id) {
            Some(mut entry) if entry.link.session == session => {
                entry.last_seen = entry.last_seen.max(now);
                true
            }
            _ => false,
        }
    }

    /// `touch`, but only if the entry still belongs to `session`.
    pub fn touch_session(
        &self,
        device_id:       &str,
        session:         SessionId,
        now:             DateTime<Utc>,
        connection_type: ConnectionType,
    ) -> bool {
        match self.devices.get_mut(device_id) {
            Some(mut entry) if entry.link.session == session => {
                entry.last_seen = entry.last_seen.max(now);
                entry.connection_type = connection_type;
                true
            }
            _ => false,
        }
    }

    /// Delete the entry. Idempotent; returns whether something was removed.
    pub fn remove(&self, device_id: &str) -> bool {
        self.devices.remove(device_id).is_some()
    }

    /// Delete the entry only if it still belongs to `session`.
    pub fn remove_session(&self, device_id: &str, session: SessionId) -> bool {
        self.devices
            .remove_if(device_id, |_, entry| entry.link.session == session)
            .is_some()
    }

    /// Remove every entry whose `last_seen` is more than `threshold` before
    /// `now`. Staleness is re-checked under the entry lock, so a device that
    /// refreshes between the scan and the removal is kept.
    pub fn evict_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> Vec<String> {
        let candidates: Vec<String> = self
            .devices
            .iter()
            .filter(|entry| now - entry.last_seen > threshold)
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|id| {
                self.devices
                    .remove_if(id, |_, entry| now - entry.last_seen > threshold)
                    .is_some()
            })
            .collect()
    }

    /// Point-in-time copy of all entries, sorted by device id.
    pub fn snapshot(&self) -> BTreeMap<String, DeviceStatus> {
        self.devices
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    DeviceStatus {
                        connection_type: entry.connection_type,
                        last_seen:       entry.last_seen,
                        status:          SessionStatus::Connected,
                    },
                )
            })
            .collect()
    }

    /// Queue `message` for the device's connection. Never waits: returns false
    /// if the device is unknown, its queue is full, or its handler has exited.
    pub fn send_to(&self, device_id: &str, message: ServerMessage) -> bool {
        let outbound = match self.devices.get(device_id) {
            Some(entry) => entry.link.outbound.clone(),
            None => return false,
        };
        outbound.try_send(message).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn session_of(&self, device_id: &str) -> Option<SessionId> {
        self.devices.get(device_id).map(|entry| entry.link.session)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn link() -> (DeviceLink, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (DeviceLink { session: SessionId::next(), outbound: tx }, rx)
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let registry = DeviceRegistry::new();
        let t0 = Utc::now();
        let (first, _rx1) = link();
        let (second, _rx2) = link();
        let second_session = second.session;

        assert_eq!(registry.upsert("D1", ConnectionType::Ethernet, t0, first.clone()), None);
        let replaced = registry.upsert("D1", ConnectionType::Cellular, t0 + Duration::seconds(1), second);
        assert_eq!(replaced, Some(first.session));

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap["D1"].connection_type, ConnectionType::Cellular);
        assert!(snap["D1"].last_seen >= t0);
        assert_eq!(registry.session_of("D1"), Some(second_session));
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let registry = DeviceRegistry::new();
        let t0 = Utc::now();
        let (l, _rx) = link();
        registry.upsert("D1", ConnectionType::Wifi, t0, l.clone());

        assert!(registry.touch("D1", t0 - Duration::seconds(5), ConnectionType::Wifi));
        assert_eq!(registry.snapshot()["D1"].last_seen, t0);

        registry.upsert("D1", ConnectionType::Wifi, t0 - Duration::seconds(9), l);
        assert_eq!(registry.snapshot()["D1"].last_seen, t0);
    }

    #[test]
    fn touch_updates_type_and_ignores_unknown_ids() {
        let registry = DeviceRegistry::new();
        let t0 = Utc::now();
        let (l, _rx) = link();
        registry.upsert("D1", ConnectionType::Ethernet, t0, l);

        assert!(registry.touch("D1", t0 + Duration::seconds(3), ConnectionType::Wifi));
        let snap = registry.snapshot();
        assert_eq!(snap["D1"].connection_type, ConnectionType::Wifi);
        assert_eq!(snap["D1"].last_seen, t0 + Duration::seconds(3));

        assert!(!registry.touch("ghost", t0, ConnectionType::Wifi));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = DeviceRegistry::new();
        let (l, _rx) = link();
        registry.upsert("D1", ConnectionType::Wifi, Utc::now(), l);

        assert!(registry.remove("D1"));
        assert!(!registry.remove("D1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn superseded_session_cannot_evict_replacement() {
        let registry = DeviceRegistry::new();
        let now = Utc::now();
        let (old, _rx1) = link();
        let (new, _rx2) = link();
        registry.upsert("D1", ConnectionType::Wifi, now, old.clone());
        registry.upsert("D1", ConnectionType::Wifi, now, new.clone());

        assert!(!registry.remove_session("D1", old.session));
        assert!(!registry.refresh_session("D1", old.session, now));
        assert!(!registry.touch_session("D1", old.session, now, ConnectionType::Cellular));
        assert_eq!(registry.snapshot()["D1"].connection_type, ConnectionType::Wifi);
        assert!(registry.touch_session("D1", new.session, now, ConnectionType::Cellular));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove_session("D1", new.session));
        assert!(registry.is_empty());
    }

    #[test]
    fn evicts_only_stale_entries() {
        let registry = DeviceRegistry::new();
        let now = Utc::now();
        let (a, _rx1) = link();
        let (b, _rx2) = link();
        registry.upsert("old", ConnectionType::Wifi, now - Duration::seconds(31), a);
        registry.upsert("young", ConnectionType::Wifi, now - Duration::seconds(29), b);

        let evicted = registry.evict_stale(now, Duration::seconds(30));
        assert_eq!(evicted, vec!["old".to_string()]);
        let snap = registry.snapshot();
        assert!(!snap.contains_key("old"));
        assert!(snap.contains_key("young"));
    }

    #[tokio::test]
    async fn send_to_reaches_the_connection_queue() {
        let registry = DeviceRegistry::new();
        let (l, mut rx) = link();
        registry.upsert("D1", ConnectionType::Wifi, Utc::now(), l);

        assert!(registry.send_to("D1", ServerMessage::CaptureRequest));
        assert_eq!(rx.recv().await, Some(ServerMessage::CaptureRequest));

        assert!(!registry.send_to("ghost", ServerMessage::CaptureRequest));
        drop(rx);
        assert!(!registry.send_to("D1", ServerMessage::CaptureRequest));
    }

    #[test]
    fn concurrent_writers_leave_one_entry_per_device() {
        let registry = std::sync::Arc::new(DeviceRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = std::sync::Arc::clone(&registry);
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let (tx, _rx) = mpsc::channel(1);
                        let id = format!("D{}", n % 4);
                        let link = DeviceLink { session: SessionId::next(), outbound: tx };
                        registry.upsert(&id, ConnectionType::Wifi, Utc::now(), link);
                        registry.touch(&id, Utc::now(), ConnectionType::Cellular);
                        if i % 2 == 0 {
                            registry.snapshot();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 4);
    }
}
