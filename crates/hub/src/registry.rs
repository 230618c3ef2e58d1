//! Directory of admitted agents and the groups they joined.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};

use cstate_protocol::envelope::Message;
use cstate_protocol::types::now_millis;
use cstate_protocol::{AgentStats, Stats};

use crate::AdmissionError;
use crate::peer::Peer;

struct RegistryEntry {
    peer: Peer,
    stats: AgentStats,
}

#[derive(Default)]
struct RegistryInner {
    entries: BTreeMap<String, RegistryEntry>,
    /// Group name to member connections, keyed by connection id.
    rooms: HashMap<String, HashMap<u64, Peer>>,
}

/// Live agents keyed by name, with their statistics and group memberships.
///
/// Owned by the hub. Outside the crate the registry is read-only:
///
/// ```compile_fail
/// fn force_join(registry: &cstate_hub::Registry, peer: &cstate_hub::Peer) {
///     registry.join("all", peer);
/// }
/// ```
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits `peer` under its name with fresh statistics.
    pub(crate) fn admit(&self, peer: &Peer) -> Result<(), AdmissionError> {
        let name = peer.name();
        if name.is_empty() {
            return Err(AdmissionError::EmptyName);
        }
        let mut inner = self.lock();
        if inner.entries.contains_key(name) {
            return Err(AdmissionError::Duplicate(name.to_string()));
        }
        inner.entries.insert(
            name.to_string(),
            RegistryEntry {
                peer: peer.clone(),
                stats: AgentStats::new(now_millis()),
            },
        );
        Ok(())
    }

    /// Removes `peer` from every group, and its entry if this connection
    /// owns it. Returns `true` if the entry was removed.
    pub(crate) fn remove(&self, peer: &Peer) -> bool {
        let mut inner = self.lock();
        let conn_id = peer.conn_id();
        inner.rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });

        let owned = inner
            .entries
            .get(peer.name())
            .is_some_and(|e| e.peer.conn_id() == conn_id);
        if owned {
            inner.entries.remove(peer.name());
        }
        owned
    }

    /// Adds `peer` to the group `room`.
    pub(crate) fn join(&self, room: &str, peer: &Peer) {
        self.lock()
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(peer.conn_id(), peer.clone());
    }

    /// Number of connections in `room`.
    pub fn room_size(&self, room: &str) -> usize {
        self.lock().rooms.get(room).map_or(0, HashMap::len)
    }

    pub fn peer(&self, name: &str) -> Option<Peer> {
        self.lock().entries.get(name).map(|e| e.peer.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Shallow-merges `report` into `name`'s statistics and refreshes its
    /// last-seen time. Unknown names are ignored.
    pub(crate) fn merge_stats(&self, name: &str, report: Stats) {
        if let Some(entry) = self.lock().entries.get_mut(name) {
            entry.stats.merge(report, now_millis());
        }
    }

    /// Names of every live agent, sorted.
    pub fn names(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Statistics of one agent as a JSON object.
    pub fn stats(&self, name: &str) -> Option<Value> {
        let inner = self.lock();
        let entry = inner.entries.get(name)?;
        serde_json::to_value(&entry.stats).ok()
    }

    /// Statistics of every live agent: name to statistics object.
    pub fn stats_all(&self) -> Map<String, Value> {
        self.lock()
            .entries
            .iter()
            .filter_map(|(name, e)| Some((name.clone(), serde_json::to_value(&e.stats).ok()?)))
            .collect()
    }

    /// Sends `msg` once to every connection in any of `rooms`.
    ///
    /// Returns the number of connections the message was queued for.
    pub(crate) fn broadcast(&self, rooms: &[&str], msg: &Message) -> usize {
        let targets: Vec<Peer> = {
            let inner = self.lock();
            let mut unique: HashMap<u64, Peer> = HashMap::new();
            for room in rooms {
                if let Some(members) = inner.rooms.get(*room) {
                    for (id, peer) in members {
                        unique.entry(*id).or_insert_with(|| peer.clone());
                    }
                }
            }
            unique.into_values().collect()
        };

        targets.iter().filter(|p| p.send_msg(msg).is_ok()).count()
    }
}
