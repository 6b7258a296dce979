//! Queue of activation requests waiting on another device.
//!
//! A request that cannot start yet (its device is mid-attempt, or its master
//! has not finished link-layer configuration) is parked here with the
//! constraints it waits on. When a constraint is satisfied the request
//! becomes ready and the controller drains it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::profile::ConnectionProfile;

/// A condition a queued activation waits for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constraint {
    /// The named device has no attempt or teardown in flight.
    DeviceIdle(String),
    /// The named master finished link-layer configuration.
    MasterReady(String),
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::DeviceIdle(iface) => write!(f, "device-idle:{}", iface),
            Constraint::MasterReady(iface) => write!(f, "master-ready:{}", iface),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    profile: Arc<ConnectionProfile>,
    constraints: HashSet<Constraint>,
}

/// Pending activations keyed by connection UUID.
///
/// A newer request for the same connection replaces the older one.
#[derive(Debug, Default)]
pub struct PendingActivations {
    entries: HashMap<String, PendingEntry>,
    waiters: HashMap<Constraint, HashSet<String>>,
}

impl PendingActivations {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if a request for this connection is queued.
    pub fn contains(&self, uuid: &str) -> bool {
        self.entries.contains_key(uuid)
    }

    /// Queues `profile` until every constraint is satisfied.
    pub fn add(
        &mut self,
        profile: Arc<ConnectionProfile>,
        constraints: impl IntoIterator<Item = Constraint>,
    ) {
        let key = profile.uuid().to_string();
        self.remove(&key);

        let constraints: HashSet<Constraint> = constraints.into_iter().collect();
        for constraint in &constraints {
            self.waiters
                .entry(constraint.clone())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(
            key,
            PendingEntry {
                profile,
                constraints,
            },
        );
    }

    /// Drops a queued request.
    pub fn remove(&mut self, uuid: &str) -> Option<Arc<ConnectionProfile>> {
        let entry = self.entries.remove(uuid)?;
        for constraint in &entry.constraints {
            if let Some(waiters) = self.waiters.get_mut(constraint) {
                waiters.remove(uuid);
                if waiters.is_empty() {
                    self.waiters.remove(constraint);
                }
            }
        }
        Some(entry.profile)
    }

    /// Drops every request bound to interface `iface`.
    pub fn remove_for_interface(&mut self, iface: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.profile.interface_name() == Some(iface))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// Marks `constraint` satisfied. Returns the UUIDs that became ready.
    pub fn satisfy(&mut self, constraint: &Constraint) -> Vec<String> {
        let mut ready = Vec::new();
        if let Some(keys) = self.waiters.remove(constraint) {
            for key in keys {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.constraints.remove(constraint);
                    if entry.constraints.is_empty() {
                        ready.push(key);
                    }
                }
            }
        }
        ready
    }

    /// Removes and returns every request with no constraints left.
    pub fn drain_ready(&mut self) -> Vec<Arc<ConnectionProfile>> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.constraints.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter().filter_map(|k| self.remove(&k)).collect()
    }

    /// Returns the constraints a queued request still waits on.
    pub fn constraints(&self, uuid: &str) -> Option<&HashSet<Constraint>> {
        self.entries.get(uuid).map(|e| &e.constraints)
    }
}
