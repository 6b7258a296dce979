//! In-memory kernel simulation.
//!
//! Backs `--dry-run` in the daemon and every state-machine test. Each call is
//! appended to an operation log so callers can assert the exact sequence of
//! kernel mutations, and individual operations can be made to fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{PlatformError, PlatformResult};
use crate::link::{LinkType, PlatformLink};
use crate::platform::Platform;

/// Master attributes the kernel models as a set edited with `+value`/`-value`.
pub const SET_VALUED_ATTRIBUTES: &[&str] = &["arp_ip_target"];

/// First ifindex handed out by the simulation (1 is reserved for `lo`).
const FIRST_IFINDEX: i32 = 2;

/// One recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformOp {
    /// `create_master_link`
    CreateLink {
        /// Interface name.
        name: String,
        /// Link type.
        link_type: LinkType,
    },
    /// `link_delete`
    DeleteLink {
        /// Interface index.
        ifindex: i32,
    },
    /// `enslave`
    Enslave {
        /// Master interface index.
        master: i32,
        /// Slave interface index.
        slave: i32,
    },
    /// `release`
    Release {
        /// Master interface index.
        master: i32,
        /// Slave interface index.
        slave: i32,
    },
    /// `set_master_attribute`
    SetAttribute {
        /// Master interface index.
        ifindex: i32,
        /// Attribute name.
        name: String,
        /// Value written.
        value: String,
    },
    /// `get_master_attribute`
    GetAttribute {
        /// Master interface index.
        ifindex: i32,
        /// Attribute name.
        name: String,
    },
    /// `link_set_up`
    LinkUp {
        /// Interface index.
        ifindex: i32,
    },
    /// `link_set_down`
    LinkDown {
        /// Interface index.
        ifindex: i32,
    },
}

#[derive(Debug, Default)]
struct Faults {
    attributes: HashSet<String>,
    enslave: bool,
    release: bool,
    create: bool,
    link_up: HashSet<i32>,
}

#[derive(Debug)]
struct State {
    next_ifindex: i32,
    links: BTreeMap<i32, PlatformLink>,
    attributes: HashMap<(i32, String), String>,
    set_attributes: HashMap<(i32, String), Vec<String>>,
    ops: Vec<PlatformOp>,
    faults: Faults,
}

impl State {
    fn link_mut(&mut self, ifindex: i32) -> PlatformResult<&mut PlatformLink> {
        self.links
            .get_mut(&ifindex)
            .ok_or_else(|| PlatformError::link_not_found(ifindex))
    }

    fn ensure_link(&self, ifindex: i32) -> PlatformResult<()> {
        if self.links.contains_key(&ifindex) {
            Ok(())
        } else {
            Err(PlatformError::link_not_found(ifindex))
        }
    }
}

/// Kernel simulation with an operation log and fault injection.
pub struct InMemoryPlatform {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl InMemoryPlatform {
    /// Creates an empty simulation.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_ifindex: FIRST_IFINDEX,
                links: BTreeMap::new(),
                attributes: HashMap::new(),
                set_attributes: HashMap::new(),
                ops: Vec::new(),
                faults: Faults::default(),
            }),
            latency: None,
        }
    }

    /// Makes every mutating call sleep before it takes effect, so concurrent
    /// callers interleave.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Seeds an existing kernel link (e.g. a physical NIC) and returns its ifindex.
    pub fn add_link(&self, name: &str, link_type: LinkType) -> i32 {
        let mut state = self.state.lock();
        let ifindex = state.next_ifindex;
        state.next_ifindex += 1;
        state
            .links
            .insert(ifindex, PlatformLink::new(ifindex, name, link_type));
        ifindex
    }

    /// Sets the physical port id of a seeded link.
    pub fn set_physical_port_id(&self, ifindex: i32, port_id: &str) {
        if let Some(link) = self.state.lock().links.get_mut(&ifindex) {
            link.physical_port_id = Some(port_id.to_string());
        }
    }

    /// Seeds a kernel-reported attribute value without logging an operation.
    pub fn seed_attribute(&self, ifindex: i32, name: &str, value: &str) {
        let mut state = self.state.lock();
        if SET_VALUED_ATTRIBUTES.contains(&name) {
            let items = value.split_whitespace().map(str::to_string).collect();
            state.set_attributes.insert((ifindex, name.to_string()), items);
        } else {
            state
                .attributes
                .insert((ifindex, name.to_string()), value.to_string());
        }
    }

    /// Simulates the kernel link disappearing underneath the daemon.
    pub fn remove_link(&self, ifindex: i32) {
        let mut state = self.state.lock();
        state.links.remove(&ifindex);
        state.attributes.retain(|(idx, _), _| *idx != ifindex);
        state.set_attributes.retain(|(idx, _), _| *idx != ifindex);
        for link in state.links.values_mut() {
            if link.master == Some(ifindex) {
                link.master = None;
            }
        }
    }

    /// Returns a copy of the operation log.
    pub fn ops(&self) -> Vec<PlatformOp> {
        self.state.lock().ops.clone()
    }

    /// Clears the operation log.
    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    /// Returns the current attribute value without logging a read.
    pub fn attribute(&self, ifindex: i32, name: &str) -> Option<String> {
        let state = self.state.lock();
        let key = (ifindex, name.to_string());
        if let Some(items) = state.set_attributes.get(&key) {
            return Some(items.join(" "));
        }
        state.attributes.get(&key).cloned()
    }

    /// Returns a copy of the link, if it exists.
    pub fn link(&self, ifindex: i32) -> Option<PlatformLink> {
        self.state.lock().links.get(&ifindex).cloned()
    }

    /// Makes writes of the named attribute fail.
    pub fn fail_attribute(&self, name: &str) {
        self.state.lock().faults.attributes.insert(name.to_string());
    }

    /// Makes `enslave` fail.
    pub fn fail_enslave(&self, fail: bool) {
        self.state.lock().faults.enslave = fail;
    }

    /// Makes `release` fail.
    pub fn fail_release(&self, fail: bool) {
        self.state.lock().faults.release = fail;
    }

    /// Makes `create_master_link` fail.
    pub fn fail_create(&self, fail: bool) {
        self.state.lock().faults.create = fail;
    }

    /// Makes `link_set_up` fail for one link.
    pub fn fail_link_up(&self, ifindex: i32) {
        self.state.lock().faults.link_up.insert(ifindex);
    }

    fn write_set_attribute(
        state: &mut State,
        ifindex: i32,
        name: &str,
        value: &str,
    ) -> PlatformResult<()> {
        let items = state
            .set_attributes
            .entry((ifindex, name.to_string()))
            .or_default();
        if let Some(item) = value.strip_prefix('+') {
            if !items.iter().any(|i| i == item) {
                items.push(item.to_string());
            }
            Ok(())
        } else if let Some(item) = value.strip_prefix('-') {
            match items.iter().position(|i| i == item) {
                Some(pos) => {
                    items.remove(pos);
                    Ok(())
                }
                None => Err(PlatformError::rejected(
                    format!("set {}", name),
                    format!("unable to remove nonexistent entry {}", item),
                )),
            }
        } else {
            Err(PlatformError::rejected(
                format!("set {}", name),
                "expected +<value> or -<value>",
            ))
        }
    }
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for InMemoryPlatform {
    fn name(&self) -> &str {
        "memory"
    }

    async fn links(&self) -> PlatformResult<Vec<PlatformLink>> {
        Ok(self.state.lock().links.values().cloned().collect())
    }

    async fn link_get(&self, name: &str) -> PlatformResult<Option<PlatformLink>> {
        Ok(self
            .state
            .lock()
            .links
            .values()
            .find(|l| l.name == name)
            .cloned())
    }

    async fn link_get_by_index(&self, ifindex: i32) -> PlatformResult<Option<PlatformLink>> {
        Ok(self.state.lock().links.get(&ifindex).cloned())
    }

    async fn create_master_link(
        &self,
        name: &str,
        link_type: LinkType,
    ) -> PlatformResult<PlatformLink> {
        self.delay().await;
        let mut state = self.state.lock();
        state.ops.push(PlatformOp::CreateLink {
            name: name.to_string(),
            link_type,
        });

        if state.faults.create {
            return Err(PlatformError::rejected("link add", "Operation not supported"));
        }
        if link_type.kind().is_none() {
            return Err(PlatformError::rejected(
                "link add",
                format!("{} is not a software link", link_type),
            ));
        }
        if state.links.values().any(|l| l.name == name) {
            return Err(PlatformError::LinkExists {
                name: name.to_string(),
            });
        }

        let ifindex = state.next_ifindex;
        state.next_ifindex += 1;
        let link = PlatformLink::new(ifindex, name, link_type);
        state.links.insert(ifindex, link.clone());
        trace!(name = %name, ifindex, "Created link");
        Ok(link)
    }

    async fn link_delete(&self, ifindex: i32) -> PlatformResult<()> {
        self.delay().await;
        self.state.lock().ops.push(PlatformOp::DeleteLink { ifindex });
        if self.link(ifindex).is_none() {
            return Err(PlatformError::link_not_found(ifindex));
        }
        self.remove_link(ifindex);
        Ok(())
    }

    async fn enslave(&self, master: i32, slave: i32) -> PlatformResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.ops.push(PlatformOp::Enslave { master, slave });

        if state.faults.enslave {
            return Err(PlatformError::rejected("enslave", "Device or resource busy"));
        }
        state.ensure_link(master)?;
        let link = state.link_mut(slave)?;
        match link.master {
            Some(current) if current != master => Err(PlatformError::rejected(
                "enslave",
                format!("already enslaved to ifindex {}", current),
            )),
            _ => {
                link.master = Some(master);
                Ok(())
            }
        }
    }

    async fn release(&self, master: i32, slave: i32) -> PlatformResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.ops.push(PlatformOp::Release { master, slave });

        let fail = state.faults.release;
        let link = state.link_mut(slave)?;
        // The kernel closes the port on release even when it reports an error
        link.up = false;
        if fail {
            return Err(PlatformError::rejected("release", "Invalid argument"));
        }
        if link.master != Some(master) {
            return Err(PlatformError::rejected(
                "release",
                format!("not a slave of ifindex {}", master),
            ));
        }
        link.master = None;
        Ok(())
    }

    async fn set_master_attribute(
        &self,
        ifindex: i32,
        name: &str,
        value: &str,
    ) -> PlatformResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.ops.push(PlatformOp::SetAttribute {
            ifindex,
            name: name.to_string(),
            value: value.to_string(),
        });

        state.ensure_link(ifindex)?;
        if state.faults.attributes.contains(name) {
            return Err(PlatformError::rejected(
                format!("set {}", name),
                "Invalid argument",
            ));
        }
        if SET_VALUED_ATTRIBUTES.contains(&name) {
            return Self::write_set_attribute(&mut state, ifindex, name, value);
        }
        state
            .attributes
            .insert((ifindex, name.to_string()), value.to_string());
        Ok(())
    }

    async fn get_master_attribute(&self, ifindex: i32, name: &str) -> PlatformResult<String> {
        {
            let mut state = self.state.lock();
            state.ops.push(PlatformOp::GetAttribute {
                ifindex,
                name: name.to_string(),
            });
            state.ensure_link(ifindex)?;
        }
        Ok(self.attribute(ifindex, name).unwrap_or_default())
    }

    async fn link_set_up(&self, ifindex: i32) -> PlatformResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.ops.push(PlatformOp::LinkUp { ifindex });
        if state.faults.link_up.contains(&ifindex) {
            return Err(PlatformError::rejected("link up", "Network is down"));
        }
        state.link_mut(ifindex)?.up = true;
        Ok(())
    }

    async fn link_set_down(&self, ifindex: i32) -> PlatformResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.ops.push(PlatformOp::LinkDown { ifindex });
        state.link_mut(ifindex)?.up = false;
        Ok(())
    }
}
