//! In-memory [`LinkOps`] used to drive the plugins in tests.
//!
//! Links live in per-namespace tables, so moves between namespaces, name
//! collisions and not-found paths behave like the kernel's. Individual
//! operations can be made to fail, and link events can be injected.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::MutexGuard;

use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use tokio::sync::mpsc;

use super::Link;
use super::LinkError;
use super::LinkEvent;
use super::LinkEventKind;
use super::LinkEvents;
use super::LinkOps;
use super::LinkSettings;
use super::MacvtapMode;
use crate::netns::NetNs;

#[derive(Debug, Default)]
struct State {
    namespaces: HashMap<NetNs, BTreeMap<String, Link>>,
    addresses: HashMap<(NetNs, String), Vec<IpNetwork>>,
    routes: HashMap<(NetNs, String), Vec<(IpNetwork, Option<IpAddr>)>>,
    arp_notify: HashSet<(NetNs, String)>,
    subscribers: Vec<(NetNs, mpsc::Sender<LinkEvent>)>,
    failing: HashSet<&'static str>,
    failing_links: HashSet<(&'static str, String)>,
    calls: Vec<String>,
    next_index: u32,
}

impl State {
    fn links(&mut self, ns: &NetNs) -> &mut BTreeMap<String, Link> {
        self.namespaces.entry(ns.clone()).or_default()
    }

    fn check(
        &mut self,
        op: &'static str,
        link: Option<&str>,
        detail: String,
    ) -> Result<(), LinkError> {
        self.calls.push(format!("{op} {detail}"));
        let link_failing = link
            .is_some_and(|name| self.failing_links.contains(&(op, name.to_string())));
        if link_failing || self.failing.contains(op) {
            return Err(LinkError::Command {
                command: op.to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn notify(&mut self, ns: &NetNs, name: &str, kind: LinkEventKind) {
        self.subscribers.retain(|(sub_ns, tx)| {
            if sub_ns != ns {
                return !tx.is_closed();
            }
            let event = LinkEvent {
                name: name.to_string(),
                kind,
            };
            !matches!(tx.try_send(event), Err(mpsc::error::TrySendError::Closed(_)))
        });
    }

    fn insert(&mut self, ns: &NetNs, mut link: Link) -> Link {
        self.next_index += 1;
        link.index = self.next_index;
        link.mac.get_or_insert(MacAddress::new([
            0x02,
            0,
            0,
            0,
            (link.index >> 8) as u8,
            link.index as u8,
        ]));
        let name = link.name.clone();
        self.links(ns).insert(name.clone(), link.clone());
        self.notify(ns, &name, LinkEventKind::Changed);
        link
    }

    fn take(&mut self, ns: &NetNs, name: &str) -> Result<Link, LinkError> {
        self.links(ns)
            .remove(name)
            .ok_or_else(|| LinkError::NotFound {
                name: name.to_string(),
            })
    }

    fn link_mut(&mut self, ns: &NetNs, name: &str) -> Result<&mut Link, LinkError> {
        self.links(ns)
            .get_mut(name)
            .ok_or_else(|| LinkError::NotFound {
                name: name.to_string(),
            })
    }
}

#[derive(Debug, Default)]
pub struct MockLinks {
    state: Mutex<State>,
}

impl MockLinks {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a plain ethernet device, as found on a host uplink.
    pub fn add_device(&self, ns: &NetNs, name: &str) -> Link {
        self.state().insert(
            ns,
            Link {
                index: 0,
                name: name.to_string(),
                mac: None,
                mtu: 1500,
                link_type: "ether".to_string(),
                kind: None,
                master: None,
                promisc: false,
                up: true,
            },
        )
    }

    /// Adds an arbitrary link as-is, keeping a MAC if one is set.
    pub fn add_link(&self, ns: &NetNs, link: Link) -> Link {
        self.state().insert(ns, link)
    }

    /// Removes a link behind the plugin's back, emitting a removal event.
    pub fn remove(&self, ns: &NetNs, name: &str) {
        let mut state = self.state();
        if state.links(ns).remove(name).is_some() {
            state.notify(ns, name, LinkEventKind::Removed);
        }
    }

    /// Emits a link event without changing any state.
    pub fn emit(&self, ns: &NetNs, name: &str, kind: LinkEventKind) {
        self.state().notify(ns, name, kind);
    }

    pub fn link(&self, ns: &NetNs, name: &str) -> Option<Link> {
        self.state().links(ns).get(name).cloned()
    }

    pub fn names(&self, ns: &NetNs) -> Vec<String> {
        self.state().links(ns).keys().cloned().collect()
    }

    pub fn addresses(&self, ns: &NetNs, name: &str) -> Vec<IpNetwork> {
        self.state()
            .addresses
            .get(&(ns.clone(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn routes(&self, ns: &NetNs, name: &str) -> Vec<(IpNetwork, Option<IpAddr>)> {
        self.state()
            .routes
            .get(&(ns.clone(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn arp_notify(&self, ns: &NetNs, name: &str) -> bool {
        self.state()
            .arp_notify
            .contains(&(ns.clone(), name.to_string()))
    }

    /// Makes every later call of `op` (the [`LinkOps`] method name) fail.
    pub fn fail(&self, op: &'static str) {
        self.state().failing.insert(op);
    }

    /// Like [`MockLinks::fail`], limited to calls on the link `name`.
    pub fn fail_link(&self, op: &'static str, name: &str) {
        self.state().failing_links.insert((op, name.to_string()));
    }

    pub fn heal(&self, op: &'static str) {
        let mut state = self.state();
        state.failing.remove(op);
        state.failing_links.retain(|(failing, _)| *failing != op);
    }

    /// Operations performed so far, as `"<op> <details>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.len()
    }
}

impl LinkOps for MockLinks {
    fn get(&self, ns: &NetNs, name: &str) -> Result<Option<Link>, LinkError> {
        let mut state = self.state();
        state.check("get", Some(name), format!("{ns} {name}"))?;
        Ok(state.links(ns).get(name).cloned())
    }

    fn list(&self, ns: &NetNs) -> Result<Vec<Link>, LinkError> {
        let mut state = self.state();
        state.check("list", None, ns.to_string())?;
        Ok(state.links(ns).values().cloned().collect())
    }

    fn add_macvtap(
        &self,
        ns: &NetNs,
        name: &str,
        lower_device: &str,
        mode: MacvtapMode,
    ) -> Result<Link, LinkError> {
        let mut state = self.state();
        state.check("add_macvtap", Some(name), format!("{ns} {name} {lower_device} {mode}"))?;
        if !state.links(ns).contains_key(lower_device) {
            return Err(LinkError::NotFound {
                name: lower_device.to_string(),
            });
        }
        if state.links(ns).contains_key(name) {
            return Err(LinkError::AlreadyExists {
                name: name.to_string(),
            });
        }
        Ok(state.insert(
            ns,
            Link {
                index: 0,
                name: name.to_string(),
                mac: None,
                mtu: 1500,
                link_type: "ether".to_string(),
                kind: Some("macvtap".to_string()),
                master: None,
                promisc: false,
                up: false,
            },
        ))
    }

    fn delete(&self, ns: &NetNs, name: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check("delete", Some(name), format!("{ns} {name}"))?;
        state.take(ns, name)?;
        state.notify(ns, name, LinkEventKind::Removed);
        Ok(())
    }

    fn move_to_netns(&self, ns: &NetNs, name: &str, target: &NetNs) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check("move_to_netns", Some(name), format!("{ns} {name} {target}"))?;
        if state.links(target).contains_key(name) {
            return Err(LinkError::AlreadyExists {
                name: name.to_string(),
            });
        }
        let link = state.take(ns, name)?;
        state.notify(ns, name, LinkEventKind::Removed);
        state.links(target).insert(name.to_string(), link);
        Ok(())
    }

    fn configure(
        &self,
        ns: &NetNs,
        name: &str,
        settings: &LinkSettings,
    ) -> Result<Link, LinkError> {
        let mut state = self.state();
        state.check("configure", Some(name), format!("{ns} {name}"))?;
        let mut link = state.take(ns, name)?;
        if let Some(new_name) = &settings.name {
            if new_name != name && state.links(ns).contains_key(new_name) {
                state.links(ns).insert(name.to_string(), link);
                return Err(LinkError::AlreadyExists {
                    name: new_name.clone(),
                });
            }
            link.name = new_name.clone();
        }
        if let Some(mac) = settings.mac {
            link.mac = Some(mac);
        }
        if let Some(mtu) = settings.mtu {
            link.mtu = mtu;
        }
        link.promisc = settings.promisc;
        link.up = link.up || settings.up;
        state.links(ns).insert(link.name.clone(), link.clone());
        Ok(link)
    }

    fn set_mac(&self, ns: &NetNs, name: &str, mac: MacAddress) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check("set_mac", Some(name), format!("{ns} {name} {mac}"))?;
        state.link_mut(ns, name)?.mac = Some(mac);
        Ok(())
    }

    fn set_up(&self, ns: &NetNs, name: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check("set_up", Some(name), format!("{ns} {name}"))?;
        state.link_mut(ns, name)?.up = true;
        Ok(())
    }

    fn set_arp_notify(&self, ns: &NetNs, name: &str, enabled: bool) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check("set_arp_notify", Some(name), format!("{ns} {name} {enabled}"))?;
        state.link_mut(ns, name)?;
        let key = (ns.clone(), name.to_string());
        if enabled {
            state.arp_notify.insert(key);
        } else {
            state.arp_notify.remove(&key);
        }
        Ok(())
    }

    fn add_address(&self, ns: &NetNs, name: &str, address: IpNetwork) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check("add_address", Some(name), format!("{ns} {name} {address}"))?;
        state.link_mut(ns, name)?;
        let addresses = state
            .addresses
            .entry((ns.clone(), name.to_string()))
            .or_default();
        if addresses.contains(&address) {
            return Err(LinkError::AlreadyExists {
                name: name.to_string(),
            });
        }
        addresses.push(address);
        Ok(())
    }

    fn add_route(
        &self,
        ns: &NetNs,
        name: &str,
        dst: IpNetwork,
        gateway: Option<IpAddr>,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check("add_route", Some(name), format!("{ns} {name} {dst}"))?;
        state.link_mut(ns, name)?;
        state
            .routes
            .entry((ns.clone(), name.to_string()))
            .or_default()
            .push((dst, gateway));
        Ok(())
    }

    fn subscribe(&self, ns: &NetNs) -> Result<LinkEvents, LinkError> {
        let mut state = self.state();
        state.check("subscribe", None, ns.to_string())?;
        let (tx, rx) = mpsc::channel(64);
        state.subscribers.push((ns.clone(), tx));
        Ok(LinkEvents::new(rx, Box::new(())))
    }
}
