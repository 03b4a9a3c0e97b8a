//! Host link inspection and mutation.
//!
//! [`LinkOps`] is the capability surface the device plugin and the CNI plugin
//! drive. Every operation names the network namespace it runs in, so callers
//! never have to juggle thread namespaces themselves.

pub mod iproute2;
pub mod mock;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::netns::NetNs;
use crate::netns::NetNsError;

pub use iproute2::IpRoute2;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link {name:?} not found")]
    NotFound { name: String },

    #[error("link {name:?} already exists")]
    AlreadyExists { name: String },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("failed to run link command: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse link output: {0}")]
    Parse(String),

    #[error(transparent)]
    Namespace(#[from] NetNsError),
}

impl LinkError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LinkError::NotFound { .. })
    }
}

/// Macvtap forwarding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacvtapMode {
    #[default]
    Bridge,
    Vepa,
    Passthru,
    Private,
}

impl MacvtapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MacvtapMode::Bridge => "bridge",
            MacvtapMode::Vepa => "vepa",
            MacvtapMode::Passthru => "passthru",
            MacvtapMode::Private => "private",
        }
    }
}

impl fmt::Display for MacvtapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MacvtapMode {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bridge" => Ok(MacvtapMode::Bridge),
            "vepa" => Ok(MacvtapMode::Vepa),
            "passthru" => Ok(MacvtapMode::Passthru),
            "private" => Ok(MacvtapMode::Private),
            other => Err(LinkError::Parse(format!("unknown macvtap mode {other:?}"))),
        }
    }
}

/// Snapshot of a link's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<MacAddress>,
    pub mtu: u32,
    /// Hardware type as reported by the kernel, e.g. `ether` or `loopback`.
    pub link_type: String,
    /// rtnetlink kind (`macvtap`, `bond`, `vlan`, ...). `None` for plain devices.
    pub kind: Option<String>,
    pub master: Option<String>,
    pub promisc: bool,
    pub up: bool,
}

impl Link {
    /// Whether macvtap interfaces may be layered on this link.
    ///
    /// Plain ethernet devices, bonds and vlans qualify as long as they are not
    /// enslaved to another interface.
    pub fn is_suitable_macvtap_parent(&self) -> bool {
        if self.link_type != "ether" || self.master.is_some() {
            return false;
        }
        matches!(self.kind.as_deref(), None | Some("bond") | Some("vlan"))
    }

    /// Lower-case `aa:bb:cc:dd:ee:ff`, empty when the link has no hardware address.
    pub fn mac_string(&self) -> String {
        self.mac.map(format_mac).unwrap_or_default()
    }
}

/// Formats a MAC the way CNI results carry it.
pub fn format_mac(mac: MacAddress) -> String {
    mac.to_string().to_lowercase()
}

/// Attributes applied when moving a link into its final place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSettings {
    /// Rename the link; the link is brought down first.
    pub name: Option<String>,
    pub mac: Option<MacAddress>,
    pub mtu: Option<u32>,
    pub promisc: bool,
    pub up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventKind {
    /// The link appeared or one of its attributes changed.
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub name: String,
    pub kind: LinkEventKind,
}

/// A live subscription to link events of one namespace.
///
/// Dropping it cancels the underlying event source.
pub struct LinkEvents {
    rx: mpsc::Receiver<LinkEvent>,
    _source: Box<dyn Send + Sync>,
}

impl LinkEvents {
    pub fn new(rx: mpsc::Receiver<LinkEvent>, source: Box<dyn Send + Sync>) -> Self {
        Self {
            rx,
            _source: source,
        }
    }

    /// Next event, `None` once the source has gone away.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }
}

impl fmt::Debug for LinkEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEvents").finish_non_exhaustive()
    }
}

pub trait LinkOps: Send + Sync {
    /// Looks a link up by name, `Ok(None)` when it does not exist.
    fn get(&self, ns: &NetNs, name: &str) -> Result<Option<Link>, LinkError>;

    fn list(&self, ns: &NetNs) -> Result<Vec<Link>, LinkError>;

    fn add_macvtap(
        &self,
        ns: &NetNs,
        name: &str,
        lower_device: &str,
        mode: MacvtapMode,
    ) -> Result<Link, LinkError>;

    fn delete(&self, ns: &NetNs, name: &str) -> Result<(), LinkError>;

    /// Moves `name` from `ns` into `target`, keeping its name.
    fn move_to_netns(&self, ns: &NetNs, name: &str, target: &NetNs) -> Result<(), LinkError>;

    /// Applies `settings` to `name` and returns the resulting link.
    fn configure(&self, ns: &NetNs, name: &str, settings: &LinkSettings)
        -> Result<Link, LinkError>;

    fn set_mac(&self, ns: &NetNs, name: &str, mac: MacAddress) -> Result<(), LinkError>;

    fn set_up(&self, ns: &NetNs, name: &str) -> Result<(), LinkError>;

    /// Sets `net.ipv4.conf.<name>.arp_notify`.
    fn set_arp_notify(&self, ns: &NetNs, name: &str, enabled: bool) -> Result<(), LinkError>;

    fn add_address(&self, ns: &NetNs, name: &str, address: IpNetwork) -> Result<(), LinkError>;

    fn add_route(
        &self,
        ns: &NetNs,
        name: &str,
        dst: IpNetwork,
        gateway: Option<IpAddr>,
    ) -> Result<(), LinkError>;

    fn subscribe(&self, ns: &NetNs) -> Result<LinkEvents, LinkError>;

    fn exists(&self, ns: &NetNs, name: &str) -> Result<bool, LinkError> {
        Ok(self.get(ns, name)?.is_some())
    }

    /// Deletes any link called `name` and creates a fresh macvtap in its place.
    fn recreate_macvtap(
        &self,
        ns: &NetNs,
        name: &str,
        lower_device: &str,
        mode: MacvtapMode,
    ) -> Result<Link, LinkError> {
        match self.delete(ns, name) {
            Ok(()) => tracing::debug!("removed stale link {name} in {ns}"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.add_macvtap(ns, name, lower_device, mode)
    }

    /// Names of the links macvtap interfaces can be created on.
    fn suitable_macvtap_parents(&self, ns: &NetNs) -> Result<Vec<String>, LinkError> {
        Ok(self
            .list(ns)?
            .into_iter()
            .filter(Link::is_suitable_macvtap_parent)
            .map(|link| link.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn link(name: &str, link_type: &str, kind: Option<&str>, master: Option<&str>) -> Link {
        Link {
            index: 2,
            name: name.to_string(),
            mac: None,
            mtu: 1500,
            link_type: link_type.to_string(),
            kind: kind.map(str::to_string),
            master: master.map(str::to_string),
            promisc: false,
            up: true,
        }
    }

    #[test]
    fn parent_suitability() {
        assert!(link("eth0", "ether", None, None).is_suitable_macvtap_parent());
        assert!(link("bond0", "ether", Some("bond"), None).is_suitable_macvtap_parent());
        assert!(link("eth0.10", "ether", Some("vlan"), None).is_suitable_macvtap_parent());
        assert!(!link("lo", "loopback", None, None).is_suitable_macvtap_parent());
        assert!(!link("br0", "ether", Some("bridge"), None).is_suitable_macvtap_parent());
        assert!(!link("mvp0", "ether", Some("macvtap"), None).is_suitable_macvtap_parent());
        assert!(!link("eth1", "ether", None, Some("bond0")).is_suitable_macvtap_parent());
    }

    #[test]
    fn mode_names() {
        assert_eq!(
            "passthru".parse::<MacvtapMode>().expect("known mode"),
            MacvtapMode::Passthru
        );
        assert_eq!(MacvtapMode::default().to_string(), "bridge");
        assert!("bridg".parse::<MacvtapMode>().is_err());
    }

    #[test]
    fn mac_is_lower_case() {
        let mut l = link("eth0", "ether", None, None);
        l.mac = Some(MacAddress::new([0x02, 0xAB, 0, 0, 0, 0x0F]));
        assert_eq!(l.mac_string(), "02:ab:00:00:00:0f");
    }
}
