//! [`LinkOps`] backed by the `ip` binary from iproute2.
//!
//! Commands are spawned from the namespace worker thread, so they act on the
//! namespace the operation was scoped to. Link state is read through the JSON
//! output of `ip -details -json link show`.

use std::io::BufRead;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::sync::Mutex;
use std::thread;

use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use serde::Deserialize;
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

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl IpRoute2 {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs `ip <args>` inside `ns` and returns its stdout.
    ///
    /// `subject` names the link the command is about and is reported when the
    /// kernel answers with "no such device".
    fn run(&self, ns: &NetNs, subject: &str, args: &[&str]) -> Result<String, LinkError> {
        let output = ns.run(|| Command::new(&self.binary).args(args).output())??;
        if output.status.success() {
            return String::from_utf8(output.stdout)
                .map_err(|e| LinkError::Parse(format!("non utf-8 output: {e}")));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(
            subject,
            format!("ip {}", args.join(" ")),
            stderr,
        ))
    }

    fn show(&self, ns: &NetNs, name: Option<&str>) -> Result<Vec<Link>, LinkError> {
        let mut args = vec!["-details", "-json", "link", "show"];
        if let Some(name) = name {
            args.extend(["dev", name]);
        }
        let stdout = self.run(ns, name.unwrap_or_default(), &args)?;
        parse_links(&stdout)
    }

    fn require(&self, ns: &NetNs, name: &str) -> Result<Link, LinkError> {
        self.get(ns, name)?.ok_or_else(|| LinkError::NotFound {
            name: name.to_string(),
        })
    }
}

impl LinkOps for IpRoute2 {
    fn get(&self, ns: &NetNs, name: &str) -> Result<Option<Link>, LinkError> {
        match self.show(ns, Some(name)) {
            Ok(links) => Ok(links.into_iter().next()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self, ns: &NetNs) -> Result<Vec<Link>, LinkError> {
        self.show(ns, None)
    }

    fn add_macvtap(
        &self,
        ns: &NetNs,
        name: &str,
        lower_device: &str,
        mode: MacvtapMode,
    ) -> Result<Link, LinkError> {
        self.run(
            ns,
            lower_device,
            &[
                "link",
                "add",
                "link",
                lower_device,
                "name",
                name,
                "type",
                "macvtap",
                "mode",
                mode.as_str(),
            ],
        )?;
        self.require(ns, name)
    }

    fn delete(&self, ns: &NetNs, name: &str) -> Result<(), LinkError> {
        self.run(ns, name, &["link", "del", "dev", name]).map(drop)
    }

    fn move_to_netns(&self, ns: &NetNs, name: &str, target: &NetNs) -> Result<(), LinkError> {
        // iproute2 treats a netns argument containing '/' as a path to open.
        let target = match target.path() {
            Some(path) => path.to_string_lossy().into_owned(),
            None => std::process::id().to_string(),
        };
        self.run(ns, name, &["link", "set", "dev", name, "netns", &target])
            .map(drop)
    }

    fn configure(
        &self,
        ns: &NetNs,
        name: &str,
        settings: &LinkSettings,
    ) -> Result<Link, LinkError> {
        let mut current = name.to_string();
        if let Some(new_name) = settings.name.as_deref().filter(|n| *n != name) {
            self.run(ns, name, &["link", "set", "dev", name, "down"])?;
            self.run(ns, name, &["link", "set", "dev", name, "name", new_name])?;
            current = new_name.to_string();
        }

        let mac = settings.mac.map(|m| m.to_string());
        let mtu = settings.mtu.map(|m| m.to_string());
        let mut args = vec!["link", "set", "dev", current.as_str()];
        if let Some(mac) = mac.as_deref() {
            args.extend(["address", mac]);
        }
        if let Some(mtu) = mtu.as_deref() {
            args.extend(["mtu", mtu]);
        }
        args.extend(["promisc", if settings.promisc { "on" } else { "off" }]);
        if settings.up {
            args.push("up");
        }
        self.run(ns, &current, &args)?;

        self.require(ns, &current)
    }

    fn set_mac(&self, ns: &NetNs, name: &str, mac: MacAddress) -> Result<(), LinkError> {
        let mac = mac.to_string();
        self.run(ns, name, &["link", "set", "dev", name, "address", &mac])
            .map(drop)
    }

    fn set_up(&self, ns: &NetNs, name: &str) -> Result<(), LinkError> {
        self.run(ns, name, &["link", "set", "dev", name, "up"])
            .map(drop)
    }

    fn set_arp_notify(&self, ns: &NetNs, name: &str, enabled: bool) -> Result<(), LinkError> {
        // procfs sysctl entries resolve against the namespace of the opening thread
        let path = format!("/proc/sys/net/ipv4/conf/{name}/arp_notify");
        let value = if enabled { "1" } else { "0" };
        ns.run(|| std::fs::write(&path, value))??;
        Ok(())
    }

    fn add_address(&self, ns: &NetNs, name: &str, address: IpNetwork) -> Result<(), LinkError> {
        let address = address.to_string();
        self.run(ns, name, &["addr", "add", &address, "dev", name])
            .map(drop)
    }

    fn add_route(
        &self,
        ns: &NetNs,
        name: &str,
        dst: IpNetwork,
        gateway: Option<IpAddr>,
    ) -> Result<(), LinkError> {
        let dst = dst.to_string();
        let gateway = gateway.map(|gw| gw.to_string());
        let mut args = vec!["route", "add", dst.as_str()];
        if let Some(gateway) = gateway.as_deref() {
            args.extend(["via", gateway]);
        }
        args.extend(["dev", name]);
        self.run(ns, name, &args).map(drop)
    }

    fn subscribe(&self, ns: &NetNs) -> Result<LinkEvents, LinkError> {
        let mut child = ns.run(|| {
            Command::new(&self.binary)
                .args(["-oneline", "monitor", "link"])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
        })??;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LinkError::Parse("ip monitor has no stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let monitor = Monitor(Mutex::new(child));
        let ns_name = ns.to_string();

        thread::Builder::new()
            .name("link-monitor".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    let Some(event) = parse_monitor_line(&line) else {
                        continue;
                    };
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                }
                tracing::debug!("link monitor for {ns_name} finished");
            })?;

        Ok(LinkEvents::new(rx, Box::new(monitor)))
    }
}

/// Owns the `ip monitor` child, killing it when the subscription is dropped.
struct Monitor(Mutex<Child>);

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Ok(mut child) = self.0.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn classify_failure(subject: &str, command: String, stderr: String) -> LinkError {
    if stderr.contains("Cannot find device") || stderr.contains("does not exist") {
        let name = quoted(&stderr).unwrap_or(subject).to_string();
        LinkError::NotFound { name }
    } else if stderr.contains("File exists") {
        LinkError::AlreadyExists {
            name: subject.to_string(),
        }
    } else {
        LinkError::Command { command, stderr }
    }
}

fn quoted(s: &str) -> Option<&str> {
    let start = s.find('"')? + 1;
    let len = s[start..].find('"')?;
    Some(&s[start..start + len])
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    link_type: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

impl From<IpLink> for Link {
    fn from(raw: IpLink) -> Self {
        let has_flag = |flag: &str| raw.flags.iter().any(|f| f == flag);
        Link {
            index: raw.ifindex,
            promisc: has_flag("PROMISC"),
            up: has_flag("UP"),
            mac: raw.address.as_deref().and_then(|a| a.parse().ok()),
            name: raw.ifname,
            mtu: raw.mtu,
            link_type: raw.link_type,
            kind: raw.linkinfo.and_then(|info| info.info_kind),
            master: raw.master,
        }
    }
}

fn parse_links(stdout: &str) -> Result<Vec<Link>, LinkError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<IpLink> =
        serde_json::from_str(stdout).map_err(|e| LinkError::Parse(e.to_string()))?;
    Ok(raw.into_iter().map(Link::from).collect())
}

/// Parses one line of `ip -oneline monitor link`, e.g.
/// `Deleted 7: eth0Mvp1@eth0: <BROADCAST,MULTICAST> mtu 1500 ...`.
fn parse_monitor_line(line: &str) -> Option<LinkEvent> {
    let line = line.trim();
    let (kind, rest) = match line.strip_prefix("Deleted ") {
        Some(rest) => (LinkEventKind::Removed, rest),
        None => (LinkEventKind::Changed, line),
    };
    let (index, rest) = rest.split_once(": ")?;
    index.parse::<u32>().ok()?;
    let (name, _) = rest.split_once(':')?;
    let name = name.split('@').next()?.trim();
    if name.is_empty() {
        return None;
    }
    Some(LinkEvent {
        name: name.to_string(),
        kind,
    })
}
