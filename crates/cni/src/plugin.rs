//! ADD/DEL/CHECK: moving an allocated macvtap link into the pod and configuring it.

use std::net::IpAddr;

use error_stack::Report;
use error_stack::ResultExt;
use mac_address::MacAddress;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::link::format_mac;
use utils::link::LinkError;
use utils::link::LinkOps;
use utils::link::LinkSettings;
use utils::netns::NetNs;

use crate::errors::CniError;
use crate::ipam::Ipam;
use crate::netconf::load_conf;
use crate::netconf::NetConf;
use crate::skel::CmdArgs;
use crate::types::CniResult;
use crate::types::Interface;
use crate::types::IpConfig;

/// Undo action registered once a provisioning step has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Compensation {
    /// Delete the first of `names` that exists in `ns`.
    DeleteLink { ns: NetNs, names: Vec<String> },
    IpamDel { plugin: String },
}

/// Compensations of one ADD, unwound in reverse order on failure.
#[derive(Debug, Default)]
struct Rollback {
    steps: Vec<Compensation>,
}

impl Rollback {
    fn push(&mut self, step: Compensation) {
        debug!("registered compensation {step:?}");
        self.steps.push(step);
    }

    /// Runs every compensation, newest first. Failures are logged and skipped.
    fn unwind(self, cni: &MacvtapCni<'_>, args: &CmdArgs) {
        for step in self.steps.into_iter().rev() {
            warn!("rolling back: {step:?}");
            match step {
                Compensation::IpamDel { plugin } => {
                    if let Err(e) = cni.ipam.del(&plugin, args) {
                        warn!("IPAM release during rollback failed: {e:?}");
                    }
                }
                Compensation::DeleteLink { ns, names } => {
                    if let Err(e) = delete_first_existing(cni.links, &ns, &names) {
                        warn!("link deletion during rollback failed: {e}");
                    }
                }
            }
        }
    }
}

fn delete_first_existing(
    links: &dyn LinkOps,
    ns: &NetNs,
    names: &[String],
) -> Result<(), LinkError> {
    for name in names {
        match links.delete(ns, name) {
            Ok(()) => {
                info!("deleted link {name} in {ns}");
                return Ok(());
            }
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub struct MacvtapCni<'a> {
    links: &'a dyn LinkOps,
    ipam: &'a dyn Ipam,
    /// Namespace the device plugin created the link in.
    host: NetNs,
}

impl<'a> MacvtapCni<'a> {
    pub fn new(links: &'a dyn LinkOps, ipam: &'a dyn Ipam, host: NetNs) -> Self {
        Self { links, ipam, host }
    }

    /// Attaches the allocated link to the pod. Any failure unwinds what was done so far.
    pub fn cmd_add(&self, args: &CmdArgs) -> Result<CniResult, Report<CniError>> {
        let conf = load_conf(&args.stdin, &args.args)?;
        debug!("network config: {conf:?}");
        conf.device_id()?;
        let mac = conf.parsed_mac()?;
        let target = NetNs::from_path(&args.netns);
        if !target.exists() {
            return Err(Report::new(CniError::InvalidEnvironment {
                message: format!("failed to open netns {:?}", args.netns),
            }));
        }

        let mut rollback = Rollback::default();
        match self.provision(args, &conf, mac, &target, &mut rollback) {
            Ok(result) => Ok(result),
            Err(report) => {
                rollback.unwind(self, args);
                Err(report)
            }
        }
    }

    fn provision(
        &self,
        args: &CmdArgs,
        conf: &NetConf,
        mac: Option<MacAddress>,
        target: &NetNs,
        rollback: &mut Rollback,
    ) -> Result<CniResult, Report<CniError>> {
        let mut interface = if self.exists(&self.host, &conf.device_id)? {
            self.move_into_pod(args, conf, mac, target, rollback)?
        } else if let Some(link) = self
            .links
            .get(target, &args.if_name)
            .change_context(CniError::link_operation("look up pod interface"))?
        {
            // created by an earlier, interrupted attempt; not ours to delete
            info!("{} already in {target}, adopting it", args.if_name);
            Interface {
                name: args.if_name.clone(),
                mac: link.mac_string(),
                sandbox: Some(args.netns.clone()),
            }
        } else {
            return Err(Report::new(CniError::LinkNotFound {
                name: conf.device_id.clone(),
            }));
        };

        let Some(plugin) = conf.ipam_plugin() else {
            return Ok(CniResult {
                cni_version: conf.cni_version.clone(),
                interfaces: vec![interface],
                ..Default::default()
            });
        };

        info!("need {plugin} IPAM to allocate addresses");
        let allocated = self.ipam.add(plugin, args)?;
        rollback.push(Compensation::IpamDel {
            plugin: plugin.to_string(),
        });
        debug!("IPAM result: {allocated:?}");

        if allocated.ips.is_empty() {
            return Err(Report::new(CniError::Ipam {
                plugin: plugin.to_string(),
            })
            .attach_printable("IPAM plugin returned missing IP config"));
        }

        if let Some(ipam_mac) = first_ipam_mac(&allocated) {
            let formatted = format_mac(ipam_mac);
            if !formatted.eq_ignore_ascii_case(&interface.mac) {
                info!("applying IPAM assigned MAC {formatted} to {}", args.if_name);
                self.links
                    .set_mac(target, &args.if_name, ipam_mac)
                    .change_context(CniError::link_operation("set IPAM assigned MAC"))?;
                interface.mac = formatted;
            }
        }

        let result = CniResult {
            cni_version: conf.cni_version.clone(),
            interfaces: vec![interface],
            ips: allocated
                .ips
                .into_iter()
                .map(|ip| IpConfig {
                    interface: Some(0),
                    ..ip
                })
                .collect(),
            routes: allocated.routes,
            dns: allocated.dns,
        };

        if let Err(e) = self.links.set_arp_notify(target, &args.if_name, true) {
            warn!("failed to enable arp_notify on {}: {e}", args.if_name);
        }

        if conf.is_vm_pod {
            // the guest owns these addresses
            info!("VM pod, leaving addresses of {} unconfigured", args.if_name);
        } else {
            self.configure_addresses(target, &args.if_name, &result)?;
        }
        Ok(result)
    }

    /// Moves the host link into `target`, renames it and applies the requested attributes.
    fn move_into_pod(
        &self,
        args: &CmdArgs,
        conf: &NetConf,
        mac: Option<MacAddress>,
        target: &NetNs,
        rollback: &mut Rollback,
    ) -> Result<Interface, Report<CniError>> {
        info!(
            "moving {} from {} into {target} as {}",
            conf.device_id, self.host, args.if_name
        );
        if let Err(e) = self.links.move_to_netns(&self.host, &conf.device_id, target) {
            rollback.push(Compensation::DeleteLink {
                ns: self.host.clone(),
                names: vec![conf.device_id.clone()],
            });
            return Err(Report::new(e).change_context(CniError::link_operation(format!(
                "move {} into {target}",
                conf.device_id
            ))));
        }
        rollback.push(Compensation::DeleteLink {
            ns: target.clone(),
            names: vec![conf.device_id.clone(), args.if_name.clone()],
        });

        let settings = LinkSettings {
            name: (conf.device_id != args.if_name).then(|| args.if_name.clone()),
            mac,
            mtu: conf.mtu(),
            promisc: conf.promisc,
            up: true,
        };
        let link = self
            .links
            .configure(target, &conf.device_id, &settings)
            .change_context(CniError::link_operation(format!(
                "configure {} in {target}",
                args.if_name
            )))?;

        Ok(Interface {
            name: link.name.clone(),
            mac: link.mac_string(),
            sandbox: Some(args.netns.clone()),
        })
    }

    fn configure_addresses(
        &self,
        target: &NetNs,
        if_name: &str,
        result: &CniResult,
    ) -> Result<(), Report<CniError>> {
        self.links
            .set_up(target, if_name)
            .change_context(CniError::link_operation(format!("bring up {if_name}")))?;

        for ip in &result.ips {
            self.links
                .add_address(target, if_name, ip.address)
                .change_context(CniError::link_operation(format!(
                    "add address {} to {if_name}",
                    ip.address
                )))?;
        }

        for route in &result.routes {
            let gateway = route
                .gw
                .or_else(|| first_gateway(&result.ips, route.dst.is_ipv4()));
            self.links
                .add_route(target, if_name, route.dst, gateway)
                .change_context(CniError::link_operation(format!(
                    "add route {} via {gateway:?} on {if_name}",
                    route.dst
                )))?;
        }
        Ok(())
    }

    /// Removes the pod interface. Safe to repeat.
    pub fn cmd_del(&self, args: &CmdArgs) -> Result<(), Report<CniError>> {
        let conf = load_conf(&args.stdin, &args.args)?;

        if let Some(plugin) = conf.ipam_plugin() {
            self.ipam.del(plugin, args)?;
        }

        if args.netns.is_empty() {
            return Ok(());
        }
        let target = NetNs::from_path(&args.netns);
        if !target.exists() {
            info!("netns {} is already gone", args.netns);
            return Ok(());
        }

        match self.links.delete(&target, &args.if_name) {
            Ok(()) => {
                info!("deleted {} in {target}", args.if_name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Report::new(e).change_context(CniError::link_operation(format!(
                "delete {} in {target}",
                args.if_name
            )))),
        }
    }

    pub fn cmd_check(&self, _args: &CmdArgs) -> Result<(), Report<CniError>> {
        Ok(())
    }

    fn exists(&self, ns: &NetNs, name: &str) -> Result<bool, Report<CniError>> {
        self.links
            .exists(ns, name)
            .change_context(CniError::link_operation(format!("look up {name} in {ns}")))
    }
}

fn first_ipam_mac(result: &CniResult) -> Option<MacAddress> {
    result
        .interfaces
        .iter()
        .filter(|iface| !iface.mac.is_empty())
        .find_map(|iface| match iface.mac.parse::<MacAddress>() {
            Ok(mac) => Some(mac),
            Err(e) => {
                warn!("ignoring unparsable IPAM MAC {:?}: {e}", iface.mac);
                None
            }
        })
}

fn first_gateway(ips: &[IpConfig], ipv4: bool) -> Option<IpAddr> {
    ips.iter()
        .filter_map(|ip| ip.gateway)
        .find(|gateway| gateway.is_ipv4() == ipv4)
}
