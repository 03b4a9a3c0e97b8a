//! Network attachment configuration: stdin config merged with `CNI_ARGS`.

use error_stack::Report;
use error_stack::ResultExt;
use mac_address::MacAddress;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::CniError;

/// Pods whose name starts with this run a VM; their addresses belong to the guest.
pub const VM_POD_PREFIX: &str = "virt-launcher-";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub plugin: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin: String,
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(rename = "promiscMode", default)]
    pub promisc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default)]
    pub is_vm_pod: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConf>,
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
}

impl NetConf {
    /// IPAM plugin to delegate to, `None` for a layer 2 only attachment.
    pub fn ipam_plugin(&self) -> Option<&str> {
        self.ipam
            .as_ref()
            .map(|ipam| ipam.plugin.as_str())
            .filter(|plugin| !plugin.is_empty())
    }

    /// MTU to apply; zero means keep the link's.
    pub fn mtu(&self) -> Option<u32> {
        self.mtu.filter(|mtu| *mtu > 0)
    }

    /// The allocated host link to attach; ADD cannot proceed without one.
    pub fn device_id(&self) -> Result<&str, Report<CniError>> {
        if self.device_id.is_empty() {
            return Err(Report::new(CniError::InvalidConfig {
                message: "deviceID is required".to_string(),
            }));
        }
        Ok(&self.device_id)
    }

    /// The effective MAC, parsed.
    pub fn parsed_mac(&self) -> Result<Option<MacAddress>, Report<CniError>> {
        self.mac
            .as_deref()
            .map(|mac| {
                mac.parse::<MacAddress>()
                    .change_context(CniError::Decoding {
                        what: "MAC address".to_string(),
                    })
                    .attach_printable(format!("invalid MAC {mac:?}"))
            })
            .transpose()
    }
}

/// The keys of `CNI_ARGS` this plugin understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniArgs {
    pub mac: Option<String>,
    pub pod_name: Option<String>,
}

/// Parses `KEY=VALUE;KEY=VALUE`. Unknown keys are rejected unless `IgnoreUnknown` is set.
pub fn parse_cni_args(raw: &str) -> Result<CniArgs, Report<CniError>> {
    let context = || CniError::Decoding {
        what: "CNI_ARGS".to_string(),
    };
    let mut args = CniArgs::default();
    let mut ignore_unknown = false;
    let mut unknown = Vec::new();

    for pair in raw.split(';').filter(|pair| !pair.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Report::new(context()).attach_printable(format!("invalid pair {pair:?}")));
        };
        match key {
            "IgnoreUnknown" => {
                ignore_unknown = matches!(value.to_ascii_lowercase().as_str(), "1" | "true");
            }
            "MAC" => args.mac = Some(value.to_string()).filter(|v| !v.is_empty()),
            "K8S_POD_NAME" => args.pod_name = Some(value.to_string()).filter(|v| !v.is_empty()),
            other => unknown.push(other.to_string()),
        }
    }

    if !ignore_unknown && !unknown.is_empty() {
        return Err(Report::new(context()).attach_printable(format!("unknown args {unknown:?}")));
    }
    Ok(args)
}

/// Loads the stdin config and folds `CNI_ARGS` into it.
///
/// MAC precedence: `runtimeConfig.mac`, then `MAC=` from the args, then the static `mac`.
pub fn load_conf(stdin: &[u8], cni_args: &str) -> Result<NetConf, Report<CniError>> {
    let mut conf: NetConf = serde_json::from_slice(stdin).change_context(CniError::Decoding {
        what: "network config".to_string(),
    })?;

    if !cni_args.is_empty() {
        let args = parse_cni_args(cni_args)?;
        if let Some(mac) = args.mac {
            conf.mac = Some(mac);
        }
        if let Some(pod_name) = args.pod_name {
            conf.is_vm_pod = pod_name.starts_with(VM_POD_PREFIX);
        }
    }
    if let Some(mac) = conf.runtime_config.mac.clone().filter(|mac| !mac.is_empty()) {
        conf.mac = Some(mac);
    }
    conf.mac = conf.mac.filter(|mac| !mac.is_empty());

    Ok(conf)
}
