//! CNI result documents.
//!
//! Results are held in the 1.0.0 shape and encoded for whatever version the
//! runtime asked for. IPAM results are accepted in the current shape as well
//! as the legacy 0.1/0.2 `ip4`/`ip6` one.

use std::net::IpAddr;

use error_stack::Report;
use error_stack::ResultExt;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::errors::CniError;

pub const CURRENT_VERSION: &str = "1.0.0";
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Fails unless the runtime asked for a version results can be produced in.
pub fn check_version(version: &str) -> Result<(), Report<CniError>> {
    if SUPPORTED_VERSIONS.contains(&version) {
        return Ok(());
    }
    Err(Report::new(CniError::IncompatibleVersion {
        version: version.to_string(),
    })
    .attach_printable(format!("supported versions: {SUPPORTED_VERSIONS:?}")))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Index into the result's interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    pub address: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    pub fn is_empty(&self) -> bool {
        *self == Dns::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
}

/// `ip4`/`ip6` block of a 0.1/0.2 result.
#[derive(Debug, Deserialize)]
struct LegacyIpConfig {
    ip: IpNetwork,
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyResult {
    #[serde(default)]
    cni_version: String,
    #[serde(default)]
    ip4: Option<LegacyIpConfig>,
    #[serde(default)]
    ip6: Option<LegacyIpConfig>,
    #[serde(default)]
    dns: Dns,
}

impl From<LegacyResult> for CniResult {
    fn from(legacy: LegacyResult) -> Self {
        let mut result = CniResult {
            cni_version: legacy.cni_version,
            dns: legacy.dns,
            ..Default::default()
        };
        for config in [legacy.ip4, legacy.ip6].into_iter().flatten() {
            result.ips.push(IpConfig {
                interface: None,
                address: config.ip,
                gateway: config.gateway,
            });
            result.routes.extend(config.routes);
        }
        result
    }
}

impl CniResult {
    /// Parses an IPAM plugin's stdout, whichever result version it speaks.
    pub fn parse(raw: &[u8]) -> Result<Self, Report<CniError>> {
        let context = || CniError::Decoding {
            what: "IPAM result".to_string(),
        };
        let value: Value = serde_json::from_slice(raw).change_context_lazy(context)?;
        let legacy = value.get("ip4").is_some() || value.get("ip6").is_some();
        if legacy {
            let legacy: LegacyResult = serde_json::from_value(value).change_context_lazy(context)?;
            return Ok(legacy.into());
        }
        serde_json::from_value(value).change_context_lazy(context)
    }

    /// Encodes the result for `version`. Results before 1.0.0 tag every IP with its family.
    pub fn encode(&self, version: &str) -> Result<Value, Report<CniError>> {
        let mut result = self.clone();
        result.cni_version = version.to_string();
        let mut value = serde_json::to_value(&result).change_context(CniError::Plugin {
            message: "failed to encode result".to_string(),
        })?;

        if version != CURRENT_VERSION {
            if let Some(ips) = value.get_mut("ips").and_then(Value::as_array_mut) {
                for (ip, config) in ips.iter_mut().zip(&result.ips) {
                    let family = if config.address.is_ipv4() { "4" } else { "6" };
                    if let Some(ip) = ip.as_object_mut() {
                        ip.insert("version".to_string(), Value::from(family));
                    }
                }
            }
        }
        Ok(value)
    }
}

/// Error document printed on stdout when a command fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResult {
    #[serde(default)]
    pub cni_version: String,
    pub code: u32,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorResult {
    pub fn from_report(report: &Report<CniError>, cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: report.current_context().code(),
            msg: report.current_context().to_string(),
            details: crate::errors::details(report),
        }
    }
}

/// Answer to the `VERSION` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: CURRENT_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}
