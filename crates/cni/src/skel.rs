//! CNI entry point plumbing: environment, stdin, dispatch and result printing.

use std::io::Read;
use std::io::Write;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Serialize;
use tracing::error;
use tracing::info;

use crate::errors::CniError;
use crate::netconf::NetConf;
use crate::plugin::MacvtapCni;
use crate::types::check_version;
use crate::types::ErrorResult;
use crate::types::VersionInfo;
use crate::types::CURRENT_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl std::str::FromStr for Command {
    type Err = Report<CniError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(Report::new(CniError::InvalidEnvironment {
                message: format!("unknown CNI_COMMAND {other:?}"),
            })),
        }
    }
}

/// Per-invocation arguments, as handed over by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    pub args: String,
    pub path: String,
    pub stdin: Vec<u8>,
}

impl CmdArgs {
    /// Reads the `CNI_*` variables through `lookup`, requiring the ones `command` needs.
    pub fn from_env<F>(command: Command, lookup: F, stdin: Vec<u8>) -> Result<Self, Report<CniError>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut var = |name: &'static str, required: bool| {
            let value = lookup(name).unwrap_or_default();
            if required && value.is_empty() {
                missing.push(name);
            }
            value
        };

        let add = command == Command::Add;
        let args = CmdArgs {
            container_id: var("CNI_CONTAINERID", command != Command::Version),
            netns: var("CNI_NETNS", add || command == Command::Check),
            if_name: var("CNI_IFNAME", command != Command::Version),
            args: var("CNI_ARGS", false),
            path: var("CNI_PATH", command != Command::Version),
            stdin,
        };

        if !missing.is_empty() {
            return Err(Report::new(CniError::InvalidEnvironment {
                message: format!("required env variables {missing:?} missing"),
            }));
        }
        Ok(args)
    }
}

fn print<T: Serialize>(stdout: &mut impl Write, value: &T) -> Result<(), Report<CniError>> {
    let context = || CniError::Plugin {
        message: "failed to write result".to_string(),
    };
    serde_json::to_writer(&mut *stdout, value).change_context_lazy(context)?;
    writeln!(stdout).change_context_lazy(context)
}

/// `cniVersion` of the config on stdin, `None` when stdin is not a config at all.
fn requested_version(stdin: &[u8]) -> Option<String> {
    serde_json::from_slice::<NetConf>(stdin)
        .map(|conf| conf.cni_version)
        .ok()
}

/// Version to stamp on an error document.
fn reported_version(stdin: &[u8]) -> String {
    requested_version(stdin)
        .filter(|version| !version.is_empty())
        .unwrap_or_else(|| CURRENT_VERSION.to_string())
}

fn dispatch(
    cni: &MacvtapCni<'_>,
    lookup: impl Fn(&str) -> Option<String>,
    stdin: &mut impl Read,
    stdout: &mut impl Write,
) -> Result<(), Report<CniError>> {
    let command: Command = lookup("CNI_COMMAND")
        .unwrap_or_default()
        .parse()?;
    if command == Command::Version {
        return print(stdout, &VersionInfo::default());
    }

    let mut raw = Vec::new();
    stdin
        .read_to_end(&mut raw)
        .change_context(CniError::Decoding {
            what: "stdin".to_string(),
        })?;
    let args = CmdArgs::from_env(command, lookup, raw)?;
    info!(
        "{command:?} container id: {}, netns: {}, ifname: {}, args: {}, path: {}, config: {}",
        args.container_id,
        args.netns,
        args.if_name,
        args.args,
        args.path,
        String::from_utf8_lossy(&args.stdin)
    );

    // undecodable stdin is reported by the command itself
    let version = match requested_version(&args.stdin) {
        Some(version) => {
            check_version(&version)?;
            version
        }
        None => CURRENT_VERSION.to_string(),
    };

    match command {
        Command::Add => {
            let result = cni.cmd_add(&args)?;
            let encoded = result.encode(&version)?;
            info!("ADD result: {encoded}");
            print(stdout, &encoded)
        }
        Command::Del => cni.cmd_del(&args),
        Command::Check => cni.cmd_check(&args),
        Command::Version => Ok(()),
    }
}

/// Runs one CNI invocation. On failure the error document is printed and `false` returned.
pub fn run(
    cni: &MacvtapCni<'_>,
    lookup: impl Fn(&str) -> Option<String>,
    mut stdin: impl Read,
    mut stdout: impl Write,
) -> bool {
    let mut buffered = Vec::new();
    let mut tee = TeeReader {
        inner: &mut stdin,
        copy: &mut buffered,
    };
    match dispatch(cni, lookup, &mut tee, &mut stdout) {
        Ok(()) => true,
        Err(report) => {
            error!("{report:?}");
            let error = ErrorResult::from_report(&report, &reported_version(&buffered));
            if let Err(e) = print(&mut stdout, &error) {
                error!("failed to print error result: {e:?}");
            }
            false
        }
    }
}

/// Keeps a copy of what was read, so the requested version is known when reporting errors.
struct TeeReader<'a, R> {
    inner: &'a mut R,
    copy: &'a mut Vec<u8>,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;
    use serde_json::Value;
    use similar_asserts::assert_eq;
    use test_log::test;
    use utils::link::mock::MockLinks;
    use utils::link::LinkOps;
    use utils::netns::NetNs;

    use super::*;
    use crate::ipam::tests::MockIpam;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn invoke(
        links: &MockLinks,
        ipam: &MockIpam,
        vars: &[(&str, &str)],
        stdin: &str,
    ) -> (bool, Value) {
        let cni = MacvtapCni::new(links, ipam, NetNs::Current);
        let mut stdout = Vec::new();
        let ok = run(&cni, env(vars), stdin.as_bytes(), &mut stdout);
        let value = serde_json::from_slice(&stdout).unwrap_or(Value::Null);
        (ok, value)
    }

    #[test]
    fn version_command() {
        let (ok, value) = invoke(
            &MockLinks::new(),
            &MockIpam::default(),
            &[("CNI_COMMAND", "VERSION")],
            "",
        );
        assert!(ok);
        assert_eq!(value["cniVersion"], json!("1.0.0"));
        assert_eq!(value["supportedVersions"].as_array().map(Vec::len), Some(4));
    }

    #[test]
    fn missing_environment_is_code_4() {
        let (ok, value) = invoke(
            &MockLinks::new(),
            &MockIpam::default(),
            &[("CNI_COMMAND", "ADD"), ("CNI_PATH", "/opt/cni/bin")],
            r#"{"cniVersion":"0.4.0","deviceID":"eth0Mvp0"}"#,
        );
        assert!(!ok);
        assert_eq!(value["code"], json!(4));
        assert_eq!(value["cniVersion"], json!("0.4.0"));
    }

    #[test]
    fn unknown_command_is_code_4() {
        let (ok, value) = invoke(
            &MockLinks::new(),
            &MockIpam::default(),
            &[("CNI_COMMAND", "GC")],
            "",
        );
        assert!(!ok);
        assert_eq!(value["code"], json!(4));
    }

    #[test]
    fn unsupported_version_is_code_1() {
        let (ok, value) = invoke(
            &MockLinks::new(),
            &MockIpam::default(),
            &[
                ("CNI_COMMAND", "DEL"),
                ("CNI_CONTAINERID", "c1"),
                ("CNI_IFNAME", "net1"),
                ("CNI_PATH", "/opt/cni/bin"),
            ],
            r#"{"cniVersion":"0.2.0","deviceID":"eth0Mvp0"}"#,
        );
        assert!(!ok);
        assert_eq!(value["code"], json!(1));
    }

    #[test]
    fn missing_version_is_code_1() {
        let (ok, value) = invoke(
            &MockLinks::new(),
            &MockIpam::default(),
            &[
                ("CNI_COMMAND", "DEL"),
                ("CNI_CONTAINERID", "c1"),
                ("CNI_IFNAME", "net1"),
                ("CNI_PATH", "/opt/cni/bin"),
            ],
            r#"{"deviceID":"eth0Mvp0"}"#,
        );
        assert!(!ok);
        assert_eq!(value["code"], json!(1));
        assert_eq!(value["cniVersion"], json!("1.0.0"));
    }

    #[test]
    fn undecodable_config_is_code_6() {
        let (ok, value) = invoke(
            &MockLinks::new(),
            &MockIpam::default(),
            &[
                ("CNI_COMMAND", "DEL"),
                ("CNI_CONTAINERID", "c1"),
                ("CNI_IFNAME", "net1"),
                ("CNI_PATH", "/opt/cni/bin"),
            ],
            "{",
        );
        assert!(!ok);
        assert_eq!(value["code"], json!(6));
    }

    #[test]
    fn del_without_netns_succeeds_silently() {
        let (ok, value) = invoke(
            &MockLinks::new(),
            &MockIpam::default(),
            &[
                ("CNI_COMMAND", "DEL"),
                ("CNI_CONTAINERID", "c1"),
                ("CNI_IFNAME", "net1"),
                ("CNI_PATH", "/opt/cni/bin"),
            ],
            r#"{"cniVersion":"1.0.0","deviceID":"eth0Mvp0"}"#,
        );
        assert!(ok);
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn add_prints_versioned_result() {
        let links = MockLinks::new();
        links.add_device(&NetNs::Current, "eth0");
        let host_link = links
            .add_macvtap(&NetNs::Current, "eth0Mvp0", "eth0", utils::link::MacvtapMode::Bridge)
            .expect("allocated link");
        let netns = tempfile::NamedTempFile::new().expect("netns handle");
        let netns_path = netns.path().display().to_string();

        let (ok, value) = invoke(
            &links,
            &MockIpam::default(),
            &[
                ("CNI_COMMAND", "ADD"),
                ("CNI_CONTAINERID", "c1"),
                ("CNI_NETNS", &netns_path),
                ("CNI_IFNAME", "net1"),
                ("CNI_PATH", "/opt/cni/bin"),
            ],
            r#"{"cniVersion":"0.3.1","name":"dataplane","type":"macvtap","deviceID":"eth0Mvp0"}"#,
        );
        assert!(ok);
        assert_eq!(
            value,
            json!({
                "cniVersion": "0.3.1",
                "interfaces": [{
                    "name": "net1",
                    "mac": host_link.mac_string(),
                    "sandbox": netns_path,
                }]
            })
        );
    }

    #[test]
    fn add_of_unknown_device_is_code_11() {
        let netns = tempfile::NamedTempFile::new().expect("netns handle");
        let netns_path = netns.path().display().to_string();
        let (ok, value) = invoke(
            &MockLinks::new(),
            &MockIpam::default(),
            &[
                ("CNI_COMMAND", "ADD"),
                ("CNI_CONTAINERID", "c1"),
                ("CNI_NETNS", &netns_path),
                ("CNI_IFNAME", "net1"),
                ("CNI_PATH", "/opt/cni/bin"),
            ],
            r#"{"cniVersion":"1.0.0","deviceID":"eth0Mvp0"}"#,
        );
        assert!(!ok);
        assert_eq!(value["code"], json!(11));
        assert_eq!(
            value["msg"],
            json!("failed to lookup device \"eth0Mvp0\": Link not found")
        );
    }
}
