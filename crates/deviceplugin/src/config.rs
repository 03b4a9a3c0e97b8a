use std::path::PathBuf;

use clap::Parser;
use utils::netns::NetNs;
use utils::version;

/// Prefix of every resource name advertised to kubelet.
pub const RESOURCE_NAMESPACE: &str = "macvtap.network.kubevirt.io";
/// Environment variable carrying the JSON configuration, unless overridden.
pub const CONFIG_ENV_VAR: &str = "DP_MACVTAP_CONF";
pub const DEFAULT_CONFIG_PATH: &str = "/macvtap-deviceplugin-config/DP_MACVTAP_CONF";
pub const DEFAULT_DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// Kubelet device plugin handing out macvtap interfaces.
#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        default_value = CONFIG_ENV_VAR,
        help = "Environment variable holding the resource configuration"
    )]
    pub env_name: String,

    #[arg(
        long,
        default_value = DEFAULT_CONFIG_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Configuration file watched when the environment variable is not defined"
    )]
    pub config_path: PathBuf,

    #[arg(
        long,
        help = "Advertise preferred allocation, handing out the lowest sorted device ids",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub sort_devices: bool,

    #[arg(
        long,
        env = "DP_DEVICE_PLUGIN_PATH",
        default_value = DEFAULT_DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding kubelet.sock and the plugin sockets"
    )]
    pub device_plugin_path: PathBuf,
}

/// Where resource configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read once from an environment variable.
    Env { name: String },
    /// Read from a file, re-read whenever it changes.
    File { path: PathBuf },
}

/// Immutable process configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub source: ConfigSource,
    pub sort_devices: bool,
    pub device_plugin_path: PathBuf,
    /// Namespace every host link operation runs in.
    pub netns: NetNs,
}

impl PluginConfig {
    /// Picks the environment variable when it is defined, even if empty, and the watched file otherwise.
    pub fn from_cli(cli: &Cli, netns: NetNs) -> Self {
        let source = if std::env::var_os(&cli.env_name).is_some() {
            ConfigSource::Env {
                name: cli.env_name.clone(),
            }
        } else {
            tracing::warn!(
                "environment variable {} not found, watching {} instead",
                cli.env_name,
                cli.config_path.display()
            );
            ConfigSource::File {
                path: cli.config_path.clone(),
            }
        };

        Self {
            source,
            sort_devices: cli.sort_devices,
            device_plugin_path: cli.device_plugin_path.clone(),
            netns,
        }
    }
}
