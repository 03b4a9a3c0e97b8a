use core::error::Error;
use std::path::PathBuf;

/// Failures while turning configuration or host state into resource names.
#[derive(Debug, derive_more::Display)]
pub enum DiscoverError {
    #[display("Failed to read configuration from environment variable {name}")]
    ConfigEnv { name: String },
    #[display("Failed to read configuration file {}", path.display())]
    ConfigFile { path: PathBuf },
    #[display("Failed to watch configuration file {}", path.display())]
    Watch { path: PathBuf },
    #[display("Failed to discover host links: {message}")]
    Links { message: String },
}

impl Error for DiscoverError {}

/// Failures answering kubelet requests.
#[derive(Debug, Clone, derive_more::Display)]
pub enum PluginError {
    #[display("Failed to subscribe to link events for {name}")]
    Subscribe { name: String },
    #[display("Failed to create macvtap device {device} on {lower_device}")]
    CreateDevice {
        device: String,
        lower_device: String,
    },
    #[display("Cannot prefer {requested} devices out of {available} available")]
    AllocationSize { requested: i32, available: usize },
}

impl Error for PluginError {}

/// Failures serving plugins to kubelet.
#[derive(Debug, derive_more::Display)]
pub enum ManagerError {
    #[display("Failed to serve device plugin on {}", socket.display())]
    Serve { socket: PathBuf },
    #[display("Failed to register {resource_name} with kubelet")]
    Register { resource_name: String },
    #[display("Failed to watch device plugin directory {}", path.display())]
    Watch { path: PathBuf },
    #[display("Resource discovery failed")]
    Discovery,
}

impl Error for ManagerError {}
