//! kubelet device plugin API, `v1beta1`.
#![allow(clippy::doc_markdown)]
#![allow(clippy::doc_overindented_list_items)]

tonic::include_proto!("v1beta1");

/// Version string sent with every registration.
pub const VERSION: &str = "v1beta1";

/// Socket kubelet's registration service listens on, inside the device plugin directory.
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// Health value for a device that can be allocated.
pub const HEALTHY: &str = "Healthy";
