pub mod errors;
pub mod ipam;
pub mod netconf;
pub mod plugin;
pub mod skel;
pub mod types;
