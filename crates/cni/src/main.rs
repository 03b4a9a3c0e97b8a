use std::process::ExitCode;

use macvtap_cni::ipam::ExecIpam;
use macvtap_cni::plugin::MacvtapCni;
use macvtap_cni::skel;
use utils::link::IpRoute2;
use utils::netns::NetNs;
use utils::version;

/// Log destination override; stdout carries the CNI result.
const LOG_FILE_ENV: &str = "MACVTAP_CNI_LOG_FILE";
const DEFAULT_LOG_FILE: &str = "/opt/cni/bin/macvtap.log";

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

fn main() -> ExitCode {
    setup_global_hooks();

    let log_file = std::env::var(LOG_FILE_ENV).unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string());
    let _guard = utils::logging::init_file(&log_file);
    tracing::debug!("macvtap CNI {}", &**version::VERSION);

    let links = IpRoute2::default();
    let ipam = ExecIpam::default();
    let cni = MacvtapCni::new(&links, &ipam, NetNs::Current);

    let ok = skel::run(
        &cni,
        |name| std::env::var(name).ok(),
        std::io::stdin().lock(),
        std::io::stdout().lock(),
    );
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
