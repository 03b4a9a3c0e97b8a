use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use macvtap_deviceplugin::config::Cli;
use macvtap_deviceplugin::config::PluginConfig;
use macvtap_deviceplugin::lister::MacvtapLister;
use macvtap_deviceplugin::manager::Manager;
use tokio_util::sync::CancellationToken;
use utils::link::IpRoute2;
use utils::link::LinkOps;
use utils::netns::NetNs;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Cancels `token` on SIGTERM or SIGINT.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    utils::logging::init();

    tracing::info!("Starting macvtap device plugin {}", &**version::VERSION);

    // link operations may run on any thread; pin them to the namespace we started in
    let netns = NetNs::main_thread();
    let config = Arc::new(PluginConfig::from_cli(&cli, netns));
    tracing::info!("current config source: {:?}", config.source);

    let links: Arc<dyn LinkOps> = Arc::new(IpRoute2::default());
    let lister = Arc::new(MacvtapLister::new(config.clone(), links));
    let manager = Manager::new(lister, config.device_plugin_path.clone());

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    manager
        .run(token)
        .await
        .map_err(|report| anyhow::anyhow!("{report:?}"))?;

    tracing::info!("macvtap device plugin stopped");
    Ok(())
}
