//! Plugin lifecycle: one gRPC server per resource name, registered with kubelet.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tower::service_fn;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api;
use crate::api::device_plugin_server::DevicePluginServer;
use crate::api::registration_client::RegistrationClient;
use crate::api::RegisterRequest;
use crate::errors::ManagerError;
use crate::lister::MacvtapLister;
use crate::plugin::MacvtapDevicePlugin;
use crate::service::DevicePluginService;

/// How long a stopping plugin server may take to drain.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningPlugin {
    plugin: Arc<MacvtapDevicePlugin>,
    socket: PathBuf,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

pub struct Manager {
    lister: Arc<MacvtapLister>,
    plugin_dir: PathBuf,
    plugins: HashMap<String, RunningPlugin>,
    /// Last published name set, restarted as a whole when kubelet comes back.
    desired: BTreeSet<String>,
}

impl Manager {
    pub fn new(lister: Arc<MacvtapLister>, plugin_dir: PathBuf) -> Self {
        Self {
            lister,
            plugin_dir,
            plugins: HashMap::new(),
            desired: BTreeSet::new(),
        }
    }

    /// Runs discovery and keeps the served plugins in line with it until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), Report<ManagerError>> {
        let (_kubelet_watcher, mut kubelet_events) = watch_plugin_dir(&self.plugin_dir)?;

        let (names_tx, mut names_rx) = mpsc::channel(1);
        let mut discovery = {
            let lister = self.lister.clone();
            let token = token.child_token();
            tokio::spawn(async move { lister.discover(names_tx, token).await })
        };
        let mut discovery_running = true;
        let mut names_open = true;

        let result = loop {
            select! {
                _ = token.cancelled() => {
                    info!("device plugin manager shutdown requested");
                    break Ok(());
                }
                names = names_rx.recv(), if names_open => match names {
                    Some(names) => self.reconcile(names).await,
                    None => names_open = false,
                },
                joined = &mut discovery, if discovery_running => {
                    discovery_running = false;
                    match joined {
                        Ok(Ok(())) => info!("resource discovery finished"),
                        Ok(Err(report)) => break Err(report.change_context(ManagerError::Discovery)),
                        Err(e) => {
                            break Err(Report::new(ManagerError::Discovery)
                                .attach_printable(format!("discovery task failed: {e}")))
                        }
                    }
                }
                event = kubelet_events.recv() => match event {
                    Some(Ok(event)) if is_kubelet_restart(&event) => {
                        warn!("kubelet socket re-created, re-registering all plugins");
                        self.restart_all().await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => error!("device plugin directory watch error: {e:?}"),
                    None => {
                        break Err(Report::new(ManagerError::Watch {
                            path: self.plugin_dir.clone(),
                        })
                        .attach_printable("watcher event channel closed"))
                    }
                },
            }
        };

        if discovery_running {
            discovery.abort();
        }
        self.stop_all().await;
        result
    }

    /// Starts plugins for new names and stops plugins whose name is gone.
    async fn reconcile(&mut self, names: Vec<String>) {
        let desired: BTreeSet<String> = names.into_iter().collect();
        info!("reconciling plugins to {desired:?}");

        let stale: Vec<String> = self
            .plugins
            .keys()
            .filter(|name| !desired.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            self.stop_plugin(&name).await;
        }

        for name in &desired {
            if self.plugins.contains_key(name) {
                continue;
            }
            if let Err(e) = self.start_plugin(name).await {
                error!("failed to start device plugin {name}: {e:?}");
            }
        }
        self.desired = desired;
    }

    async fn restart_all(&mut self) {
        self.stop_all().await;
        for name in self.desired.clone() {
            if let Err(e) = self.start_plugin(&name).await {
                error!("failed to restart device plugin {name}: {e:?}");
            }
        }
    }

    async fn start_plugin(&mut self, name: &str) -> Result<(), Report<ManagerError>> {
        let plugin = Arc::new(self.lister.new_plugin(name));
        let endpoint = format!("{}_{name}", self.lister.resource_namespace());
        let resource_name = format!("{}/{name}", self.lister.resource_namespace());
        let socket = self.plugin_dir.join(&endpoint);
        let shutdown = CancellationToken::new();

        let server = serve(plugin.clone(), &socket, shutdown.clone())?;
        let request = RegisterRequest {
            version: api::VERSION.to_string(),
            endpoint,
            resource_name: resource_name.clone(),
            options: Some(plugin.options()),
        };
        let running = RunningPlugin {
            plugin,
            socket,
            shutdown,
            server,
        };

        if let Err(e) = register(&self.plugin_dir.join(api::KUBELET_SOCKET), request).await {
            shutdown_plugin(running).await;
            return Err(e);
        }
        info!("device plugin {resource_name} registered with kubelet");
        self.plugins.insert(name.to_string(), running);
        Ok(())
    }

    async fn stop_plugin(&mut self, name: &str) {
        if let Some(running) = self.plugins.remove(name) {
            info!("stopping device plugin {name}");
            shutdown_plugin(running).await;
        }
    }

    async fn stop_all(&mut self) {
        let names: Vec<String> = self.plugins.keys().cloned().collect();
        for name in names {
            self.stop_plugin(&name).await;
        }
    }
}

async fn shutdown_plugin(running: RunningPlugin) {
    let RunningPlugin {
        plugin,
        socket,
        shutdown,
        mut server,
    } = running;

    plugin.stop();
    shutdown.cancel();
    if tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, &mut server)
        .await
        .is_err()
    {
        warn!(
            "device plugin server {} did not drain in {SERVER_SHUTDOWN_TIMEOUT:?}, aborting",
            socket.display()
        );
        server.abort();
    }
    if let Err(e) = std::fs::remove_file(&socket) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove socket {}: {e}", socket.display());
        }
    }
}

/// Binds `socket` and serves `plugin` on it until `shutdown` is cancelled.
fn serve(
    plugin: Arc<MacvtapDevicePlugin>,
    socket: &Path,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, Report<ManagerError>> {
    info!("start device plugin server: {}", socket.display());
    let context = || ManagerError::Serve {
        socket: socket.to_path_buf(),
    };

    // clean up old socket file if it exists
    match std::fs::remove_file(socket) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Report::new(e).change_context(context())),
    }
    let listener = UnixListener::bind(socket).change_context_lazy(context)?;

    let server = DevicePluginServer::new(DevicePluginService::new(plugin));
    let socket = socket.to_path_buf();
    Ok(tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(server)
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::UnixListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await;
        match result {
            Ok(()) => info!("device plugin server {} stopped", socket.display()),
            Err(e) => error!("device plugin server {} failed: {e}", socket.display()),
        }
    }))
}

/// Registers a plugin endpoint with kubelet's registration service.
async fn register(kubelet_socket: &Path, request: RegisterRequest) -> Result<(), Report<ManagerError>> {
    let context = || ManagerError::Register {
        resource_name: request.resource_name.clone(),
    };
    info!(
        "registering {} with kubelet: {}",
        request.resource_name,
        kubelet_socket.display()
    );

    let channel = connect_uds(kubelet_socket.to_path_buf())
        .await
        .change_context_lazy(context)?;
    RegistrationClient::new(channel)
        .register(Request::new(request.clone()))
        .await
        .change_context_lazy(context)?;
    Ok(())
}

/// Opens a gRPC channel over a unix socket.
pub async fn connect_uds(socket: PathBuf) -> Result<Channel, tonic::transport::Error> {
    // the URI is a placeholder, the connector always dials `socket`
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { UnixStream::connect(socket).await.map(TokioIo::new) }
        }))
        .await
}

fn is_kubelet_restart(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name().is_some_and(|name| name == api::KUBELET_SOCKET))
}

fn watch_plugin_dir(
    dir: &Path,
) -> Result<
    (
        RecommendedWatcher,
        mpsc::UnboundedReceiver<Result<Event, notify::Error>>,
    ),
    Report<ManagerError>,
> {
    let context = || ManagerError::Watch {
        path: dir.to_path_buf(),
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let _ = tx.send(res);
        },
        Config::default(),
    )
    .change_context_lazy(context)?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .change_context_lazy(context)?;
    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio::time::timeout;
    use tonic::Response;
    use tonic::Status;
    use utils::link::mock::MockLinks;
    use utils::netns::NetNs;

    use super::*;
    use crate::api::device_plugin_client::DevicePluginClient;
    use crate::api::registration_server::Registration;
    use crate::api::registration_server::RegistrationServer;
    use crate::api::AllocateRequest;
    use crate::api::ContainerAllocateRequest;
    use crate::api::Empty;
    use crate::config::ConfigSource;
    use crate::config::PluginConfig;

    const WAIT: Duration = Duration::from_secs(10);

    #[derive(Clone, Default)]
    struct FakeKubelet {
        registrations: Arc<Mutex<Vec<RegisterRequest>>>,
        notify: Option<mpsc::UnboundedSender<RegisterRequest>>,
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> Result<Response<api::Empty>, Status> {
            let request = request.into_inner();
            self.registrations
                .lock()
                .expect("lock")
                .push(request.clone());
            if let Some(notify) = &self.notify {
                let _ = notify.send(request);
            }
            Ok(Response::new(api::Empty {}))
        }
    }

    fn start_kubelet(
        dir: &Path,
        kubelet: FakeKubelet,
    ) -> (CancellationToken, JoinHandle<()>) {
        let socket = dir.join(api::KUBELET_SOCKET);
        let _ = std::fs::remove_file(&socket);
        let listener = UnixListener::bind(&socket).expect("bind kubelet socket");
        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move {
                tonic::transport::Server::builder()
                    .add_service(RegistrationServer::new(kubelet))
                    .serve_with_incoming_shutdown(
                        tokio_stream::wrappers::UnixListenerStream::new(listener),
                        token.cancelled_owned(),
                    )
                    .await
                    .expect("fake kubelet");
            })
        };
        (token, handle)
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn serves_and_registers_configured_resources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (registered_tx, mut registered) = mpsc::unbounded_channel();
        let kubelet = FakeKubelet {
            notify: Some(registered_tx),
            ..Default::default()
        };
        let (kubelet_token, kubelet_handle) = start_kubelet(dir.path(), kubelet.clone());

        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"[{"name":"dataplane","lowerDevice":"eth0","capacity":2}]"#,
        )
        .expect("write config");

        let links = Arc::new(MockLinks::new());
        links.add_device(&NetNs::Current, "eth0");
        let config = PluginConfig {
            source: ConfigSource::File {
                path: config_path.clone(),
            },
            sort_devices: true,
            device_plugin_path: dir.path().to_path_buf(),
            netns: NetNs::Current,
        };
        let lister = Arc::new(MacvtapLister::new(Arc::new(config), links.clone()));
        let token = CancellationToken::new();
        let manager = {
            let token = token.clone();
            let manager = Manager::new(lister, dir.path().to_path_buf());
            tokio::spawn(async move { manager.run(token).await })
        };

        let request = timeout(WAIT, registered.recv())
            .await
            .expect("registered in time")
            .expect("registration");
        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "macvtap.network.kubevirt.io_dataplane");
        assert_eq!(request.resource_name, "macvtap.network.kubevirt.io/dataplane");
        assert!(
            request
                .options
                .expect("options")
                .get_preferred_allocation_available
        );

        // talk to the plugin the way kubelet does
        let channel = connect_uds(dir.path().join(&request.endpoint))
            .await
            .expect("connect plugin");
        let mut client = DevicePluginClient::new(channel);
        let mut stream = client
            .list_and_watch(Empty {})
            .await
            .expect("list and watch")
            .into_inner();
        let first = timeout(WAIT, stream.message())
            .await
            .expect("device list in time")
            .expect("stream ok")
            .expect("device list");
        let ids: Vec<String> = first.devices.into_iter().map(|d| d.id).collect();
        assert_eq!(
            ids,
            vec!["dataplaneMvp0".to_string(), "dataplaneMvp1".to_string()]
        );

        let allocated = client
            .allocate(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec!["dataplaneMvp1".to_string()],
                }],
            })
            .await
            .expect("allocate")
            .into_inner();
        let link = links
            .link(&NetNs::Current, "dataplaneMvp1")
            .expect("macvtap created");
        assert_eq!(
            allocated.container_responses[0].devices[0].host_path,
            format!("/dev/tap{}", link.index)
        );

        // kubelet restart re-registers
        kubelet_token.cancel();
        kubelet_handle.await.expect("kubelet stopped");
        let (kubelet_token, kubelet_handle) = start_kubelet(dir.path(), kubelet.clone());
        let again = timeout(WAIT, registered.recv())
            .await
            .expect("re-registered in time")
            .expect("registration");
        assert_eq!(again.resource_name, "macvtap.network.kubevirt.io/dataplane");

        token.cancel();
        timeout(WAIT, manager)
            .await
            .expect("manager stops")
            .expect("join")
            .expect("clean stop");
        assert!(!dir
            .path()
            .join("macvtap.network.kubevirt.io_dataplane")
            .exists());

        kubelet_token.cancel();
        kubelet_handle.await.expect("kubelet stopped");
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn removed_resource_is_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kubelet = FakeKubelet::default();
        let (kubelet_token, kubelet_handle) = start_kubelet(dir.path(), kubelet.clone());

        let links = Arc::new(MockLinks::new());
        let config = PluginConfig {
            source: ConfigSource::Env {
                name: "UNUSED".to_string(),
            },
            sort_devices: false,
            device_plugin_path: dir.path().to_path_buf(),
            netns: NetNs::Current,
        };
        let lister = Arc::new(MacvtapLister::new(Arc::new(config), links));
        let mut manager = Manager::new(lister, dir.path().to_path_buf());

        manager
            .reconcile(vec!["a".to_string(), "b".to_string()])
            .await;
        assert!(dir.path().join("macvtap.network.kubevirt.io_a").exists());
        assert!(dir.path().join("macvtap.network.kubevirt.io_b").exists());

        let b = manager.plugins["b"].plugin.clone();
        manager.reconcile(vec!["a".to_string()]).await;
        assert!(b.is_stopped());
        assert!(!dir.path().join("macvtap.network.kubevirt.io_b").exists());
        assert_eq!(manager.plugins.len(), 1);

        let registered: Vec<String> = kubelet
            .registrations
            .lock()
            .expect("lock")
            .iter()
            .map(|r| r.resource_name.clone())
            .collect();
        assert_eq!(registered.len(), 2);

        manager.stop_all().await;
        kubelet_token.cancel();
        kubelet_handle.await.expect("kubelet stopped");
    }

    #[test(tokio::test)]
    async fn registration_failure_leaves_no_plugin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let links = Arc::new(MockLinks::new());
        let config = PluginConfig {
            source: ConfigSource::Env {
                name: "UNUSED".to_string(),
            },
            sort_devices: true,
            device_plugin_path: dir.path().to_path_buf(),
            netns: NetNs::Current,
        };
        let lister = Arc::new(MacvtapLister::new(Arc::new(config), links));
        let mut manager = Manager::new(lister, dir.path().to_path_buf());

        // no kubelet listening
        manager.reconcile(vec!["a".to_string()]).await;
        assert!(manager.plugins.is_empty());
        assert!(!dir.path().join("macvtap.network.kubevirt.io_a").exists());
    }
}
