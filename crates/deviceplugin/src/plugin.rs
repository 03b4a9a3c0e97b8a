//! Per-resource macvtap device plugin.

use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::link::Link;
use utils::link::LinkEvent;
use utils::link::LinkEvents;
use utils::link::LinkOps;
use utils::netns::NetNs;

use crate::api;
use crate::api::AllocateRequest;
use crate::api::AllocateResponse;
use crate::api::ContainerAllocateResponse;
use crate::api::ContainerPreferredAllocationResponse;
use crate::api::DevicePluginOptions;
use crate::api::DeviceSpec;
use crate::api::ListAndWatchResponse;
use crate::api::PreferredAllocationRequest;
use crate::api::PreferredAllocationResponse;
use crate::errors::PluginError;
use crate::record::RecordWatch;
use crate::record::ResourceConfig;

/// Device ids are `<name><DEVICE_SUFFIX><i>`.
pub const DEVICE_SUFFIX: &str = "Mvp";
/// Character device prefix; the link index completes the path.
pub const TAP_PATH: &str = "/dev/tap";

pub struct MacvtapDevicePlugin {
    name: String,
    record: RecordWatch,
    links: Arc<dyn LinkOps>,
    netns: NetNs,
    preferred_allocation: bool,
    stop: CancellationToken,
}

impl MacvtapDevicePlugin {
    pub fn new(
        name: String,
        record: RecordWatch,
        links: Arc<dyn LinkOps>,
        netns: NetNs,
        preferred_allocation: bool,
    ) -> Self {
        Self {
            name,
            record,
            links,
            netns,
            preferred_allocation,
            stop: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> &RecordWatch {
        &self.record
    }

    pub fn options(&self) -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: self.preferred_allocation,
        }
    }

    /// Stops every running device watch. Only the first call has an effect; later ones return `false`.
    pub fn stop(&self) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.stop.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Healthy devices `<name>Mvp0` up to the configured capacity.
    pub fn generate_devices(config: &ResourceConfig) -> Vec<api::Device> {
        (0..config.effective_capacity())
            .map(|i| api::Device {
                id: format!("{}{DEVICE_SUFFIX}{i}", config.name),
                health: api::HEALTHY.to_string(),
                topology: None,
            })
            .collect()
    }

    /// Devices to advertise for `config`: all of them when the lower device exists, none otherwise.
    ///
    /// `None` when the lower device could not be checked; nothing should be sent then.
    pub async fn advertised_devices(&self, config: &ResourceConfig) -> Option<Vec<api::Device>> {
        let links = self.links.clone();
        let netns = self.netns.clone();
        let lower_device = config.lower_device.clone();
        let exists = tokio::task::spawn_blocking(move || links.exists(&netns, &lower_device)).await;

        match exists {
            Ok(Ok(true)) => {
                debug!(
                    "lower device {} exists, offering {} devices",
                    config.lower_device,
                    config.effective_capacity()
                );
                Some(Self::generate_devices(config))
            }
            Ok(Ok(false)) => {
                debug!("lower device {} does not exist, offering no devices", config.lower_device);
                Some(Vec::new())
            }
            Ok(Err(e)) => {
                warn!("error while checking on lower device {}: {e}", config.lower_device);
                None
            }
            Err(e) => {
                warn!("lower device check for {} failed: {e}", config.lower_device);
                None
            }
        }
    }

    /// Streams device lists into `tx` until the plugin is stopped or the receiver goes away.
    ///
    /// A list is sent on start, on every event of the lower device, and after each
    /// record update. A retired record leaves the last config in place.
    pub async fn watch_devices(&self, tx: mpsc::Sender<Result<ListAndWatchResponse, Status>>) {
        let mut record = self.record.clone();
        let mut record_open = true;

        loop {
            let config = record.current().config;
            let mut events = match self.subscribe_links().await {
                Ok(events) => Some(events),
                Err(e) => {
                    warn!("failed to subscribe to link events for {}: {e:?}", config.lower_device);
                    None
                }
            };
            if !self.send_devices(&config, &tx).await {
                return;
            }

            loop {
                select! {
                    biased;
                    _ = self.stop.cancelled() => {
                        drop(events);
                        warn!(
                            "stop device plugin name: {}, lower device: {}",
                            self.name, config.lower_device
                        );
                        return;
                    }
                    _ = tx.closed() => {
                        debug!("device list consumer of {} went away", self.name);
                        return;
                    }
                    changed = record.changed(), if record_open => {
                        if changed {
                            break;
                        }
                        info!("record of {} retired, keeping last configuration", self.name);
                        record_open = false;
                    }
                    event = next_event(&mut events) => match event {
                        Some(LinkEvent { name, .. }) if name == config.lower_device => {
                            if !self.send_devices(&config, &tx).await {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => {
                            warn!("link event stream for {} ended", config.lower_device);
                            events = None;
                        }
                    },
                }
            }
        }
    }

    async fn send_devices(
        &self,
        config: &ResourceConfig,
        tx: &mpsc::Sender<Result<ListAndWatchResponse, Status>>,
    ) -> bool {
        let Some(devices) = self.advertised_devices(config).await else {
            return true;
        };
        // a stalled consumer must not hold off stop
        select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = tx.send(Ok(ListAndWatchResponse { devices })) => sent.is_ok(),
        }
    }

    async fn subscribe_links(&self) -> Result<LinkEvents, Report<PluginError>> {
        let links = self.links.clone();
        let netns = self.netns.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || links.subscribe(&netns))
            .await
            .change_context(PluginError::Subscribe { name: name.clone() })?
            .change_context(PluginError::Subscribe { name })
    }

    /// Creates a fresh macvtap interface for every requested device id.
    ///
    /// Devices are created one by one; a failure aborts the request and leaves
    /// interfaces created before it in place for the next allocation to reset.
    pub async fn allocate(
        &self,
        request: AllocateRequest,
    ) -> Result<AllocateResponse, Report<PluginError>> {
        info!(
            "assign macvtap network devices: {:?}",
            request.container_requests
        );

        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        for container in request.container_requests {
            let mut devices = Vec::with_capacity(container.devices_ids.len());
            for device in container.devices_ids {
                let link = self.create_macvtap(device).await?;
                let path = format!("{TAP_PATH}{}", link.index);
                devices.push(DeviceSpec {
                    container_path: path.clone(),
                    host_path: path,
                    permissions: "rw".to_string(),
                });
            }
            container_responses.push(ContainerAllocateResponse {
                devices,
                ..Default::default()
            });
        }

        info!("network device allocation successful: {container_responses:?}");
        Ok(AllocateResponse {
            container_responses,
        })
    }

    async fn create_macvtap(&self, device: String) -> Result<Link, Report<PluginError>> {
        // one snapshot per device, never a torn config
        let config = self.record.snapshot().config;
        let context = PluginError::CreateDevice {
            device: device.clone(),
            lower_device: config.lower_device.clone(),
        };
        info!(
            "create macvtap link {device} on {} in {} mode",
            config.lower_device, config.mode
        );

        let links = self.links.clone();
        let netns = self.netns.clone();
        let link = tokio::task::spawn_blocking(move || {
            links.recreate_macvtap(&netns, &device, &config.lower_device, config.mode)
        })
        .await
        .change_context_lazy(|| context.clone())?
        .change_context(context)?;
        Ok(link)
    }

    /// Prefers the lexicographically lowest available ids for each container.
    pub fn preferred_allocation(
        request: &PreferredAllocationRequest,
    ) -> Result<PreferredAllocationResponse, Report<PluginError>> {
        info!(
            "preferred allocation requested: {:?}",
            request.container_requests
        );

        let container_responses = request
            .container_requests
            .iter()
            .map(|container| {
                debug!(
                    "available: {:?}, must include: {:?}, size: {}",
                    container.available_device_i_ds,
                    container.must_include_device_i_ds,
                    container.allocation_size
                );
                let mut available = container.available_device_i_ds.clone();
                let size = usize::try_from(container.allocation_size)
                    .ok()
                    .filter(|size| *size <= available.len())
                    .ok_or_else(|| {
                        Report::new(PluginError::AllocationSize {
                            requested: container.allocation_size,
                            available: available.len(),
                        })
                    })?;
                available.sort();
                available.truncate(size);
                Ok(ContainerPreferredAllocationResponse {
                    device_i_ds: available,
                })
            })
            .collect::<Result<Vec<_>, Report<PluginError>>>()?;

        Ok(PreferredAllocationResponse {
            container_responses,
        })
    }
}

async fn next_event(events: &mut Option<LinkEvents>) -> Option<LinkEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
