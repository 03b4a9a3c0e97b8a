//! gRPC adapter exposing a [`MacvtapDevicePlugin`] to kubelet.

use std::pin::Pin;
use std::sync::Arc;

use error_stack::Report;
use futures::Stream;
use tokio::sync::mpsc;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::api::device_plugin_server::DevicePlugin;
use crate::api::AllocateRequest;
use crate::api::AllocateResponse;
use crate::api::DevicePluginOptions;
use crate::api::Empty;
use crate::api::ListAndWatchResponse;
use crate::api::PreStartContainerRequest;
use crate::api::PreStartContainerResponse;
use crate::api::PreferredAllocationRequest;
use crate::api::PreferredAllocationResponse;
use crate::errors::PluginError;
use crate::plugin::MacvtapDevicePlugin;

#[derive(Clone)]
pub struct DevicePluginService {
    device_plugin: Arc<MacvtapDevicePlugin>,
}

impl DevicePluginService {
    pub fn new(device_plugin: Arc<MacvtapDevicePlugin>) -> Self {
        Self { device_plugin }
    }
}

fn to_status(report: Report<PluginError>) -> Status {
    error!("{report:?}");
    match report.current_context() {
        PluginError::AllocationSize { .. } => Status::invalid_argument(report.to_string()),
        _ => Status::internal(format!("{report:#}")),
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(self.device_plugin.options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch devices of {}", self.device_plugin.name());

        let (tx, rx) = mpsc::channel(4);
        let device_plugin = self.device_plugin.clone();
        tokio::spawn(async move {
            device_plugin.watch_devices(tx).await;
            info!("device watch of {} stopped", device_plugin.name());
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        MacvtapDevicePlugin::preferred_allocation(&request.into_inner())
            .map(Response::new)
            .map_err(to_status)
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        self.device_plugin
            .allocate(request.into_inner())
            .await
            .map(Response::new)
            .map_err(to_status)
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
