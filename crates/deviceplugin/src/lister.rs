//! Resource lister: owns the record map and hands out plugins for resource names.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use error_stack::Report;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use utils::link::LinkOps;

use crate::config::ConfigSource;
use crate::config::PluginConfig;
use crate::config::RESOURCE_NAMESPACE;
use crate::errors::DiscoverError;
use crate::plugin::MacvtapDevicePlugin;
use crate::record::DeviceRecord;
use crate::record::ResourceConfig;

pub struct MacvtapLister {
    records: RwLock<HashMap<String, DeviceRecord>>,
    pub(crate) links: Arc<dyn LinkOps>,
    pub(crate) config: Arc<PluginConfig>,
}

impl MacvtapLister {
    pub fn new(config: Arc<PluginConfig>, links: Arc<dyn LinkOps>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            links,
            config,
        }
    }

    pub fn resource_namespace(&self) -> &'static str {
        RESOURCE_NAMESPACE
    }

    /// Publishes resource name sets on `names` until discovery completes or `token` is cancelled.
    ///
    /// Errors are fatal for the process; transient failures are logged and discovery carries on.
    pub async fn discover(
        &self,
        names: mpsc::Sender<Vec<String>>,
        token: CancellationToken,
    ) -> Result<(), Report<DiscoverError>> {
        match &self.config.source {
            ConfigSource::Env { name } => self.discover_from_env(name, &names, &token).await,
            ConfigSource::File { path } => self.discover_from_file(path, &names, &token).await,
        }
    }

    /// Builds the plugin serving `name`, creating a default record layered on a link of the same name if needed.
    pub fn new_plugin(&self, name: &str) -> MacvtapDevicePlugin {
        let record = {
            let mut records = self.write();
            records
                .entry(name.to_string())
                .or_insert_with(|| DeviceRecord::new(ResourceConfig::for_link(name)))
                .subscribe()
        };
        debug!("creating device plugin with config {:?}", record.snapshot());
        MacvtapDevicePlugin::new(
            name.to_string(),
            record,
            self.links.clone(),
            self.config.netns.clone(),
            self.config.sort_devices,
        )
    }

    /// Current config of `name`, if it has a record.
    pub fn config(&self, name: &str) -> Option<ResourceConfig> {
        self.read()
            .get(name)
            .map(|record| record.snapshot().config)
    }

    /// Sorted names of every record.
    pub fn record_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Makes the record map match `configs` and returns the resulting names.
    ///
    /// Changed configs are swapped in and their watchers notified; records not
    /// in `configs` are retired.
    pub(crate) fn reconcile(&self, configs: BTreeMap<String, ResourceConfig>) -> Vec<String> {
        let mut records = self.write();
        records.retain(|name, _| {
            let keep = configs.contains_key(name);
            if !keep {
                info!("retiring resource {name}");
            }
            keep
        });
        for (name, config) in &configs {
            match records.get(name) {
                Some(record) => {
                    if record.replace(config.clone()) {
                        info!("resource {name} updated to {config:?}");
                    }
                }
                None => {
                    records.insert(name.clone(), DeviceRecord::new(config.clone()));
                }
            }
        }
        configs.into_keys().collect()
    }

    /// Creates default records for discovered links that have none, leaving existing ones alone.
    pub(crate) fn adopt_links(&self, names: &[String]) {
        let mut records = self.write();
        for name in names {
            records
                .entry(name.clone())
                .or_insert_with(|| DeviceRecord::new(ResourceConfig::for_link(name)));
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceRecord>> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceRecord>> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
