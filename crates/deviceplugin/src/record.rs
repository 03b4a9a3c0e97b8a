//! Resource configuration and the per-resource record it is published through.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;
use utils::link::MacvtapMode;

/// Capacity used when none (or a non-positive one) is configured.
pub const DEFAULT_CAPACITY: i64 = 100;

/// Largest capacity offered for one resource; larger values are clamped.
pub const MAX_CAPACITY: i64 = 4096;

fn default_capacity() -> i64 {
    DEFAULT_CAPACITY
}

/// One macvtap resource, as found in the JSON configuration array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub name: String,
    #[serde(default)]
    pub lower_device: String,
    #[serde(default)]
    pub mode: MacvtapMode,
    #[serde(default = "default_capacity")]
    pub capacity: i64,
}

impl ResourceConfig {
    /// Default resource for a discovered host link: named after the link and layered on it.
    pub fn for_link(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lower_device: name.to_string(),
            mode: MacvtapMode::default(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Number of devices to offer.
    pub fn effective_capacity(&self) -> usize {
        let capacity = match self.capacity {
            capacity if capacity <= 0 => DEFAULT_CAPACITY,
            capacity if capacity > MAX_CAPACITY => {
                warn!(
                    "capacity {capacity} of {} exceeds {MAX_CAPACITY}, clamping",
                    self.name
                );
                MAX_CAPACITY
            }
            capacity => capacity,
        };
        usize::try_from(capacity).unwrap_or_default()
    }
}

/// Parses a JSON array of resources, keyed by name. Later duplicates win.
pub fn parse_configs(raw: &str) -> Result<BTreeMap<String, ResourceConfig>, serde_json::Error> {
    let configs: Vec<ResourceConfig> = serde_json::from_str(raw)?;
    Ok(configs
        .into_iter()
        .map(|config| (config.name.clone(), config))
        .collect())
}

/// A config together with the number of replacements it has gone through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub generation: u64,
    pub config: ResourceConfig,
}

/// Owner side of a resource's configuration.
///
/// Lives in the lister's record map. Replacing the config bumps the generation
/// and wakes every [`RecordWatch`]; dropping the record retires it, after which
/// watchers keep their last snapshot and see [`RecordWatch::changed`] return
/// `false`.
#[derive(Debug)]
pub struct DeviceRecord {
    tx: watch::Sender<ConfigSnapshot>,
}

impl DeviceRecord {
    pub fn new(config: ResourceConfig) -> Self {
        let (tx, _) = watch::channel(ConfigSnapshot {
            generation: 0,
            config,
        });
        Self { tx }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        self.tx.borrow().clone()
    }

    /// Swaps in `config` if it differs from the current one. Returns whether watchers were notified.
    pub fn replace(&self, config: ResourceConfig) -> bool {
        self.tx.send_if_modified(|current| {
            if current.config == config {
                return false;
            }
            current.config = config;
            current.generation += 1;
            true
        })
    }

    pub fn subscribe(&self) -> RecordWatch {
        RecordWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reader side of a [`DeviceRecord`].
#[derive(Debug, Clone)]
pub struct RecordWatch {
    rx: watch::Receiver<ConfigSnapshot>,
}

impl RecordWatch {
    /// Current snapshot, without marking it as seen.
    pub fn snapshot(&self) -> ConfigSnapshot {
        self.rx.borrow().clone()
    }

    /// Current snapshot, marking it as seen for [`RecordWatch::changed`].
    pub fn current(&mut self) -> ConfigSnapshot {
        self.rx.borrow_and_update().clone()
    }

    /// Waits for a replacement newer than the last one seen. `false` once the record is retired.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn config(name: &str, lower: &str, capacity: i64) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            lower_device: lower.to_string(),
            mode: MacvtapMode::Bridge,
            capacity,
        }
    }

    #[test]
    fn parses_defaults() {
        let configs = parse_configs(
            r#"[{"name":"eth0","lowerDevice":"eth0"},
                {"name":"data","lowerDevice":"bond0","mode":"vepa","capacity":5}]"#,
        )
        .expect("valid config");

        let eth0 = &configs["eth0"];
        assert_eq!(eth0.mode, MacvtapMode::Bridge);
        assert_eq!(eth0.capacity, DEFAULT_CAPACITY);

        let data = &configs["data"];
        assert_eq!(data.mode, MacvtapMode::Vepa);
        assert_eq!(data.effective_capacity(), 5);
    }

    #[test]
    fn non_positive_capacity_falls_back() {
        assert_eq!(config("a", "eth0", 0).effective_capacity(), 100);
        assert_eq!(config("a", "eth0", -3).effective_capacity(), 100);
    }

    #[test]
    fn oversized_capacity_is_clamped() {
        assert_eq!(config("a", "eth0", 4096).effective_capacity(), 4096);
        assert_eq!(config("a", "eth0", 4097).effective_capacity(), 4096);
        assert_eq!(
            config("a", "eth0", i64::MAX).effective_capacity(),
            MAX_CAPACITY as usize
        );
    }

    #[test]
    fn rejects_unknown_mode_and_garbage() {
        assert!(parse_configs(r#"[{"name":"a","mode":"bridg"}]"#).is_err());
        assert!(parse_configs("").is_err());
        assert!(parse_configs("[]").expect("empty array").is_empty());
    }

    #[test(tokio::test)]
    async fn replace_notifies_only_on_change() {
        let record = DeviceRecord::new(config("eth0", "eth0", 2));
        let mut watch = record.subscribe();
        assert_eq!(watch.current().generation, 0);

        assert!(!record.replace(config("eth0", "eth0", 2)));
        assert!(record.replace(config("eth0", "eth1", 4)));

        assert!(watch.changed().await);
        let snapshot = watch.current();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.config, config("eth0", "eth1", 4));
    }

    #[test(tokio::test)]
    async fn retired_record_keeps_last_snapshot() {
        let record = DeviceRecord::new(config("eth0", "eth0", 2));
        let mut watch = record.subscribe();
        record.replace(config("eth0", "eth0", 3));
        drop(record);

        // the pending replacement is still delivered before closure
        assert!(watch.changed().await);
        assert_eq!(watch.current().config.capacity, 3);
        assert!(!watch.changed().await);
        assert_eq!(watch.snapshot().config.capacity, 3);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn readers_never_see_torn_config() {
        let record = Arc::new(DeviceRecord::new(config("r", "dev0", 0)));
        let watch = record.subscribe();

        let writer = {
            let record = record.clone();
            tokio::spawn(async move {
                for i in 1..500 {
                    record.replace(config("r", &format!("dev{i}"), i));
                    tokio::task::yield_now().await;
                }
            })
        };

        let reader = tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while tokio::time::Instant::now() < deadline {
                let snapshot = watch.snapshot();
                let ResourceConfig {
                    lower_device,
                    capacity,
                    ..
                } = snapshot.config;
                assert_eq!(lower_device, format!("dev{capacity}"));
                if capacity == 499 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        writer.await.expect("writer");
        reader.await.expect("reader");
    }
}
