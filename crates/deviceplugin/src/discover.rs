//! Discovery modes: static environment config, watched config file, host links.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use notify::event::ModifyKind;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::link::LinkEvents;
use utils::link::LinkOps;
use utils::netns::NetNs;

use crate::errors::DiscoverError;
use crate::lister::MacvtapLister;
use crate::record::parse_configs;

/// Pause before re-arming the watch on a renamed or removed config file.
const REARM_DELAY: Duration = Duration::from_secs(1);

/// What a config file event asks discovery to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileChange {
    Reload,
    Rearm,
    Ignore,
}

fn classify(kind: &EventKind) -> FileChange {
    match kind {
        EventKind::Create(_) => FileChange::Reload,
        EventKind::Modify(ModifyKind::Name(_)) => FileChange::Rearm,
        EventKind::Modify(ModifyKind::Metadata(_)) => FileChange::Ignore,
        EventKind::Modify(_) => FileChange::Reload,
        EventKind::Remove(_) => FileChange::Rearm,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => FileChange::Ignore,
    }
}

/// Sends `names` to the manager. `false` once the manager has gone away.
async fn publish(tx: &mpsc::Sender<Vec<String>>, names: Vec<String>) -> bool {
    debug!("publishing resources {names:?}");
    tx.send(names).await.is_ok()
}

impl MacvtapLister {
    pub(crate) async fn discover_from_env(
        &self,
        env_name: &str,
        tx: &mpsc::Sender<Vec<String>>,
        token: &CancellationToken,
    ) -> Result<(), Report<DiscoverError>> {
        let raw = std::env::var(env_name).change_context(DiscoverError::ConfigEnv {
            name: env_name.to_string(),
        })?;
        let configs = parse_configs(&raw).change_context(DiscoverError::ConfigEnv {
            name: env_name.to_string(),
        })?;
        info!("read configuration {configs:?}");

        if configs.is_empty() {
            return self.discover_from_links(tx, token, true).await;
        }

        // static configuration, nothing left to watch
        let names = self.reconcile(configs);
        publish(tx, names).await;
        Ok(())
    }

    pub(crate) async fn discover_from_file(
        &self,
        path: &Path,
        tx: &mpsc::Sender<Vec<String>>,
        token: &CancellationToken,
    ) -> Result<(), Report<DiscoverError>> {
        'arm: loop {
            let (_watcher, mut events) = watch_file(path)?;
            // every (re)arm must yield a usable configuration
            self.reload_file(path, tx, token).await?;

            loop {
                select! {
                    _ = token.cancelled() => {
                        info!("config file discovery shutdown requested");
                        return Ok(());
                    }
                    event = events.recv() => {
                        let Some(event) = event else {
                            return Err(Report::new(DiscoverError::Watch {
                                path: path.to_path_buf(),
                            })
                            .attach_printable("watcher event channel closed"));
                        };
                        match event {
                            Ok(event) => match classify(&event.kind) {
                                FileChange::Reload => {
                                    if let Err(e) = self.reload_file(path, tx, token).await {
                                        error!("failed to reload configuration: {e:?}");
                                    }
                                }
                                FileChange::Rearm => {
                                    warn!("{} renamed or removed, re-arming watcher", path.display());
                                    break;
                                }
                                FileChange::Ignore => {}
                            },
                            Err(e) => error!("config file watch error: {e:?}"),
                        }
                    }
                }
            }

            select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(REARM_DELAY) => continue 'arm,
            }
        }
    }

    /// Reads the config file and publishes its resources, falling back to a single link scan when it lists none.
    async fn reload_file(
        &self,
        path: &Path,
        tx: &mpsc::Sender<Vec<String>>,
        token: &CancellationToken,
    ) -> Result<(), Report<DiscoverError>> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .change_context(DiscoverError::ConfigFile {
                path: path.to_path_buf(),
            })?;
        let configs = parse_configs(&raw).change_context(DiscoverError::ConfigFile {
            path: path.to_path_buf(),
        })?;
        info!("read configuration {configs:?}");

        let names = self.reconcile(configs);
        if names.is_empty() {
            return self.discover_from_links(tx, token, false).await;
        }
        publish(tx, names).await;
        Ok(())
    }

    /// Publishes suitable host links as resources; with `keep_running`, republishes on every link event.
    pub(crate) async fn discover_from_links(
        &self,
        tx: &mpsc::Sender<Vec<String>>,
        token: &CancellationToken,
        keep_running: bool,
    ) -> Result<(), Report<DiscoverError>> {
        let mut events = if keep_running {
            Some(self.subscribe_host_links().await?)
        } else {
            None
        };

        // an initial scan catches permanent runtime problems early
        let names = self.find_suitable_parents().await?;
        self.adopt_links(&names);
        if !publish(tx, names).await {
            return Ok(());
        }
        let Some(events) = events.as_mut() else {
            return Ok(());
        };

        loop {
            select! {
                _ = token.cancelled() => {
                    info!("link discovery shutdown requested");
                    return Ok(());
                }
                _ = tx.closed() => return Ok(()),
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(Report::new(DiscoverError::Links {
                            message: "link event stream closed".to_string(),
                        }));
                    };
                    debug!("link event {event:?}");
                    match self.find_suitable_parents().await {
                        Ok(names) => {
                            self.adopt_links(&names);
                            if !publish(tx, names).await {
                                return Ok(());
                            }
                        }
                        Err(e) => error!("failed to find suitable macvtap parents: {e:?}"),
                    }
                }
            }
        }
    }

    async fn find_suitable_parents(&self) -> Result<Vec<String>, Report<DiscoverError>> {
        let (links, netns) = (self.links.clone(), self.config.netns.clone());
        run_blocking(links, netns, |links, netns| {
            links.suitable_macvtap_parents(netns)
        })
        .await
    }

    async fn subscribe_host_links(&self) -> Result<LinkEvents, Report<DiscoverError>> {
        let (links, netns) = (self.links.clone(), self.config.netns.clone());
        run_blocking(links, netns, |links, netns| links.subscribe(netns)).await
    }
}

/// Runs a link operation off the async workers.
async fn run_blocking<T, F>(
    links: Arc<dyn LinkOps>,
    netns: NetNs,
    f: F,
) -> Result<T, Report<DiscoverError>>
where
    T: Send + 'static,
    F: FnOnce(&dyn LinkOps, &NetNs) -> Result<T, utils::link::LinkError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || f(links.as_ref(), &netns))
        .await
        .change_context(DiscoverError::Links {
            message: "link task failed".to_string(),
        })?;
    result.change_context(DiscoverError::Links {
        message: "link operation failed".to_string(),
    })
}

/// Starts watching `path`, forwarding its events into a tokio channel.
fn watch_file(
    path: &Path,
) -> Result<
    (
        RecommendedWatcher,
        mpsc::UnboundedReceiver<Result<Event, notify::Error>>,
    ),
    Report<DiscoverError>,
> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            // receiver gone means discovery stopped
            let _ = tx.send(res);
        },
        Config::default(),
    )
    .change_context(DiscoverError::Watch {
        path: path.to_path_buf(),
    })?;
    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .change_context(DiscoverError::Watch {
            path: path.to_path_buf(),
        })?;
    info!("watching configuration file {}", path.display());
    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use notify::event::CreateKind;
    use notify::event::DataChange;
    use notify::event::MetadataKind;
    use notify::event::RemoveKind;
    use notify::event::RenameMode;
    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio::time::timeout;
    use utils::link::mock::MockLinks;
    use utils::link::LinkEventKind;
    use utils::link::MacvtapMode;

    use super::*;
    use crate::config::ConfigSource;
    use crate::lister::tests::lister_with;

    const WAIT: Duration = Duration::from_secs(10);

    async fn next(rx: &mut mpsc::Receiver<Vec<String>>) -> Vec<String> {
        timeout(WAIT, rx.recv())
            .await
            .expect("names published in time")
            .expect("discovery still running")
    }

    fn host_links() -> Arc<MockLinks> {
        let links = Arc::new(MockLinks::new());
        links.add_device(&NetNs::Current, "eth0");
        links.add_device(&NetNs::Current, "eth1");
        links
    }

    #[test]
    fn file_event_classification() {
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            FileChange::Reload
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            FileChange::Reload
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(
                MetadataKind::Permissions
            ))),
            FileChange::Ignore
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            FileChange::Rearm
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            FileChange::Rearm
        );
    }

    #[test(tokio::test)]
    async fn env_config_is_published_once() {
        let name = "MACVTAP_TEST_DISCOVER_ENV_STATIC";
        std::env::set_var(
            name,
            r#"[{"name":"data","lowerDevice":"eth0","mode":"vepa","capacity":4}]"#,
        );
        let lister = lister_with(
            ConfigSource::Env {
                name: name.to_string(),
            },
            host_links(),
        );
        let (tx, mut rx) = mpsc::channel(4);

        lister
            .discover(tx, CancellationToken::new())
            .await
            .expect("static discovery");

        assert_eq!(next(&mut rx).await, vec!["data".to_string()]);
        assert!(rx.recv().await.is_none());
        let config = lister.config("data").expect("record");
        assert_eq!(config.mode, MacvtapMode::Vepa);
        assert_eq!(config.capacity, 4);
    }

    #[test(tokio::test)]
    async fn malformed_env_config_is_fatal() {
        let name = "MACVTAP_TEST_DISCOVER_ENV_BROKEN";
        std::env::set_var(name, "not json");
        let lister = lister_with(
            ConfigSource::Env {
                name: name.to_string(),
            },
            host_links(),
        );
        let (tx, _rx) = mpsc::channel(4);
        assert!(lister.discover(tx, CancellationToken::new()).await.is_err());
    }

    #[test(tokio::test)]
    async fn empty_env_config_follows_host_links() {
        let name = "MACVTAP_TEST_DISCOVER_ENV_EMPTY";
        std::env::set_var(name, "[]");
        let links = host_links();
        let lister = Arc::new(lister_with(
            ConfigSource::Env {
                name: name.to_string(),
            },
            links.clone(),
        ));
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();

        let task = {
            let lister = lister.clone();
            let token = token.clone();
            tokio::spawn(async move { lister.discover(tx, token).await })
        };

        assert_eq!(
            next(&mut rx).await,
            vec!["eth0".to_string(), "eth1".to_string()]
        );
        assert_eq!(
            lister.config("eth1").expect("adopted"),
            crate::record::ResourceConfig::for_link("eth1")
        );

        links.add_device(&NetNs::Current, "eth2");
        assert_eq!(
            next(&mut rx).await,
            vec!["eth0".to_string(), "eth1".to_string(), "eth2".to_string()]
        );

        links.remove(&NetNs::Current, "eth0");
        let names: BTreeSet<String> = next(&mut rx).await.into_iter().collect();
        assert!(!names.contains("eth0"));

        // unrelated events trigger a rescan too
        links.emit(&NetNs::Current, "eth1", LinkEventKind::Changed);
        assert_eq!(
            next(&mut rx).await,
            vec!["eth1".to_string(), "eth2".to_string()]
        );

        token.cancel();
        timeout(WAIT, task)
            .await
            .expect("discovery stops")
            .expect("join")
            .expect("clean stop");
    }

    #[test(tokio::test)]
    async fn link_scan_failure_is_fatal() {
        let name = "MACVTAP_TEST_DISCOVER_ENV_LINKS_FAIL";
        std::env::set_var(name, "[]");
        let links = host_links();
        links.fail("list");
        let lister = lister_with(
            ConfigSource::Env {
                name: name.to_string(),
            },
            links,
        );
        let (tx, _rx) = mpsc::channel(4);
        assert!(lister.discover(tx, CancellationToken::new()).await.is_err());
    }

    #[test(tokio::test)]
    async fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lister = lister_with(
            ConfigSource::File {
                path: dir.path().join("absent.json"),
            },
            host_links(),
        );
        let (tx, _rx) = mpsc::channel(4);
        assert!(lister.discover(tx, CancellationToken::new()).await.is_err());
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn file_changes_are_followed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("DP_MACVTAP_CONF");
        std::fs::write(
            &path,
            r#"[{"name":"a","lowerDevice":"eth0"},{"name":"b","lowerDevice":"eth1"}]"#,
        )
        .expect("write config");

        let lister = Arc::new(lister_with(
            ConfigSource::File { path: path.clone() },
            host_links(),
        ));
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let task = {
            let lister = lister.clone();
            let token = token.clone();
            tokio::spawn(async move { lister.discover(tx, token).await })
        };

        assert_eq!(next(&mut rx).await, vec!["a".to_string(), "b".to_string()]);
        let mut a = lister.new_plugin("a").record().clone();
        a.current();

        std::fs::write(&path, r#"[{"name":"a","lowerDevice":"eth1","capacity":7}]"#)
            .expect("rewrite config");

        // a write may surface as several events; wait for the settled set
        loop {
            if next(&mut rx).await == vec!["a".to_string()] {
                break;
            }
        }
        assert!(timeout(WAIT, a.changed()).await.expect("notified"));
        let config = a.current().config;
        assert_eq!(config.lower_device, "eth1");
        assert_eq!(config.capacity, 7);
        assert_eq!(lister.record_names(), vec!["a".to_string()]);

        token.cancel();
        timeout(WAIT, task)
            .await
            .expect("discovery stops")
            .expect("join")
            .expect("clean stop");
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn replaced_file_rearms_watch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("DP_MACVTAP_CONF");
        std::fs::write(&path, r#"[{"name":"a","lowerDevice":"eth0"}]"#).expect("write config");

        let lister = Arc::new(lister_with(
            ConfigSource::File { path: path.clone() },
            host_links(),
        ));
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let task = {
            let lister = lister.clone();
            let token = token.clone();
            tokio::spawn(async move { lister.discover(tx, token).await })
        };
        assert_eq!(next(&mut rx).await, vec!["a".to_string()]);

        // atomic replace, the way projected volumes update
        let staged = dir.path().join("staged");
        std::fs::write(&staged, r#"[{"name":"c","lowerDevice":"eth1"}]"#).expect("stage");
        std::fs::rename(&staged, &path).expect("replace");

        loop {
            if next(&mut rx).await == vec!["c".to_string()] {
                break;
            }
        }

        token.cancel();
        timeout(WAIT, task)
            .await
            .expect("discovery stops")
            .expect("join")
            .expect("clean stop");
    }

    #[test(tokio::test)]
    async fn empty_file_publishes_links_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("DP_MACVTAP_CONF");
        std::fs::write(&path, "[]").expect("write config");
        let links = host_links();
        let lister = Arc::new(lister_with(
            ConfigSource::File { path: path.clone() },
            links.clone(),
        ));
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let task = {
            let lister = lister.clone();
            let token = token.clone();
            tokio::spawn(async move { lister.discover(tx, token).await })
        };

        assert_eq!(
            next(&mut rx).await,
            vec!["eth0".to_string(), "eth1".to_string()]
        );
        // no link subscription in this mode
        assert_eq!(links.subscriber_count(), 0);

        token.cancel();
        timeout(WAIT, task)
            .await
            .expect("discovery stops")
            .expect("join")
            .expect("clean stop");
    }
}
